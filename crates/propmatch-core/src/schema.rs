//! Domain field schema.
//!
//! A `DomainSchema` is the raw, deserialized per-domain configuration: the
//! preference fields the assistant extracts, their weights for lead scoring,
//! the injection gate, and how listings are displayed. It is validated once
//! into an immutable [`FieldSchema`], which is the only form the pipeline
//! accepts.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PropmatchError, Result};

/// How a raw extracted value is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Choice,
    Integer,
    RangeNumber,
    List,
}

/// A score band for `range_number` fields: values at or above `at_least`
/// normalize to `score`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RangeBand {
    pub at_least: u64,
    pub score: f64,
}

/// One preference field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    /// Label shown to the LLM when preferences are echoed into prompts.
    #[serde(default)]
    pub label: String,
    /// Contribution of this field to the lead score.
    #[serde(default)]
    pub weight: f64,
    /// Instruction fragment describing how to extract this field.
    #[serde(default)]
    pub extraction_prompt: String,
    /// Allowed values for `choice` fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
    /// Normalized score per choice (lowercase keys); missing choices score 1.0.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scores: BTreeMap<String, f64>,
    /// Score bands for `range_number` fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bands: Vec<RangeBand>,
}

impl FieldSpec {
    /// Label to display, falling back to the field name.
    pub fn display_label(&self) -> &str {
        if self.label.trim().is_empty() {
            &self.name
        } else {
            &self.label
        }
    }
}

/// Lead score cut-offs. `hot >= warm >= 0`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeadThresholds {
    pub hot: f64,
    pub warm: f64,
}

impl Default for LeadThresholds {
    fn default() -> Self {
        Self { hot: 3.0, warm: 1.0 }
    }
}

/// Minimum preference coverage before retrieved listings may be injected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionRule {
    /// Fields that must all be populated.
    pub required_fields: Vec<String>,
    /// Minimum number of populated fields overall.
    pub min_populated: usize,
}

impl Default for InjectionRule {
    fn default() -> Self {
        Self {
            required_fields: vec![
                "location".to_string(),
                "budget".to_string(),
                "urgency".to_string(),
            ],
            min_populated: 3,
        }
    }
}

/// How a listing attribute is rendered into the prompt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DisplayField {
    pub key: String,
    pub label: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    /// `"number"` groups digits with commas.
    #[serde(default)]
    pub format: Option<String>,
}

/// Raw domain schema as loaded from TOML.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DomainSchema {
    pub name: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub extraction_preamble: String,
    #[serde(default)]
    pub thresholds: LeadThresholds,
    #[serde(default)]
    pub injection: InjectionRule,
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub display_fields: Vec<DisplayField>,
}

impl DomainSchema {
    /// Read a schema from a TOML file without validating it.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let schema: DomainSchema =
            toml::from_str(&content).map_err(|e| PropmatchError::Schema(e.to_string()))?;
        info!(domain = %schema.name, "Schema loaded from {}", path.display());
        Ok(schema)
    }

    /// Check every structural rule and freeze the schema.
    pub fn validate(self) -> Result<FieldSchema> {
        if self.name.trim().is_empty() {
            return Err(schema_err("domain name must not be empty"));
        }
        if self.fields.is_empty() {
            return Err(schema_err("at least one field is required"));
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            validate_field(field)?;
            if !seen.insert(field.name.as_str()) {
                return Err(schema_err(format!("duplicate field '{}'", field.name)));
            }
        }

        let (hot, warm) = (self.thresholds.hot, self.thresholds.warm);
        if !hot.is_finite() || !warm.is_finite() || warm < 0.0 || hot < warm {
            return Err(schema_err(format!(
                "thresholds must satisfy hot >= warm >= 0 (hot={}, warm={})",
                hot, warm
            )));
        }

        for required in &self.injection.required_fields {
            if !seen.contains(required.as_str()) {
                return Err(schema_err(format!(
                    "injection requires unknown field '{}'",
                    required
                )));
            }
        }
        if self.injection.min_populated > self.fields.len() {
            return Err(schema_err(format!(
                "injection.min_populated ({}) exceeds the number of fields ({})",
                self.injection.min_populated,
                self.fields.len()
            )));
        }

        if self.display_fields.iter().any(|d| d.key.trim().is_empty()) {
            return Err(schema_err("display field keys must not be empty"));
        }

        Ok(FieldSchema {
            inner: Arc::new(self),
        })
    }
}

fn validate_field(field: &FieldSpec) -> Result<()> {
    if field.name.trim().is_empty() {
        return Err(schema_err("field names must not be empty"));
    }
    if !field.weight.is_finite() || field.weight < 0.0 {
        return Err(schema_err(format!(
            "field '{}' has invalid weight {}",
            field.name, field.weight
        )));
    }

    match field.kind {
        FieldKind::Choice => {
            if field.choices.is_empty() {
                return Err(schema_err(format!(
                    "choice field '{}' has no choices",
                    field.name
                )));
            }
            let lowered: HashSet<String> =
                field.choices.iter().map(|c| c.trim().to_lowercase()).collect();
            for (choice, score) in &field.scores {
                if !lowered.contains(&choice.trim().to_lowercase()) {
                    return Err(schema_err(format!(
                        "field '{}' scores unknown choice '{}'",
                        field.name, choice
                    )));
                }
                check_unit_score(&field.name, *score)?;
            }
        }
        FieldKind::RangeNumber => {
            for band in &field.bands {
                check_unit_score(&field.name, band.score)?;
            }
        }
        _ => {}
    }

    if field.kind != FieldKind::Choice && !field.choices.is_empty() {
        return Err(schema_err(format!(
            "field '{}' declares choices but is not a choice field",
            field.name
        )));
    }
    if field.kind != FieldKind::RangeNumber && !field.bands.is_empty() {
        return Err(schema_err(format!(
            "field '{}' declares bands but is not a range_number field",
            field.name
        )));
    }

    Ok(())
}

fn check_unit_score(field: &str, score: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&score) {
        return Err(schema_err(format!(
            "field '{}' has score {} outside [0, 1]",
            field, score
        )));
    }
    Ok(())
}

fn schema_err(msg: impl Into<String>) -> PropmatchError {
    PropmatchError::Schema(msg.into())
}

/// A validated, immutable domain schema. Cheap to clone.
#[derive(Clone, Debug)]
pub struct FieldSchema {
    inner: Arc<DomainSchema>,
}

impl FieldSchema {
    /// Load and validate a schema file.
    pub fn load(path: &Path) -> Result<Self> {
        DomainSchema::load(path)?.validate()
    }

    /// The built-in real-estate schema.
    pub fn real_estate() -> Result<Self> {
        DomainSchema::default().validate()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.inner.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.inner.fields.iter().find(|f| f.name == name)
    }

    pub fn thresholds(&self) -> &LeadThresholds {
        &self.inner.thresholds
    }

    pub fn injection(&self) -> &InjectionRule {
        &self.inner.injection
    }

    pub fn display_fields(&self) -> &[DisplayField] {
        &self.inner.display_fields
    }

    pub fn system_prompt(&self) -> &str {
        &self.inner.system_prompt
    }

    pub fn extraction_preamble(&self) -> &str {
        &self.inner.extraction_preamble
    }

    pub fn raw(&self) -> &DomainSchema {
        &self.inner
    }
}

impl Default for DomainSchema {
    fn default() -> Self {
        Self {
            name: "real_estate".to_string(),
            system_prompt: "You are a friendly estate agent assistant helping a buyer find a home. \
                Keep replies short. Only describe properties that appear in the listings you are \
                given, and never invent addresses, prices or listing ids. If no listings are \
                provided, ask about the buyer's preferences instead."
                .to_string(),
            extraction_preamble: "Extract the buyer's property preferences from the message below. \
                Respond with a single JSON object whose keys are field names. Each value is either \
                the extracted value or an object {\"value\": ..., \"confidence\": 0.0-1.0, \
                \"evidence\": \"quoted words\"}. Omit fields the message does not mention."
                .to_string(),
            thresholds: LeadThresholds::default(),
            injection: InjectionRule::default(),
            fields: vec![
                FieldSpec {
                    name: "location".to_string(),
                    kind: FieldKind::Text,
                    label: "Preferred location".to_string(),
                    weight: 1.0,
                    extraction_prompt: "Town, city or area the buyer wants to live in.".to_string(),
                    choices: vec![],
                    scores: BTreeMap::new(),
                    bands: vec![],
                },
                FieldSpec {
                    name: "budget".to_string(),
                    kind: FieldKind::RangeNumber,
                    label: "Budget".to_string(),
                    weight: 1.0,
                    extraction_prompt: "Price range in pounds, e.g. \"<400000\" or \"250000-300000\"."
                        .to_string(),
                    choices: vec![],
                    scores: BTreeMap::new(),
                    bands: vec![
                        RangeBand { at_least: 100_000, score: 0.5 },
                        RangeBand { at_least: 250_000, score: 1.0 },
                    ],
                },
                FieldSpec {
                    name: "bedrooms".to_string(),
                    kind: FieldKind::Integer,
                    label: "Bedrooms".to_string(),
                    weight: 0.5,
                    extraction_prompt: "Number of bedrooms wanted.".to_string(),
                    choices: vec![],
                    scores: BTreeMap::new(),
                    bands: vec![],
                },
                FieldSpec {
                    name: "property_type".to_string(),
                    kind: FieldKind::Choice,
                    label: "Property type".to_string(),
                    weight: 0.5,
                    extraction_prompt: "One of: flat, house, bungalow.".to_string(),
                    choices: vec!["flat".to_string(), "house".to_string(), "bungalow".to_string()],
                    scores: BTreeMap::new(),
                    bands: vec![],
                },
                FieldSpec {
                    name: "urgency".to_string(),
                    kind: FieldKind::Choice,
                    label: "Urgency".to_string(),
                    weight: 1.5,
                    extraction_prompt: "How soon the buyer needs to move: high, medium or low."
                        .to_string(),
                    choices: vec!["high".to_string(), "medium".to_string(), "low".to_string()],
                    scores: [
                        ("high".to_string(), 1.0),
                        ("medium".to_string(), 0.5),
                        ("low".to_string(), 0.0),
                    ]
                    .into_iter()
                    .collect(),
                    bands: vec![],
                },
                FieldSpec {
                    name: "features".to_string(),
                    kind: FieldKind::List,
                    label: "Must-have features".to_string(),
                    weight: 0.25,
                    extraction_prompt: "Features the buyer asked for, e.g. garden, parking."
                        .to_string(),
                    choices: vec![],
                    scores: BTreeMap::new(),
                    bands: vec![],
                },
            ],
            display_fields: vec![
                DisplayField {
                    key: "id".to_string(),
                    label: "Listing ID".to_string(),
                    prefix: String::new(),
                    suffix: String::new(),
                    format: None,
                },
                DisplayField {
                    key: "address".to_string(),
                    label: "Address".to_string(),
                    prefix: String::new(),
                    suffix: String::new(),
                    format: None,
                },
                DisplayField {
                    key: "price".to_string(),
                    label: "Price".to_string(),
                    prefix: "£".to_string(),
                    suffix: String::new(),
                    format: Some("number".to_string()),
                },
                DisplayField {
                    key: "bedrooms".to_string(),
                    label: "Bedrooms".to_string(),
                    prefix: String::new(),
                    suffix: String::new(),
                    format: None,
                },
            ],
        }
    }
}
