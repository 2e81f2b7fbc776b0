//! Preference reconciliation and lead classification.
//!
//! The reconciler is the only writer of [`UserMetadata`]. Merging is
//! idempotent: applying the same patch twice changes nothing the second
//! time, so the version only moves on real changes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use propmatch_core::schema::InjectionRule;
use propmatch_core::{FieldKind, FieldSchema, FieldSpec, FieldValue, LeadClass, UserMetadata};

use crate::extractor::MetadataPatch;

/// Outcome of applying a patch.
#[derive(Clone, Debug, PartialEq)]
pub struct Reconciliation {
    pub metadata: UserMetadata,
    /// Whether any field or the lead class changed.
    pub changed: bool,
}

/// Scores preferences against the schema weights and thresholds.
#[derive(Clone, Debug)]
pub struct LeadClassifier {
    schema: FieldSchema,
}

impl LeadClassifier {
    pub fn new(schema: FieldSchema) -> Self {
        Self { schema }
    }

    /// Weighted sum of normalized field values. Fields not in the schema
    /// and empty values contribute nothing.
    pub fn score(&self, fields: &BTreeMap<String, FieldValue>) -> f64 {
        self.schema
            .fields()
            .iter()
            .filter_map(|spec| {
                let value = fields.get(&spec.name).filter(|v| !v.is_empty())?;
                Some(spec.weight * normalized_value(spec, value))
            })
            .sum()
    }

    pub fn classify(&self, fields: &BTreeMap<String, FieldValue>) -> LeadClass {
        let score = self.score(fields);
        let thresholds = self.schema.thresholds();
        if score >= thresholds.hot {
            LeadClass::Hot
        } else if score >= thresholds.warm {
            LeadClass::Warm
        } else {
            LeadClass::Cold
        }
    }
}

/// A populated value mapped into [0, 1] according to its field kind.
pub fn normalized_value(spec: &FieldSpec, value: &FieldValue) -> f64 {
    match (spec.kind, value) {
        (FieldKind::Choice, FieldValue::Text(choice)) => spec
            .scores
            .get(&choice.to_lowercase())
            .copied()
            .unwrap_or(1.0),
        (FieldKind::RangeNumber, FieldValue::Range { min, max }) => {
            if spec.bands.is_empty() {
                return 1.0;
            }
            let Some(amount) = max.or(*min) else {
                return 0.0;
            };
            spec.bands
                .iter()
                .filter(|b| b.at_least <= amount)
                .map(|b| b.score)
                .fold(0.0, f64::max)
        }
        _ => 1.0,
    }
}

/// Merges patches into metadata and recomputes the lead class.
#[derive(Clone, Debug)]
pub struct MetadataReconciler {
    schema: FieldSchema,
    classifier: LeadClassifier,
}

impl MetadataReconciler {
    pub fn new(schema: FieldSchema) -> Self {
        Self {
            classifier: LeadClassifier::new(schema.clone()),
            schema,
        }
    }

    pub fn classifier(&self) -> &LeadClassifier {
        &self.classifier
    }

    /// Apply `patch` to `current`. Empty patch values never erase stored
    /// values; list values are unioned; everything else overwrites.
    pub fn reconcile(
        &self,
        current: &UserMetadata,
        patch: &MetadataPatch,
        now: DateTime<Utc>,
    ) -> Reconciliation {
        let mut metadata = current.clone();
        let mut changed_fields = Vec::new();

        for (name, entry) in patch.iter() {
            if self.schema.field(name).is_none() || entry.value.is_empty() {
                continue;
            }

            let merged = match (metadata.fields.get(name), &entry.value) {
                (Some(FieldValue::List(existing)), FieldValue::List(incoming)) => {
                    FieldValue::List(union(existing, incoming))
                }
                _ => entry.value.clone(),
            };

            if metadata.fields.get(name) != Some(&merged) {
                metadata.fields.insert(name.clone(), merged);
                changed_fields.push(name.as_str());
            }
        }

        let lead_class = self.classifier.classify(&metadata.fields);
        let changed = !changed_fields.is_empty() || lead_class != current.lead_class;

        if changed {
            metadata.lead_class = lead_class;
            metadata.version = current.version + 1;
            metadata.last_updated = Some(now);
            debug!(
                fields = ?changed_fields,
                lead_class = %lead_class,
                version = metadata.version,
                "Metadata reconciled"
            );
        }

        Reconciliation { metadata, changed }
    }
}

fn union(existing: &[String], incoming: &[String]) -> Vec<String> {
    let mut out = existing.to_vec();
    for item in incoming {
        if !out.iter().any(|o| o.eq_ignore_ascii_case(item)) {
            out.push(item.clone());
        }
    }
    out
}

/// Whether metadata carries enough signal for listings to be injected:
/// every required field is populated and enough fields are populated overall.
pub fn has_sufficient_signal(rule: &InjectionRule, metadata: &UserMetadata) -> bool {
    rule.required_fields.iter().all(|f| metadata.is_populated(f))
        && metadata.populated_count() >= rule.min_populated
}
