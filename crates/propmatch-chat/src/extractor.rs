//! LLM-backed extraction of a typed preference patch from a user message.
//!
//! The extractor asks the LLM for a JSON object keyed by schema field
//! names, then sanitizes each value according to the field's kind. Any
//! failure along the way yields an empty patch: extraction never fails a
//! turn.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use propmatch_core::{FieldKind, FieldSchema, FieldSpec, FieldValue, ListingId, UserMetadata};

use crate::llm::{CompletionOptions, LlmClient, LlmError, Prompt};
use crate::money::amounts_in;

/// One proposed field update.
#[derive(Clone, Debug, PartialEq)]
pub struct PatchEntry {
    pub value: FieldValue,
    /// Extractor confidence in [0, 1].
    pub confidence: f32,
    /// Words in the message that support the value, when the LLM gave them.
    pub evidence: Option<String>,
}

impl PatchEntry {
    pub fn certain(value: FieldValue) -> Self {
        Self {
            value,
            confidence: 1.0,
            evidence: None,
        }
    }
}

/// A partial update to user metadata, keyed by field name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetadataPatch {
    entries: BTreeMap<String, PatchEntry>,
}

impl MetadataPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: impl Into<String>, entry: PatchEntry) {
        self.entries.insert(field.into(), entry);
    }

    /// Builder form of [`insert`](Self::insert) with full confidence.
    pub fn with(mut self, field: impl Into<String>, value: FieldValue) -> Self {
        self.insert(field, PatchEntry::certain(value));
        self
    }

    pub fn get(&self, field: &str) -> Option<&PatchEntry> {
        self.entries.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PatchEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Why an extraction attempt produced nothing.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("extraction LLM call failed: {0}")]
    Llm(#[from] LlmError),
    #[error("extraction timed out after {0} ms")]
    Timeout(u64),
    #[error("no JSON object in extraction output")]
    NoJson,
    #[error("invalid extraction JSON: {0}")]
    InvalidJson(String),
}

/// Extracts preference patches from user messages.
pub struct MetadataExtractor {
    llm: Arc<dyn LlmClient>,
    schema: FieldSchema,
    options: CompletionOptions,
    timeout: Duration,
    min_confidence: f32,
}

impl MetadataExtractor {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        schema: FieldSchema,
        options: CompletionOptions,
        timeout: Duration,
        min_confidence: f32,
    ) -> Self {
        Self {
            llm,
            schema,
            options,
            timeout,
            min_confidence,
        }
    }

    /// Extract a patch, absorbing every failure into an empty patch.
    pub async fn extract(
        &self,
        text: &str,
        metadata: &UserMetadata,
        shown: &BTreeSet<ListingId>,
    ) -> MetadataPatch {
        match self.try_extract(text, metadata, shown).await {
            Ok(patch) => {
                debug!(fields = patch.len(), "Metadata patch extracted");
                patch
            }
            Err(e) => {
                warn!(error = %e, "Metadata extraction failed, continuing with empty patch");
                MetadataPatch::new()
            }
        }
    }

    pub async fn try_extract(
        &self,
        text: &str,
        metadata: &UserMetadata,
        shown: &BTreeSet<ListingId>,
    ) -> Result<MetadataPatch, ExtractionError> {
        let prompt = self.build_prompt(text, metadata, shown);
        let raw = tokio::time::timeout(self.timeout, self.llm.complete(&prompt, &self.options))
            .await
            .map_err(|_| ExtractionError::Timeout(self.timeout.as_millis() as u64))??;
        self.parse_patch(&raw)
    }

    /// The single system message sent to the extraction model.
    pub fn build_prompt(
        &self,
        text: &str,
        metadata: &UserMetadata,
        shown: &BTreeSet<ListingId>,
    ) -> Prompt {
        let mut lines = vec![self.schema.extraction_preamble().to_string(), String::new()];

        lines.push("Fields:".to_string());
        for field in self.schema.fields() {
            let mut line = format!("- {} ({}): {}", field.name, kind_name(field.kind), field.extraction_prompt);
            if !field.choices.is_empty() {
                line.push_str(&format!(" Allowed values: {}.", field.choices.join(", ")));
            }
            lines.push(line);
        }

        if metadata.populated_count() > 0 {
            lines.push(String::new());
            lines.push("Already confirmed:".to_string());
            for field in self.schema.fields() {
                if let Some(value) = metadata.get(&field.name) {
                    lines.push(format!("- {}: {}", field.name, value.display()));
                }
            }
        }

        if !shown.is_empty() {
            lines.push(String::new());
            let ids: Vec<&str> = shown.iter().map(|id| id.as_str()).collect();
            lines.push(format!("Listings already shown to the user: {}", ids.join(", ")));
        }

        lines.push(String::new());
        lines.push(format!("User message:\n\"\"\"\n{}\n\"\"\"", text));

        Prompt::new().system(lines.join("\n"))
    }

    /// Parse raw LLM output into a patch. Unknown fields, unsanitizable
    /// values and low-confidence entries are dropped.
    pub fn parse_patch(&self, raw: &str) -> Result<MetadataPatch, ExtractionError> {
        let json = first_json_object(raw).ok_or(ExtractionError::NoJson)?;
        let object: serde_json::Map<String, Value> =
            serde_json::from_str(json).map_err(|e| ExtractionError::InvalidJson(e.to_string()))?;

        let mut patch = MetadataPatch::new();
        for (key, raw_value) in object {
            let Some(spec) = self.schema.field(&key) else {
                debug!(field = %key, "Ignoring field not in schema");
                continue;
            };

            let (value, confidence, evidence) = match raw_value {
                Value::Object(ref obj) if obj.contains_key("value") => (
                    obj.get("value").cloned().unwrap_or(Value::Null),
                    obj.get("confidence")
                        .and_then(Value::as_f64)
                        .map(|c| c.clamp(0.0, 1.0) as f32)
                        .unwrap_or(1.0),
                    obj.get("evidence").and_then(Value::as_str).map(str::to_string),
                ),
                other => (other, 1.0, None),
            };

            if confidence < self.min_confidence {
                debug!(field = %key, confidence, "Dropping low-confidence patch entry");
                continue;
            }

            match sanitize(spec, &value) {
                Some(value) => patch.insert(
                    key,
                    PatchEntry {
                        value,
                        confidence,
                        evidence,
                    },
                ),
                None => debug!(field = %key, "Dropping value that does not fit the field kind"),
            }
        }
        Ok(patch)
    }
}

fn kind_name(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Text => "text",
        FieldKind::Choice => "choice",
        FieldKind::Integer => "integer",
        FieldKind::RangeNumber => "price range",
        FieldKind::List => "list",
    }
}

/// Locate the first balanced JSON object in `text`, skipping Markdown
/// fences and any prose around it.
fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

// =============================================================================
// Sanitizers
// =============================================================================

/// Convert a raw extracted JSON value into the field's typed value.
/// Returns `None` when the value does not fit the field kind.
pub fn sanitize(spec: &FieldSpec, raw: &Value) -> Option<FieldValue> {
    let value = match spec.kind {
        FieldKind::Text => sanitize_text(raw),
        FieldKind::Choice => sanitize_choice(raw, &spec.choices),
        FieldKind::Integer => sanitize_integer(raw),
        FieldKind::RangeNumber => sanitize_range(raw),
        FieldKind::List => sanitize_list(raw),
    }?;
    (!value.is_empty()).then_some(value)
}

fn sanitize_text(raw: &Value) -> Option<FieldValue> {
    match raw {
        Value::String(s) => Some(FieldValue::Text(s.trim().to_string())),
        Value::Number(n) => Some(FieldValue::Text(n.to_string())),
        _ => None,
    }
}

fn sanitize_choice(raw: &Value, choices: &[String]) -> Option<FieldValue> {
    let s = match raw {
        Value::String(s) => s.as_str(),
        Value::Array(items) => items.first()?.as_str()?,
        _ => return None,
    };
    let s = s.trim();
    choices
        .iter()
        .find(|c| c.eq_ignore_ascii_case(s))
        .map(|c| FieldValue::Text(c.clone()))
}

fn sanitize_integer(raw: &Value) -> Option<FieldValue> {
    match raw {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .map(FieldValue::Integer),
        Value::String(s) => {
            let digits: String = s
                .trim()
                .chars()
                .skip_while(|c| !c.is_ascii_digit())
                .take_while(|c| c.is_ascii_digit())
                .collect();
            digits.parse().ok().map(FieldValue::Integer)
        }
        _ => None,
    }
}

const MIN_MARKERS: &[&str] = &[">", ">=", "over", "from", "at least", "min", "minimum", "above", "more than"];

fn sanitize_range(raw: &Value) -> Option<FieldValue> {
    match raw {
        Value::Number(n) => {
            let v = n.as_f64().filter(|f| *f >= 100.0)?.round() as u64;
            Some(FieldValue::Range { min: None, max: Some(v) })
        }
        Value::String(s) => range_from_text(s),
        Value::Object(obj) => {
            let bound = |key: &str| -> Option<u64> {
                match obj.get(key)? {
                    Value::Number(n) => n.as_f64().map(|f| f.round() as u64),
                    Value::String(s) => amounts_in(s).first().map(|a| a.value),
                    _ => None,
                }
            };
            Some(FieldValue::Range {
                min: bound("min"),
                max: bound("max"),
            })
        }
        _ => None,
    }
}

fn range_from_text(text: &str) -> Option<FieldValue> {
    let amounts = amounts_in(text);
    match amounts.as_slice() {
        [] => None,
        [only] => {
            let prefix = text[..only.start].trim_end().to_lowercase();
            let is_min = MIN_MARKERS.iter().any(|m| prefix.ends_with(m));
            Some(if is_min {
                FieldValue::Range { min: Some(only.value), max: None }
            } else {
                FieldValue::Range { min: None, max: Some(only.value) }
            })
        }
        [a, b, ..] => Some(FieldValue::Range {
            min: Some(a.value.min(b.value)),
            max: Some(a.value.max(b.value)),
        }),
    }
}

fn sanitize_list(raw: &Value) -> Option<FieldValue> {
    let items: Vec<String> = match raw {
        Value::Array(items) => items
            .iter()
            .filter_map(|i| match i {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        Value::String(s) => s.split(',').map(str::to_string).collect(),
        _ => return None,
    };

    let mut out: Vec<String> = Vec::new();
    for item in items {
        let item = item.trim();
        if !item.is_empty() && !out.iter().any(|o| o.eq_ignore_ascii_case(item)) {
            out.push(item.to_string());
        }
    }
    Some(FieldValue::List(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use propmatch_core::ConversationId;
    use serde_json::json;

    struct FixedLlm(Result<&'static str, ()>);

    #[async_trait]
    impl LlmClient for FixedLlm {
        async fn complete(&self, _prompt: &Prompt, _options: &CompletionOptions) -> Result<String, LlmError> {
            self.0.map(str::to_string).map_err(|_| LlmError::Http("connection refused".into()))
        }
    }

    struct SlowLlm;

    #[async_trait]
    impl LlmClient for SlowLlm {
        async fn complete(&self, _prompt: &Prompt, _options: &CompletionOptions) -> Result<String, LlmError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("{}".into())
        }
    }

    fn extractor(llm: impl LlmClient + 'static) -> MetadataExtractor {
        MetadataExtractor::new(
            Arc::new(llm),
            FieldSchema::real_estate().unwrap(),
            CompletionOptions::default(),
            Duration::from_millis(200),
            0.5,
        )
    }

    fn spec(name: &str) -> FieldSpec {
        FieldSchema::real_estate().unwrap().field(name).unwrap().clone()
    }

    fn empty_meta() -> UserMetadata {
        UserMetadata::initial(ConversationId::new("c-1"))
    }

    #[test]
    fn test_sanitize_range() {
        let budget = spec("budget");
        assert_eq!(
            sanitize(&budget, &json!("under £400k")),
            Some(FieldValue::Range { min: None, max: Some(400_000) })
        );
        assert_eq!(
            sanitize(&budget, &json!("300,000-250,000")),
            Some(FieldValue::Range { min: Some(250_000), max: Some(300_000) })
        );
        assert_eq!(
            sanitize(&budget, &json!("at least 350000")),
            Some(FieldValue::Range { min: Some(350_000), max: None })
        );
        assert_eq!(
            sanitize(&budget, &json!(">£500,000")),
            Some(FieldValue::Range { min: Some(500_000), max: None })
        );
        assert_eq!(
            sanitize(&budget, &json!(450000)),
            Some(FieldValue::Range { min: None, max: Some(450_000) })
        );
        assert_eq!(
            sanitize(&budget, &json!({"min": 200000, "max": "£260k"})),
            Some(FieldValue::Range { min: Some(200_000), max: Some(260_000) })
        );
        assert_eq!(sanitize(&budget, &json!("cheap")), None);
        assert_eq!(sanitize(&budget, &json!(12)), None);
    }

    #[test]
    fn test_sanitize_choice() {
        let urgency = spec("urgency");
        assert_eq!(
            sanitize(&urgency, &json!(" HIGH ")),
            Some(FieldValue::Text("high".into()))
        );
        assert_eq!(sanitize(&urgency, &json!("asap")), None);
        assert_eq!(sanitize(&urgency, &json!(["low", "high"])), Some(FieldValue::Text("low".into())));
    }

    #[test]
    fn test_sanitize_integer_text_list() {
        assert_eq!(sanitize(&spec("bedrooms"), &json!(2)), Some(FieldValue::Integer(2)));
        assert_eq!(sanitize(&spec("bedrooms"), &json!("3 bed")), Some(FieldValue::Integer(3)));
        assert_eq!(sanitize(&spec("bedrooms"), &json!("some")), None);

        assert_eq!(
            sanitize(&spec("location"), &json!("  Manchester ")),
            Some(FieldValue::Text("Manchester".into()))
        );
        assert_eq!(sanitize(&spec("location"), &json!("   ")), None);
        assert_eq!(sanitize(&spec("location"), &json!(null)), None);

        assert_eq!(
            sanitize(&spec("features"), &json!("garden, parking ,Garden,")),
            Some(FieldValue::List(vec!["garden".into(), "parking".into()]))
        );
        assert_eq!(sanitize(&spec("features"), &json!([])), None);
    }

    #[test]
    fn test_first_json_object() {
        assert_eq!(first_json_object("```json\n{\"a\": 1}\n```"), Some("{\"a\": 1}"));
        assert_eq!(
            first_json_object("Sure! Here it is: {\"a\": {\"b\": \"}\"}} trailing"),
            Some("{\"a\": {\"b\": \"}\"}}")
        );
        assert_eq!(first_json_object("no json here"), None);
        assert_eq!(first_json_object("{ unterminated"), None);
    }

    #[test]
    fn test_parse_patch_mixed_forms() {
        let ex = extractor(FixedLlm(Ok("{}")));
        let raw = r#"Here you go:
```json
{
  "location": "Manchester",
  "budget": {"value": "up to 400k", "confidence": 0.9, "evidence": "under 400k"},
  "bedrooms": {"value": 2, "confidence": 0.2},
  "pets": "cat",
  "urgency": "whenever"
}
```"#;
        let patch = ex.parse_patch(raw).unwrap();
        assert_eq!(patch.len(), 2);
        assert_eq!(patch.get("location").unwrap().value, FieldValue::Text("Manchester".into()));
        let budget = patch.get("budget").unwrap();
        assert_eq!(budget.value, FieldValue::Range { min: None, max: Some(400_000) });
        assert!((budget.confidence - 0.9).abs() < 1e-6);
        assert_eq!(budget.evidence.as_deref(), Some("under 400k"));
        assert!(patch.get("bedrooms").is_none());
        assert!(patch.get("pets").is_none());
    }

    #[test]
    fn test_parse_patch_errors() {
        let ex = extractor(FixedLlm(Ok("{}")));
        assert!(matches!(ex.parse_patch("nothing"), Err(ExtractionError::NoJson)));
        assert!(matches!(
            ex.parse_patch("{\"location\": }"),
            Err(ExtractionError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_build_prompt_contents() {
        let ex = extractor(FixedLlm(Ok("{}")));
        let mut meta = empty_meta();
        meta.fields.insert("location".into(), FieldValue::Text("Leeds".into()));
        let shown: BTreeSet<ListingId> = [ListingId::new("LST-1001")].into_iter().collect();

        let prompt = ex.build_prompt("Something bigger please", &meta, &shown);
        assert_eq!(prompt.len(), 1);
        let text = prompt.text();
        assert!(text.contains("- urgency (choice)"));
        assert!(text.contains("Allowed values: high, medium, low."));
        assert!(text.contains("- location: Leeds"));
        assert!(text.contains("LST-1001"));
        assert!(text.contains("Something bigger please"));
    }

    #[tokio::test]
    async fn test_extract_success() {
        let ex = extractor(FixedLlm(Ok(r#"{"location": "York", "urgency": "medium"}"#)));
        let patch = ex.extract("York, fairly soon", &empty_meta(), &BTreeSet::new()).await;
        assert_eq!(patch.len(), 2);
    }

    #[tokio::test]
    async fn test_extract_failures_yield_empty_patch() {
        let ex = extractor(FixedLlm(Err(())));
        assert!(ex.extract("hi", &empty_meta(), &BTreeSet::new()).await.is_empty());

        let ex = extractor(FixedLlm(Ok("I could not find anything")));
        assert!(ex.extract("hi", &empty_meta(), &BTreeSet::new()).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_extract_timeout_yields_empty_patch() {
        let ex = extractor(SlowLlm);
        assert!(matches!(
            ex.try_extract("hi", &empty_meta(), &BTreeSet::new()).await,
            Err(ExtractionError::Timeout(200))
        ));
        assert!(ex.extract("hi", &empty_meta(), &BTreeSet::new()).await.is_empty());
    }
}
