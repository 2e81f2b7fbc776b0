use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Identifiers
// =============================================================================

/// Identifies one conversation (one end user talking to the assistant).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// External identifier of a listing in the vector index (e.g. `LST-1001`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingId(String);

impl ListingId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ListingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ListingId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// =============================================================================
// Conversation turns
// =============================================================================

/// Who authored a turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// One persisted message in a conversation. Immutable once stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: Uuid,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Listings injected into the prompt that produced this turn.
    /// Always empty for user turns.
    #[serde(default)]
    pub listing_ids: BTreeSet<ListingId>,
}

impl ConversationTurn {
    /// Build a user turn stamped with the given time.
    pub fn user(conversation_id: ConversationId, text: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            role: Role::User,
            text: text.into(),
            timestamp: at,
            listing_ids: BTreeSet::new(),
        }
    }

    /// Build an assistant turn referencing the listings that were shown.
    pub fn assistant(
        conversation_id: ConversationId,
        text: impl Into<String>,
        at: DateTime<Utc>,
        listing_ids: BTreeSet<ListingId>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            role: Role::Assistant,
            text: text.into(),
            timestamp: at,
            listing_ids,
        }
    }
}

// =============================================================================
// User metadata
// =============================================================================

/// A typed preference value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Range { min: Option<u64>, max: Option<u64> },
    List(Vec<String>),
}

impl FieldValue {
    /// Whether the value carries no information (blank text, empty list,
    /// open range). Empty values never overwrite stored preferences.
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::Integer(_) => false,
            FieldValue::Range { min, max } => min.is_none() && max.is_none(),
            FieldValue::List(items) => items.iter().all(|i| i.trim().is_empty()),
        }
    }

    /// Human-readable rendering used in prompts and CLI output.
    pub fn display(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Integer(n) => n.to_string(),
            FieldValue::Range { min, max } => match (min, max) {
                (Some(lo), Some(hi)) => format!("£{}–£{}", group_thousands(*lo), group_thousands(*hi)),
                (None, Some(hi)) => format!("up to £{}", group_thousands(*hi)),
                (Some(lo), None) => format!("from £{}", group_thousands(*lo)),
                (None, None) => String::new(),
            },
            FieldValue::List(items) => items.join(", "),
        }
    }
}

/// Format an integer with comma thousands separators (`400000` → `400,000`).
pub fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Coarse buyer-readiness classification.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LeadClass {
    #[default]
    Cold,
    Warm,
    Hot,
}

impl LeadClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadClass::Cold => "Cold",
            LeadClass::Warm => "Warm",
            LeadClass::Hot => "Hot",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Cold" => Some(LeadClass::Cold),
            "Warm" => Some(LeadClass::Warm),
            "Hot" => Some(LeadClass::Hot),
            _ => None,
        }
    }
}

impl fmt::Display for LeadClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single current preference record for a conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserMetadata {
    pub conversation_id: ConversationId,
    pub fields: BTreeMap<String, FieldValue>,
    pub lead_class: LeadClass,
    /// Incremented by every reconciliation that changes a field.
    pub version: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

impl UserMetadata {
    /// The record a conversation starts with before any preference is known.
    pub fn initial(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            fields: BTreeMap::new(),
            lead_class: LeadClass::Cold,
            version: 0,
            last_updated: None,
        }
    }

    /// Look up a populated field.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name).filter(|v| !v.is_empty())
    }

    pub fn is_populated(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn populated_count(&self) -> usize {
        self.fields.values().filter(|v| !v.is_empty()).count()
    }
}

// =============================================================================
// Listings
// =============================================================================

/// A listing as stored in the vector index. Not owned by the chat pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ListingReference {
    pub id: ListingId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vector: Vec<f32>,
    pub listed_at: DateTime<Utc>,
    /// Display attributes (address, price, bedrooms, ...), keyed by name.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl ListingReference {
    /// String attribute, if present.
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }

    /// Numeric attribute; accepts JSON numbers and numeric strings such as
    /// `"£350,000"`.
    pub fn attribute_u64(&self, key: &str) -> Option<u64> {
        match self.attributes.get(key)? {
            serde_json::Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64)),
            serde_json::Value::String(s) => {
                let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
                digits.parse().ok()
            }
            _ => None,
        }
    }
}

/// A listing returned by a similarity search.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoredListing {
    pub listing: ListingReference,
    pub score: f64,
}

// =============================================================================
// Grounding
// =============================================================================

/// Outcome of checking a generated reply against the listings shown.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum GroundingVerdict {
    Safe,
    Risky { offending_claim: String },
}

impl GroundingVerdict {
    pub fn is_safe(&self) -> bool {
        matches!(self, GroundingVerdict::Safe)
    }
}
