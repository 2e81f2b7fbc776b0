//! Listing search contract.
//!
//! `VectorSearch` is the seam the turn pipeline depends on. The bundled
//! implementation is [`InMemoryListingIndex`](crate::index::InMemoryListingIndex);
//! tests substitute stubs that return fixed rankings.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use propmatch_core::{ListingReference, ScoredListing};

use crate::error::VectorError;

/// Similarity metric of a listing index. Fixed per deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    Cosine,
    DotProduct,
}

impl SimilarityMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            SimilarityMetric::Cosine => "cosine",
            SimilarityMetric::DotProduct => "dot_product",
        }
    }
}

impl fmt::Display for SimilarityMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SimilarityMetric {
    type Err = VectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(SimilarityMetric::Cosine),
            "dot_product" | "dot" => Ok(SimilarityMetric::DotProduct),
            other => Err(VectorError::Index(format!("unknown similarity metric '{}'", other))),
        }
    }
}

/// One predicate over a listing attribute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FilterCondition {
    /// Attribute equals the value (strings compare case-insensitively).
    Equals { key: String, value: Value },
    /// Numeric attribute is at most `value`.
    AtMost { key: String, value: u64 },
    /// Numeric attribute is at least `value`.
    AtLeast { key: String, value: u64 },
    /// String attribute contains `needle` (case-insensitive), or array
    /// attribute has an element equal to it.
    Contains { key: String, needle: String },
}

impl FilterCondition {
    pub fn matches(&self, listing: &ListingReference) -> bool {
        match self {
            FilterCondition::Equals { key, value } => match (listing.attributes.get(key), value) {
                (Some(Value::String(a)), Value::String(b)) => a.eq_ignore_ascii_case(b),
                (Some(attr), _) => attr == value,
                (None, _) => false,
            },
            FilterCondition::AtMost { key, value } => {
                listing.attribute_u64(key).is_some_and(|n| n <= *value)
            }
            FilterCondition::AtLeast { key, value } => {
                listing.attribute_u64(key).is_some_and(|n| n >= *value)
            }
            FilterCondition::Contains { key, needle } => {
                let needle = needle.to_lowercase();
                match listing.attributes.get(key) {
                    Some(Value::String(s)) => s.to_lowercase().contains(&needle),
                    Some(Value::Array(items)) => items
                        .iter()
                        .filter_map(|i| i.as_str())
                        .any(|i| i.to_lowercase() == needle),
                    _ => false,
                }
            }
        }
    }
}

/// Conjunction of attribute conditions. An empty filter matches everything.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingFilter {
    pub conditions: Vec<FilterCondition>,
}

impl ListingFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, condition: FilterCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, listing: &ListingReference) -> bool {
        self.conditions.iter().all(|c| c.matches(listing))
    }
}

/// A nearest-listings query.
#[derive(Clone, Debug)]
pub struct SearchQuery {
    pub vector: Vec<f32>,
    pub top_k: usize,
    pub filter: Option<ListingFilter>,
    /// Listings scoring below this are excluded.
    pub score_threshold: f64,
}

impl SearchQuery {
    pub fn new(vector: Vec<f32>, top_k: usize) -> Self {
        Self {
            vector,
            top_k,
            filter: None,
            score_threshold: f64::NEG_INFINITY,
        }
    }

    pub fn with_filter(mut self, filter: ListingFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.score_threshold = threshold;
        self
    }
}

/// Nearest-listing lookup by vector similarity.
///
/// Results are ranked by descending score; equal scores are ordered by
/// `listed_at` (newer first) and then by listing id ascending.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    async fn search(&self, query: SearchQuery) -> Result<Vec<ScoredListing>, VectorError>;

    fn metric(&self) -> SimilarityMetric;

    fn dimensions(&self) -> usize;
}

/// Sort scored listings into ranking order.
pub fn rank(results: &mut [ScoredListing]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.listing.listed_at.cmp(&a.listing.listed_at))
            .then_with(|| a.listing.id.cmp(&b.listing.id))
    });
}
