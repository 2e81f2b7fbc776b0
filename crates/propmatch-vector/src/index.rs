//! In-memory listing index with brute-force similarity search.
//!
//! All operations are O(n) for search, which is acceptable for catalogues
//! of a few thousand listings.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use propmatch_core::{ListingId, ListingReference, ScoredListing};

use crate::error::VectorError;
use crate::search::{rank, SearchQuery, SimilarityMetric, VectorSearch};

/// In-memory listing index.
///
/// Thread-safe via interior RwLock; clones share the same entries.
#[derive(Debug, Clone)]
pub struct InMemoryListingIndex {
    metric: SimilarityMetric,
    dimensions: usize,
    entries: Arc<RwLock<HashMap<ListingId, ListingReference>>>,
}

impl InMemoryListingIndex {
    /// Create an empty index for vectors of `dimensions` length.
    pub fn new(metric: SimilarityMetric, dimensions: usize) -> Self {
        Self {
            metric,
            dimensions,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Insert a listing, replacing any existing entry with the same id.
    pub fn insert(&self, listing: ListingReference) -> Result<(), VectorError> {
        if listing.vector.len() != self.dimensions {
            return Err(VectorError::DimensionMismatch {
                expected: self.dimensions,
                actual: listing.vector.len(),
            });
        }
        let mut entries = self
            .entries
            .write()
            .map_err(|e| VectorError::Index(format!("Lock poisoned: {}", e)))?;
        entries.insert(listing.id.clone(), listing);
        Ok(())
    }

    /// Remove a listing. Returns whether it was present.
    pub fn delete(&self, id: &ListingId) -> Result<bool, VectorError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| VectorError::Index(format!("Lock poisoned: {}", e)))?;
        Ok(entries.remove(id).is_some())
    }

    pub fn get(&self, id: &ListingId) -> Option<ListingReference> {
        self.entries.read().ok()?.get(id).cloned()
    }

    /// Ids of every indexed listing, sorted.
    pub fn ids(&self) -> Vec<ListingId> {
        let mut ids: Vec<ListingId> = self
            .entries
            .read()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn search_sync(&self, query: &SearchQuery) -> Result<Vec<ScoredListing>, VectorError> {
        if query.vector.len() != self.dimensions {
            return Err(VectorError::DimensionMismatch {
                expected: self.dimensions,
                actual: query.vector.len(),
            });
        }
        if query.top_k == 0 {
            return Ok(Vec::new());
        }

        let entries = self
            .entries
            .read()
            .map_err(|e| VectorError::Index(format!("Lock poisoned: {}", e)))?;

        let mut scored: Vec<ScoredListing> = entries
            .values()
            .filter(|l| query.filter.as_ref().map_or(true, |f| f.matches(l)))
            .filter_map(|l| {
                let score = match self.metric {
                    SimilarityMetric::Cosine => cosine_similarity(&query.vector, &l.vector),
                    SimilarityMetric::DotProduct => dot_product(&query.vector, &l.vector),
                };
                (score >= query.score_threshold).then(|| ScoredListing {
                    listing: l.clone(),
                    score,
                })
            })
            .collect();

        rank(&mut scored);
        scored.truncate(query.top_k);

        debug!(
            candidates = entries.len(),
            returned = scored.len(),
            metric = %self.metric,
            "Listing search complete"
        );
        Ok(scored)
    }
}

#[async_trait]
impl VectorSearch for InMemoryListingIndex {
    async fn search(&self, query: SearchQuery) -> Result<Vec<ScoredListing>, VectorError> {
        self.search_sync(&query)
    }

    fn metric(&self) -> SimilarityMetric {
        self.metric
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Compute cosine similarity between two vectors.
///
/// Returns 0.0 if either vector has zero magnitude or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot = dot_product(a, b);
    let mag_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let mag_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    dot / (mag_a * mag_b)
}

/// Raw dot product; 0.0 on length mismatch.
pub fn dot_product(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (*x as f64) * (*y as f64))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{FilterCondition, ListingFilter};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn listing(id: &str, vector: Vec<f32>, price: u64, day: u32) -> ListingReference {
        let mut attributes = BTreeMap::new();
        attributes.insert("price".to_string(), serde_json::json!(price));
        ListingReference {
            id: ListingId::new(id),
            vector,
            listed_at: Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap(),
            attributes,
        }
    }

    fn axis(dims: usize, i: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; dims];
        v[i] = 1.0;
        v
    }

    #[tokio::test]
    async fn test_insert_and_search() {
        let index = InMemoryListingIndex::new(SimilarityMetric::Cosine, 4);
        index.insert(listing("LST-1", axis(4, 0), 300_000, 1)).unwrap();
        index.insert(listing("LST-2", axis(4, 1), 300_000, 1)).unwrap();
        assert_eq!(index.len(), 2);

        let hits = index.search(SearchQuery::new(axis(4, 0), 5)).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].listing.id.as_str(), "LST-1");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert!(hits[1].score.abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_threshold_excludes_weak_matches() {
        let index = InMemoryListingIndex::new(SimilarityMetric::Cosine, 4);
        index.insert(listing("LST-1", axis(4, 0), 300_000, 1)).unwrap();
        index.insert(listing("LST-2", axis(4, 1), 300_000, 1)).unwrap();

        let hits = index
            .search(SearchQuery::new(axis(4, 0), 5).with_threshold(0.2))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].listing.id.as_str(), "LST-1");
    }

    #[tokio::test]
    async fn test_search_respects_top_k_and_ties() {
        let index = InMemoryListingIndex::new(SimilarityMetric::Cosine, 4);
        for (id, day) in [("LST-3", 1), ("LST-1", 5), ("LST-2", 5), ("LST-4", 9)] {
            index.insert(listing(id, axis(4, 0), 300_000, day)).unwrap();
        }

        let hits = index.search(SearchQuery::new(axis(4, 0), 3)).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.listing.id.as_str()).collect();
        assert_eq!(ids, vec!["LST-4", "LST-1", "LST-2"]);
    }

    #[tokio::test]
    async fn test_search_with_filter() {
        let index = InMemoryListingIndex::new(SimilarityMetric::Cosine, 4);
        index.insert(listing("LST-1", axis(4, 0), 450_000, 1)).unwrap();
        index.insert(listing("LST-2", axis(4, 0), 280_000, 1)).unwrap();

        let filter = ListingFilter::new().with(FilterCondition::AtMost {
            key: "price".into(),
            value: 300_000,
        });
        let hits = index
            .search(SearchQuery::new(axis(4, 0), 5).with_filter(filter))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].listing.id.as_str(), "LST-2");
    }

    #[tokio::test]
    async fn test_dot_product_metric() {
        let index = InMemoryListingIndex::new(SimilarityMetric::DotProduct, 2);
        index.insert(listing("LST-1", vec![2.0, 0.0], 1, 1)).unwrap();
        index.insert(listing("LST-2", vec![1.0, 0.0], 1, 1)).unwrap();

        let hits = index.search(SearchQuery::new(vec![1.0, 0.0], 5)).await.unwrap();
        assert_eq!(hits[0].listing.id.as_str(), "LST-1");
        assert!((hits[0].score - 2.0).abs() < 1e-6);
        assert_eq!(index.metric(), SimilarityMetric::DotProduct);
    }

    #[tokio::test]
    async fn test_dimension_mismatch() {
        let index = InMemoryListingIndex::new(SimilarityMetric::Cosine, 4);
        assert!(matches!(
            index.insert(listing("LST-1", vec![1.0; 3], 1, 1)),
            Err(VectorError::DimensionMismatch { expected: 4, actual: 3 })
        ));
        assert!(matches!(
            index.search(SearchQuery::new(vec![1.0; 5], 1)).await,
            Err(VectorError::DimensionMismatch { expected: 4, actual: 5 })
        ));
    }

    #[tokio::test]
    async fn test_search_empty_index() {
        let index = InMemoryListingIndex::new(SimilarityMetric::Cosine, 4);
        let hits = index.search(SearchQuery::new(axis(4, 0), 10)).await.unwrap();
        assert!(hits.is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn test_insert_overwrites_and_delete() {
        let index = InMemoryListingIndex::new(SimilarityMetric::Cosine, 4);
        index.insert(listing("LST-1", axis(4, 0), 1, 1)).unwrap();
        index.insert(listing("LST-1", axis(4, 1), 2, 1)).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(
            index.get(&ListingId::new("LST-1")).unwrap().attribute_u64("price"),
            Some(2)
        );

        assert!(index.delete(&ListingId::new("LST-1")).unwrap());
        assert!(!index.delete(&ListingId::new("LST-1")).unwrap());
        assert!(index.ids().is_empty());
    }

    #[test]
    fn test_cosine_similarity_edge_cases() {
        assert!((cosine_similarity(&[1.0; 8], &[1.0; 8]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0; 8], &[1.0; 8]), 0.0);
        assert_eq!(cosine_similarity(&[1.0; 4], &[1.0; 8]), 0.0);
        assert!(cosine_similarity(&axis(4, 0), &axis(4, 1)).abs() < 1e-6);
    }
}
