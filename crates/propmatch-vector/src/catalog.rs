//! Listing catalogue loading.
//!
//! Listings arrive as a JSON array of documents. Each document's
//! description is embedded and the result inserted into the index.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use propmatch_core::{ListingId, ListingReference};

use crate::embedding::DynEmbeddingService;
use crate::error::VectorError;
use crate::index::InMemoryListingIndex;

/// A listing as it appears in a catalogue file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingDocument {
    pub id: ListingId,
    pub listed_at: DateTime<Utc>,
    /// Free text embedded for similarity search.
    pub description: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl ListingDocument {
    fn into_reference(self, vector: Vec<f32>) -> ListingReference {
        ListingReference {
            id: self.id,
            vector,
            listed_at: self.listed_at,
            attributes: self.attributes,
        }
    }
}

/// Read a catalogue file.
pub fn load_listings(path: &Path) -> Result<Vec<ListingDocument>, VectorError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| VectorError::Catalog(format!("{}: {}", path.display(), e)))?;
    let docs: Vec<ListingDocument> = serde_json::from_str(&content)
        .map_err(|e| VectorError::Catalog(format!("{}: {}", path.display(), e)))?;
    info!(path = %path.display(), count = docs.len(), "Listing catalogue loaded");
    Ok(docs)
}

/// Embed and insert every document. Documents with a blank description are
/// skipped. Returns the number indexed.
pub async fn index_listings(
    index: &InMemoryListingIndex,
    embedder: &dyn DynEmbeddingService,
    docs: Vec<ListingDocument>,
) -> Result<usize, VectorError> {
    let mut indexed = 0;
    for doc in docs {
        if doc.description.trim().is_empty() {
            warn!(listing_id = %doc.id, "Skipping listing without description");
            continue;
        }
        let vector = embedder.embed_boxed(&doc.description).await?;
        index.insert(doc.into_reference(vector))?;
        indexed += 1;
    }
    info!(indexed, total = index.len(), "Listings indexed");
    Ok(indexed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingService, MockEmbedding};
    use crate::search::{SearchQuery, SimilarityMetric, VectorSearch};
    use std::io::Write;

    const CATALOGUE: &str = r#"[
      {"id": "LST-1", "listed_at": "2026-01-01T00:00:00Z",
       "description": "Two bedroom flat in Manchester",
       "attributes": {"price": 325000, "address": "14 Deansgate, Manchester"}},
      {"id": "LST-2", "listed_at": "2026-01-02T00:00:00Z",
       "description": "Cottage by the sea in Cornwall"},
      {"id": "LST-3", "listed_at": "2026-01-03T00:00:00Z", "description": "  "}
    ]"#;

    #[test]
    fn test_load_listings() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CATALOGUE.as_bytes()).unwrap();
        let docs = load_listings(file.path()).unwrap();
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0].id.as_str(), "LST-1");
        assert!(docs[1].attributes.is_empty());
    }

    #[test]
    fn test_load_listings_errors() {
        assert!(matches!(
            load_listings(Path::new("/nonexistent/listings.json")),
            Err(VectorError::Catalog(_))
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not a list }").unwrap();
        assert!(matches!(load_listings(file.path()), Err(VectorError::Catalog(_))));
    }

    #[tokio::test]
    async fn test_index_listings_and_search() {
        let docs: Vec<ListingDocument> = serde_json::from_str(CATALOGUE).unwrap();
        let embedder = MockEmbedding::with_dimensions(64);
        let index = InMemoryListingIndex::new(SimilarityMetric::Cosine, 64);

        let indexed = index_listings(&index, &embedder, docs).await.unwrap();
        assert_eq!(indexed, 2);
        assert_eq!(index.len(), 2);

        let query = embedder.embed("flat in Manchester").await.unwrap();
        let hits = index.search(SearchQuery::new(query, 1)).await.unwrap();
        assert_eq!(hits[0].listing.id.as_str(), "LST-1");
        assert_eq!(hits[0].listing.attribute_u64("price"), Some(325_000));
    }

    #[tokio::test]
    async fn test_index_listings_dimension_mismatch() {
        let docs: Vec<ListingDocument> = serde_json::from_str(CATALOGUE).unwrap();
        let embedder = MockEmbedding::with_dimensions(32);
        let index = InMemoryListingIndex::new(SimilarityMetric::Cosine, 64);
        assert!(matches!(
            index_listings(&index, &embedder, docs).await,
            Err(VectorError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_sample_catalogue_parses() {
        let docs: Vec<ListingDocument> =
            serde_json::from_str(include_str!("../../../config/listings.sample.json")).unwrap();
        assert_eq!(docs.len(), 4);
        assert!(docs.iter().all(|d| d.attributes.contains_key("price")));
    }
}
