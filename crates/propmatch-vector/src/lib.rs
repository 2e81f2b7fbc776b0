//! PropMatch vector crate - embedding services, listing index and search.
//!
//! Provides the embedding service trait with an HTTP client and a
//! deterministic mock, the `VectorSearch` contract used by the turn pipeline,
//! and an in-memory listing index loaded from a catalogue file.

pub mod catalog;
pub mod embedding;
pub mod error;
pub mod index;
pub mod search;

pub use catalog::{index_listings, load_listings, ListingDocument};
pub use embedding::{DynEmbeddingService, EmbeddingService, HttpEmbeddingService, MockEmbedding};
pub use error::VectorError;
pub use index::InMemoryListingIndex;
pub use search::{FilterCondition, ListingFilter, SearchQuery, SimilarityMetric, VectorSearch};
