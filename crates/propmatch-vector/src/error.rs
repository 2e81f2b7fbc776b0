//! Error types for embedding and listing search.

/// Errors from the embedding service or the listing index.
#[derive(Debug, thiserror::Error)]
pub enum VectorError {
    #[error("embedding error: {0}")]
    Embedding(String),
    #[error("embedding endpoint error: {0}")]
    Http(String),
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("index error: {0}")]
    Index(String),
    #[error("catalog error: {0}")]
    Catalog(String),
}

impl From<reqwest::Error> for VectorError {
    fn from(err: reqwest::Error) -> Self {
        VectorError::Http(err.to_string())
    }
}

impl From<propmatch_core::PropmatchError> for VectorError {
    fn from(err: propmatch_core::PropmatchError) -> Self {
        VectorError::Catalog(err.to_string())
    }
}
