use thiserror::Error;

/// Top-level error type shared by the PropMatch crates.
///
/// Subsystem crates define their own error types and implement
/// `From<PropmatchError>` so that the `?` operator works across crate
/// boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PropmatchError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Version conflict for conversation {conversation_id}: expected {expected}, found {found}")]
    VersionConflict {
        conversation_id: String,
        expected: u64,
        found: u64,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for PropmatchError {
    fn from(err: toml::de::Error) -> Self {
        PropmatchError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for PropmatchError {
    fn from(err: toml::ser::Error) -> Self {
        PropmatchError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for PropmatchError {
    fn from(err: serde_json::Error) -> Self {
        PropmatchError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for PropMatch operations.
pub type Result<T> = std::result::Result<T, PropmatchError>;
