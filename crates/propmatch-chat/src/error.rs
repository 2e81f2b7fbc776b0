//! Error types for the turn pipeline.

use propmatch_core::PropmatchError;

use crate::llm::LlmError;

/// Errors that fail a turn. Nothing is persisted when a turn fails.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message cannot be empty")]
    EmptyMessage,
    #[error("message exceeds maximum length of {0} characters")]
    MessageTooLong(usize),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("embedding error: {0}")]
    Embedding(String),
    #[error("search error: {0}")]
    Search(String),
    #[error("LLM unavailable: {0}")]
    LlmUnavailable(String),
    #[error("LLM did not answer within {0} ms")]
    LlmTimeout(u64),
    #[error("conversation {conversation_id} was updated concurrently (expected version {expected}, found {found})")]
    Conflict {
        conversation_id: String,
        expected: u64,
        found: u64,
    },
}

impl ChatError {
    /// Whether the same turn may succeed if submitted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::Storage(_)
                | ChatError::Embedding(_)
                | ChatError::Search(_)
                | ChatError::LlmUnavailable(_)
                | ChatError::LlmTimeout(_)
                | ChatError::Conflict { .. }
        )
    }
}

impl From<PropmatchError> for ChatError {
    fn from(err: PropmatchError) -> Self {
        match err {
            PropmatchError::VersionConflict {
                conversation_id,
                expected,
                found,
            } => ChatError::Conflict {
                conversation_id,
                expected,
                found,
            },
            PropmatchError::Config(msg) | PropmatchError::Schema(msg) => ChatError::Config(msg),
            other => ChatError::Storage(other.to_string()),
        }
    }
}

impl From<LlmError> for ChatError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Timeout(ms) => ChatError::LlmTimeout(ms),
            other => ChatError::LlmUnavailable(other.to_string()),
        }
    }
}
