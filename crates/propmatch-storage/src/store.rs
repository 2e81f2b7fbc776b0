//! The conversation store contract.

use async_trait::async_trait;

use propmatch_core::{ConversationId, ConversationTurn, PropmatchError, UserMetadata};

/// Everything one completed turn writes, committed atomically.
#[derive(Debug, Clone)]
pub struct TurnCommit {
    pub user_turn: ConversationTurn,
    pub assistant_turn: ConversationTurn,
    pub metadata: UserMetadata,
    /// Metadata version the turn started from. The commit is rejected if
    /// the stored version has moved on since.
    pub base_version: u64,
}

impl TurnCommit {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.metadata.conversation_id
    }

    /// Reject commits whose parts disagree about the conversation or whose
    /// metadata version went backwards.
    pub fn check(&self) -> Result<(), PropmatchError> {
        let cid = self.conversation_id();
        if &self.user_turn.conversation_id != cid || &self.assistant_turn.conversation_id != cid {
            return Err(PropmatchError::Storage(format!(
                "turn commit mixes conversations (metadata is {})",
                cid
            )));
        }
        if self.metadata.version < self.base_version {
            return Err(PropmatchError::Storage(format!(
                "metadata version {} is older than base version {}",
                self.metadata.version, self.base_version
            )));
        }
        Ok(())
    }
}

/// Persistence of turns and the current metadata record per conversation.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// The most recent `limit` turns, oldest first.
    async fn load_history(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, PropmatchError>;

    /// The current metadata record, or `None` for a new conversation.
    async fn load_metadata(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<UserMetadata>, PropmatchError>;

    /// Append both turns and replace the metadata record in one atomic step.
    ///
    /// Fails with [`PropmatchError::VersionConflict`] when the stored
    /// metadata version differs from `commit.base_version`; nothing is
    /// written in that case.
    async fn persist_turn(&self, commit: TurnCommit) -> Result<(), PropmatchError>;
}
