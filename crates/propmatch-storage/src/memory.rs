//! In-process conversation store, used by tests and the `--ephemeral` mode
//! of the binary.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use propmatch_core::{ConversationId, ConversationTurn, PropmatchError, UserMetadata};

use crate::store::{ConversationStore, TurnCommit};

#[derive(Debug, Default)]
struct ConversationRecord {
    turns: Vec<ConversationTurn>,
    metadata: Option<UserMetadata>,
}

/// Conversation store backed by a map. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryConversationStore {
    conversations: Arc<RwLock<HashMap<ConversationId, ConversationRecord>>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored turns for a conversation.
    pub fn turn_count(&self, conversation_id: &ConversationId) -> usize {
        self.conversations
            .read()
            .ok()
            .and_then(|c| c.get(conversation_id).map(|r| r.turns.len()))
            .unwrap_or(0)
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> PropmatchError {
    PropmatchError::Storage(format!("Lock poisoned: {}", e))
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn load_history(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, PropmatchError> {
        let conversations = self.conversations.read().map_err(poisoned)?;
        Ok(conversations
            .get(conversation_id)
            .map(|r| {
                let start = r.turns.len().saturating_sub(limit);
                r.turns[start..].to_vec()
            })
            .unwrap_or_default())
    }

    async fn load_metadata(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<UserMetadata>, PropmatchError> {
        let conversations = self.conversations.read().map_err(poisoned)?;
        Ok(conversations
            .get(conversation_id)
            .and_then(|r| r.metadata.clone()))
    }

    async fn persist_turn(&self, commit: TurnCommit) -> Result<(), PropmatchError> {
        commit.check()?;
        let mut conversations = self.conversations.write().map_err(poisoned)?;
        let record = conversations
            .entry(commit.conversation_id().clone())
            .or_default();

        let stored = record.metadata.as_ref().map_or(0, |m| m.version);
        if stored != commit.base_version {
            return Err(PropmatchError::VersionConflict {
                conversation_id: commit.conversation_id().to_string(),
                expected: commit.base_version,
                found: stored,
            });
        }

        record.turns.push(commit.user_turn);
        record.turns.push(commit.assistant_turn);
        record.metadata = Some(commit.metadata);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use propmatch_core::{FieldValue, Role};
    use std::collections::BTreeSet;

    fn make_commit(cid: &str, n: u64, base_version: u64) -> TurnCommit {
        let conversation_id = ConversationId::new(cid);
        let now = Utc::now();
        let mut metadata = UserMetadata::initial(conversation_id.clone());
        metadata.fields.insert("bedrooms".into(), FieldValue::Integer(2));
        metadata.version = base_version + 1;
        TurnCommit {
            user_turn: ConversationTurn::user(conversation_id.clone(), format!("q{}", n), now),
            assistant_turn: ConversationTurn::assistant(
                conversation_id,
                format!("a{}", n),
                now,
                BTreeSet::new(),
            ),
            metadata,
            base_version,
        }
    }

    #[tokio::test]
    async fn test_round_trip_and_limit() {
        let store = MemoryConversationStore::new();
        let cid = ConversationId::new("c-1");
        for n in 0..3 {
            store.persist_turn(make_commit("c-1", n, n)).await.unwrap();
        }

        assert_eq!(store.turn_count(&cid), 6);
        let history = store.load_history(&cid, 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].text, "q2");
        assert_eq!(history[1].text, "a2");
        assert_eq!(store.load_metadata(&cid).await.unwrap().unwrap().version, 3);
    }

    #[tokio::test]
    async fn test_version_conflict_writes_nothing() {
        let store = MemoryConversationStore::new();
        let cid = ConversationId::new("c-1");
        store.persist_turn(make_commit("c-1", 0, 0)).await.unwrap();

        assert!(matches!(
            store.persist_turn(make_commit("c-1", 1, 0)).await,
            Err(PropmatchError::VersionConflict { found: 1, .. })
        ));
        assert_eq!(store.turn_count(&cid), 2);
    }

    #[tokio::test]
    async fn test_unknown_conversation() {
        let store = MemoryConversationStore::new();
        let cid = ConversationId::new("nobody");
        assert!(store.load_history(&cid, 10).await.unwrap().is_empty());
        assert!(store.load_metadata(&cid).await.unwrap().is_none());
    }
}
