//! SQLite-backed conversation store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use propmatch_core::{
    ConversationId, ConversationTurn, FieldValue, LeadClass, ListingId, PropmatchError, Role,
    UserMetadata,
};

use crate::db::Database;
use crate::store::{ConversationStore, TurnCommit};

/// Conversation store persisting to SQLite.
///
/// Every call runs on the blocking thread pool; `persist_turn` writes inside
/// a single transaction.
#[derive(Debug, Clone)]
pub struct SqliteConversationStore {
    db: Arc<Database>,
}

impl SqliteConversationStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, PropmatchError>
    where
        F: FnOnce(&Connection) -> Result<T, PropmatchError> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| PropmatchError::Storage(format!("Storage task failed: {}", e)))?
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn load_history(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, PropmatchError> {
        let cid = conversation_id.clone();
        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, conversation_id, role, text, listing_ids, created_at
                     FROM conversation_turns
                     WHERE conversation_id = ?1
                     ORDER BY seq DESC
                     LIMIT ?2",
                )
                .map_err(|e| PropmatchError::Storage(e.to_string()))?;

            let rows = stmt
                .query_map(rusqlite::params![cid.as_str(), limit as i64], |row| {
                    Ok(row_to_turn(row))
                })
                .map_err(|e| PropmatchError::Storage(e.to_string()))?;

            let mut turns = Vec::new();
            for row in rows {
                let turn = row.map_err(|e| PropmatchError::Storage(e.to_string()))??;
                turns.push(turn);
            }
            turns.reverse();
            Ok(turns)
        })
        .await
    }

    async fn load_metadata(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<UserMetadata>, PropmatchError> {
        let cid = conversation_id.clone();
        self.blocking(move |conn| {
            let row = conn
                .query_row(
                    "SELECT fields, lead_class, version, updated_at
                     FROM user_metadata WHERE conversation_id = ?1",
                    rusqlite::params![cid.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, Option<i64>>(3)?,
                        ))
                    },
                )
                .optional()
                .map_err(|e| PropmatchError::Storage(e.to_string()))?;

            let Some((fields, lead_class, version, updated_at)) = row else {
                return Ok(None);
            };

            let fields: BTreeMap<String, FieldValue> = serde_json::from_str(&fields)?;
            let lead_class = LeadClass::parse(&lead_class).ok_or_else(|| {
                PropmatchError::Storage(format!("Invalid lead class: {}", lead_class))
            })?;

            Ok(Some(UserMetadata {
                conversation_id: cid,
                fields,
                lead_class,
                version: version as u64,
                last_updated: updated_at.map(millis_to_datetime),
            }))
        })
        .await
    }

    async fn persist_turn(&self, commit: TurnCommit) -> Result<(), PropmatchError> {
        commit.check()?;
        self.blocking(move |conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| PropmatchError::Storage(format!("Failed to begin transaction: {}", e)))?;

            let cid = commit.conversation_id().clone();
            let stored: u64 = tx
                .query_row(
                    "SELECT version FROM user_metadata WHERE conversation_id = ?1",
                    rusqlite::params![cid.as_str()],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
                .map_err(|e| PropmatchError::Storage(e.to_string()))?
                .unwrap_or(0) as u64;

            if stored != commit.base_version {
                return Err(PropmatchError::VersionConflict {
                    conversation_id: cid.to_string(),
                    expected: commit.base_version,
                    found: stored,
                });
            }

            for turn in [&commit.user_turn, &commit.assistant_turn] {
                insert_turn(&tx, turn)?;
            }

            let meta = &commit.metadata;
            tx.execute(
                "INSERT INTO user_metadata (conversation_id, fields, lead_class, version, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(conversation_id) DO UPDATE SET
                    fields = excluded.fields,
                    lead_class = excluded.lead_class,
                    version = excluded.version,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    cid.as_str(),
                    serde_json::to_string(&meta.fields)?,
                    meta.lead_class.as_str(),
                    meta.version as i64,
                    meta.last_updated.map(|t| t.timestamp_millis()),
                ],
            )
            .map_err(|e| PropmatchError::Storage(format!("Failed to save metadata: {}", e)))?;

            tx.commit()
                .map_err(|e| PropmatchError::Storage(format!("Failed to commit turn: {}", e)))?;

            debug!(
                conversation_id = %cid,
                version = meta.version,
                "Turn persisted"
            );
            Ok(())
        })
        .await
    }
}

fn insert_turn(conn: &Connection, turn: &ConversationTurn) -> Result<(), PropmatchError> {
    conn.execute(
        "INSERT INTO conversation_turns (id, conversation_id, role, text, listing_ids, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        rusqlite::params![
            turn.id.to_string(),
            turn.conversation_id.as_str(),
            turn.role.as_str(),
            turn.text,
            serde_json::to_string(&turn.listing_ids)?,
            turn.timestamp.timestamp_millis(),
        ],
    )
    .map_err(|e| PropmatchError::Storage(format!("Failed to save turn: {}", e)))?;
    Ok(())
}

fn row_to_turn(row: &rusqlite::Row<'_>) -> Result<ConversationTurn, PropmatchError> {
    let get_err = |e: rusqlite::Error| PropmatchError::Storage(e.to_string());

    let id_str: String = row.get(0).map_err(get_err)?;
    let conversation_id: String = row.get(1).map_err(get_err)?;
    let role_str: String = row.get(2).map_err(get_err)?;
    let text: String = row.get(3).map_err(get_err)?;
    let listing_ids: String = row.get(4).map_err(get_err)?;
    let created_at: i64 = row.get(5).map_err(get_err)?;

    let listing_ids: BTreeSet<ListingId> = serde_json::from_str(&listing_ids)?;

    Ok(ConversationTurn {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| PropmatchError::Storage(format!("Invalid UUID: {}", e)))?,
        conversation_id: ConversationId::new(conversation_id),
        role: Role::parse(&role_str)
            .ok_or_else(|| PropmatchError::Storage(format!("Invalid role: {}", role_str)))?,
        text,
        timestamp: millis_to_datetime(created_at),
        listing_ids,
    })
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_store() -> SqliteConversationStore {
        SqliteConversationStore::new(Arc::new(Database::in_memory().unwrap()))
    }

    fn make_commit(cid: &str, n: u64, base_version: u64) -> TurnCommit {
        let conversation_id = ConversationId::new(cid);
        let at = Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap()
            + Duration::seconds(n as i64);
        let ids: BTreeSet<ListingId> = [ListingId::new(format!("LST-{}", 1000 + n))]
            .into_iter()
            .collect();

        let mut metadata = UserMetadata::initial(conversation_id.clone());
        metadata
            .fields
            .insert("location".into(), FieldValue::Text("Manchester".into()));
        metadata.lead_class = LeadClass::Warm;
        metadata.version = base_version + 1;
        metadata.last_updated = Some(at);

        TurnCommit {
            user_turn: ConversationTurn::user(conversation_id.clone(), format!("question {}", n), at),
            assistant_turn: ConversationTurn::assistant(
                conversation_id,
                format!("answer {}", n),
                at,
                ids,
            ),
            metadata,
            base_version,
        }
    }

    #[tokio::test]
    async fn test_new_conversation_is_empty() {
        let store = make_store();
        let cid = ConversationId::new("c-1");
        assert!(store.load_history(&cid, 10).await.unwrap().is_empty());
        assert!(store.load_metadata(&cid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persist_and_load_round_trip() {
        let store = make_store();
        let cid = ConversationId::new("c-1");
        let commit = make_commit("c-1", 1, 0);
        let expected_meta = commit.metadata.clone();
        let expected_assistant = commit.assistant_turn.clone();
        store.persist_turn(commit).await.unwrap();

        let history = store.load_history(&cid, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1], expected_assistant);

        let meta = store.load_metadata(&cid).await.unwrap().unwrap();
        assert_eq!(meta, expected_meta);
    }

    #[tokio::test]
    async fn test_history_limit_returns_most_recent_in_order() {
        let store = make_store();
        let cid = ConversationId::new("c-1");
        for n in 0..4 {
            store.persist_turn(make_commit("c-1", n, n)).await.unwrap();
        }

        let history = store.load_history(&cid, 3).await.unwrap();
        let texts: Vec<&str> = history.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["answer 2", "question 3", "answer 3"]);
    }

    #[tokio::test]
    async fn test_stale_base_version_is_rejected_atomically() {
        let store = make_store();
        let cid = ConversationId::new("c-1");
        store.persist_turn(make_commit("c-1", 1, 0)).await.unwrap();

        let err = store.persist_turn(make_commit("c-1", 2, 0)).await.unwrap_err();
        assert!(matches!(
            err,
            PropmatchError::VersionConflict { expected: 0, found: 1, .. }
        ));

        assert_eq!(store.load_history(&cid, 10).await.unwrap().len(), 2);
        assert_eq!(store.load_metadata(&cid).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_conversations_are_isolated() {
        let store = make_store();
        store.persist_turn(make_commit("c-1", 1, 0)).await.unwrap();
        store.persist_turn(make_commit("c-2", 1, 0)).await.unwrap();

        let history = store.load_history(&ConversationId::new("c-2"), 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|t| t.conversation_id.as_str() == "c-2"));
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("propmatch.db");
        {
            let store = SqliteConversationStore::new(Arc::new(Database::new(&path).unwrap()));
            store.persist_turn(make_commit("c-1", 1, 0)).await.unwrap();
        }
        let store = SqliteConversationStore::new(Arc::new(Database::new(&path).unwrap()));
        let meta = store
            .load_metadata(&ConversationId::new("c-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.version, 1);
        assert_eq!(meta.get("location"), Some(&FieldValue::Text("Manchester".into())));
    }
}
