//! Database schema migrations.
//!
//! Applies the conversation schema: the append-only `conversation_turns`
//! log and the single-row-per-conversation `user_metadata` table.

use rusqlite::Connection;
use tracing::info;

use propmatch_core::PropmatchError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), PropmatchError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| PropmatchError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| PropmatchError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: conversations");
    }

    Ok(())
}

/// Version 1: conversation turns and user metadata.
fn apply_v1(conn: &Connection) -> Result<(), PropmatchError> {
    conn.execute_batch(
        "
        -- Append-only turn log; seq gives insertion order.
        CREATE TABLE IF NOT EXISTS conversation_turns (
            seq             INTEGER PRIMARY KEY AUTOINCREMENT,
            id              TEXT NOT NULL UNIQUE,
            conversation_id TEXT NOT NULL,
            role            TEXT NOT NULL
                            CHECK (role IN ('user', 'assistant')),
            text            TEXT NOT NULL,
            listing_ids     TEXT NOT NULL DEFAULT '[]',
            created_at      INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_turns_conversation
            ON conversation_turns (conversation_id, seq DESC);

        -- Current preference record per conversation.
        CREATE TABLE IF NOT EXISTS user_metadata (
            conversation_id TEXT PRIMARY KEY NOT NULL,
            fields          TEXT NOT NULL DEFAULT '{}',
            lead_class      TEXT NOT NULL DEFAULT 'Cold'
                            CHECK (lead_class IN ('Hot', 'Warm', 'Cold')),
            version         INTEGER NOT NULL DEFAULT 0,
            updated_at      INTEGER
        );

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'conversations');
        ",
    )
    .map_err(|e| PropmatchError::Storage(format!("Failed to apply migration v1: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn test_migrations_run_once() {
        let conn = open_test_conn();
        run_migrations(&conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn test_turn_role_check() {
        let conn = open_test_conn();
        conn.execute(
            "INSERT INTO conversation_turns (id, conversation_id, role, text, created_at)
             VALUES ('t-1', 'c-1', 'user', 'hello', 1700000000000)",
            [],
        )
        .unwrap();

        let result = conn.execute(
            "INSERT INTO conversation_turns (id, conversation_id, role, text, created_at)
             VALUES ('t-2', 'c-1', 'system', 'nope', 1700000000000)",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_turn_id_unique() {
        let conn = open_test_conn();
        let insert = "INSERT INTO conversation_turns (id, conversation_id, role, text, created_at)
                      VALUES ('t-1', 'c-1', 'user', 'hello', 0)";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }

    #[test]
    fn test_metadata_lead_class_check() {
        let conn = open_test_conn();
        let result = conn.execute(
            "INSERT INTO user_metadata (conversation_id, lead_class) VALUES ('c-1', 'Lukewarm')",
            [],
        );
        assert!(result.is_err());
    }
}
