//! The SQLite file behind `SqliteConversationStore`.
//!
//! One connection serves every conversation. Turn commits are short
//! transactions, so WAL journaling with `synchronous = NORMAL` and a busy
//! timeout let a second process (a `history` query while `chat` runs) read
//! without failing on a locked file.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info};

use propmatch_core::PropmatchError;

use crate::migrations;

/// How long a writer waits on another process's lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Conversation database handle.
///
/// `Connection` is not `Sync`, so it is shared behind a `Mutex`. The store
/// only touches it from the blocking pool.
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

fn open_err(e: rusqlite::Error) -> PropmatchError {
    PropmatchError::Storage(format!("Failed to open conversation database: {}", e))
}

impl Database {
    /// Open the conversation database at `path`, creating the file and its
    /// parent directories on first use, and bring the schema up to date.
    pub fn new(path: &Path) -> Result<Self, PropmatchError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let conn = Connection::open(path).map_err(open_err)?;
        let journal: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(open_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(open_err)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(open_err)?;
        debug!(journal = %journal, "Conversation database configured");

        let db = Self::init(conn, Some(path.to_path_buf()))?;
        info!(path = %path.display(), "Conversation database opened");
        Ok(db)
    }

    /// A private, throwaway database. Used by tests.
    pub fn in_memory() -> Result<Self, PropmatchError> {
        let conn = Connection::open_in_memory().map_err(open_err)?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, PropmatchError> {
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Backing file, or `None` for an in-memory database.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` with exclusive use of the connection. A transaction opened
    /// inside `f` cannot interleave with another caller's.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, PropmatchError>
    where
        F: FnOnce(&Connection) -> Result<T, PropmatchError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|_| PropmatchError::Storage("Conversation database lock poisoned".into()))?;
        f(&conn)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}
