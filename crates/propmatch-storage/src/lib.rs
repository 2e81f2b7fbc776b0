//! PropMatch storage crate - conversation turns and user metadata.
//!
//! Provides the `ConversationStore` contract, a WAL-mode SQLite
//! implementation with migrations, and an in-memory implementation.

pub mod db;
pub mod memory;
pub mod migrations;
pub mod sqlite;
pub mod store;

pub use db::Database;
pub use memory::MemoryConversationStore;
pub use sqlite::SqliteConversationStore;
pub use store::{ConversationStore, TurnCommit};
