//! Shared types, configuration and domain schema for PropMatch.

pub mod config;
pub mod error;
pub mod schema;
pub mod types;

pub use config::PropmatchConfig;
pub use error::{PropmatchError, Result};
pub use schema::{DomainSchema, FieldKind, FieldSchema, FieldSpec};
pub use types::*;
