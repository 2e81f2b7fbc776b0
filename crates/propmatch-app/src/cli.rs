//! CLI argument definitions for the PropMatch binary.
//!
//! Uses `clap` with derive macros for ergonomic argument parsing.
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// PropMatch: conversational property matching with lead scoring.
#[derive(Parser, Debug)]
#[command(name = "propmatch", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    /// Keep conversations in memory instead of SQLite.
    #[arg(long = "ephemeral", global = true)]
    pub ephemeral: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Chat with the assistant. Reads messages from stdin, one per line.
    Chat {
        /// Conversation to continue. A new id is generated if omitted.
        #[arg(long = "conversation")]
        conversation: Option<String>,

        /// Send a single message and exit.
        #[arg(short = 'm', long = "message")]
        message: Option<String>,
    },

    /// Print the stored turns of a conversation.
    History {
        #[arg(long = "conversation")]
        conversation: String,

        /// Number of most recent turns to print.
        #[arg(long = "limit", default_value_t = 20)]
        limit: usize,
    },

    /// Print the stored preferences and lead class of a conversation.
    Metadata {
        #[arg(long = "conversation")]
        conversation: String,
    },

    /// Validate a domain schema file.
    CheckSchema {
        /// Schema to check. Defaults to `general.schema_path`.
        #[arg(long = "path")]
        path: Option<PathBuf>,
    },
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > PROPMATCH_CONFIG env var > ~/.propmatch/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("PROPMATCH_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the log filter directive.
    ///
    /// Priority: --log-level flag > RUST_LOG env var > config file value.
    pub fn resolve_log_level(&self, config_level: &str) -> String {
        if let Some(ref level) = self.log_level {
            return level.clone();
        }
        if let Ok(filter) = std::env::var("RUST_LOG") {
            if !filter.trim().is_empty() {
                return filter;
            }
        }
        config_level.to_string()
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".propmatch").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".propmatch").join("config.toml");
    }
    PathBuf::from("config.toml")
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_with_global_flags() {
        let args = CliArgs::try_parse_from([
            "propmatch",
            "chat",
            "--conversation",
            "conv-1",
            "--ephemeral",
            "-l",
            "debug",
        ])
        .unwrap();
        assert!(args.ephemeral);
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert_eq!(
            args.command,
            Command::Chat {
                conversation: Some("conv-1".into()),
                message: None
            }
        );
    }

    #[test]
    fn test_parse_history_default_limit() {
        let args =
            CliArgs::try_parse_from(["propmatch", "history", "--conversation", "c"]).unwrap();
        assert_eq!(
            args.command,
            Command::History {
                conversation: "c".into(),
                limit: 20
            }
        );
    }

    #[test]
    fn test_subcommand_required() {
        assert!(CliArgs::try_parse_from(["propmatch"]).is_err());
        assert!(CliArgs::try_parse_from(["propmatch", "metadata"]).is_err());
    }

    #[test]
    fn test_config_flag_wins() {
        let args = CliArgs::try_parse_from([
            "propmatch",
            "--config",
            "/tmp/custom.toml",
            "check-schema",
        ])
        .unwrap();
        assert_eq!(args.resolve_config_path(), PathBuf::from("/tmp/custom.toml"));
        assert_eq!(args.command, Command::CheckSchema { path: None });
    }

    #[test]
    fn test_log_level_flag_wins() {
        let args =
            CliArgs::try_parse_from(["propmatch", "--log-level", "trace", "check-schema"]).unwrap();
        assert_eq!(args.resolve_log_level("warn"), "trace");
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/var/db.sqlite"), PathBuf::from("/var/db.sqlite"));
        assert!(expand_home("~/.propmatch/propmatch.db").ends_with(".propmatch/propmatch.db"));
    }
}
