use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{PropmatchError, Result};

/// Top-level configuration for the PropMatch assistant.
///
/// Loaded from `~/.propmatch/config.toml` by default. Each section maps to
/// one collaborator of the turn pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropmatchConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub grounding: GroundingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl PropmatchConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PropmatchConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| PropmatchError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
    /// Domain schema file. Empty means the built-in real-estate schema.
    pub schema_path: String,
    /// JSON file of listings loaded into the vector index at startup.
    pub listings_path: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            schema_path: String::new(),
            listings_path: "~/.propmatch/listings.json".to_string(),
        }
    }
}

/// Turn pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Maximum accepted message length in characters.
    pub max_message_chars: usize,
    /// Number of prior turns loaded into the prompt.
    pub history_limit: usize,
    /// Timeout for reply generation, in milliseconds.
    pub llm_timeout_ms: u64,
    /// Timeout for metadata extraction, in milliseconds.
    pub extraction_timeout_ms: u64,
    /// Patch entries below this confidence are ignored.
    pub min_patch_confidence: f32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_message_chars: 2000,
            history_limit: 10,
            llm_timeout_ms: 30_000,
            extraction_timeout_ms: 15_000,
            min_patch_confidence: 0.5,
        }
    }
}

/// Vector search settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Similarity metric of the listing index: "cosine" or "dot_product".
    pub metric: String,
    /// Embedding dimension; must match the index.
    pub embedding_dim: usize,
    /// Number of listings retrieved per turn.
    pub top_k: usize,
    /// Minimum similarity for a listing to be returned.
    pub score_threshold: f64,
    /// OpenAI-compatible embeddings endpoint. Empty uses the offline mock.
    pub embedding_url: String,
    /// Embedding model name sent to the endpoint.
    pub embedding_model: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            metric: "cosine".to_string(),
            embedding_dim: 384,
            top_k: 5,
            score_threshold: 0.2,
            embedding_url: String::new(),
            embedding_model: "text-embedding-3-small".to_string(),
        }
    }
}

/// LLM provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI-compatible chat completions endpoint.
    pub base_url: String,
    /// Model used for replies.
    pub model: String,
    /// Model used for metadata extraction.
    pub extraction_model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Sent as `HTTP-Referer`.
    pub site_url: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            model: "anthropic/claude-3-haiku".to_string(),
            extraction_model: "mistralai/mistral-7b-instruct".to_string(),
            api_key_env: "OPENROUTER_API_KEY".to_string(),
            site_url: "https://propmatchiq.com".to_string(),
            temperature: 0.7,
            max_tokens: 1024,
        }
    }
}

/// Reply grounding settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroundingConfig {
    /// Regex matching listing ids in generated replies.
    pub listing_id_pattern: String,
    /// Reply sent instead of a reply that fails grounding.
    pub fallback_reply: String,
}

impl Default for GroundingConfig {
    fn default() -> Self {
        Self {
            listing_id_pattern: r"\b[A-Z]{2,5}-\d{3,}\b".to_string(),
            fallback_reply: "I'm sorry, I wasn't able to find any additional listings that match \
                your request. Would you like to adjust your preferences?"
                .to_string(),
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file holding turns and metadata.
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "~/.propmatch/propmatch.db".to_string(),
        }
    }
}
