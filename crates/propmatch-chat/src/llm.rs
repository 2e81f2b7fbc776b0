//! LLM client contract and prompt types.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use propmatch_core::config::LlmConfig;
use propmatch_core::Role;

/// Errors from an LLM provider.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API key not set: environment variable {0} is empty")]
    MissingApiKey(String),
    #[error("HTTP request failed: {0}")]
    Http(String),
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("rate limited")]
    RateLimited,
    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to parse provider response: {0}")]
    Deserialization(String),
    #[error("provider returned an empty completion")]
    EmptyResponse,
    #[error("request timed out after {0} ms")]
    Timeout(u64),
}

/// Author of a prompt message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Role> for MessageRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => MessageRole::User,
            Role::Assistant => MessageRole::Assistant,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: MessageRole,
    pub content: String,
}

/// An ordered chat-format prompt.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Prompt {
    messages: Vec<PromptMessage>,
}

impl Prompt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, role: MessageRole, content: impl Into<String>) {
        self.messages.push(PromptMessage {
            role,
            content: content.into(),
        });
    }

    pub fn system(mut self, content: impl Into<String>) -> Self {
        self.push(MessageRole::System, content);
        self
    }

    pub fn user(mut self, content: impl Into<String>) -> Self {
        self.push(MessageRole::User, content);
        self
    }

    pub fn messages(&self) -> &[PromptMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&PromptMessage> {
        self.messages.last()
    }

    /// Every message's content joined, for assertions and debug logs.
    pub fn text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Per-call generation settings. `model: None` uses the client's default.
#[derive(Clone, Debug, PartialEq)]
pub struct CompletionOptions {
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionOptions {
    /// Settings for user-facing replies.
    pub fn reply(config: &LlmConfig) -> Self {
        Self {
            model: Some(config.model.clone()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    /// Settings for metadata extraction: deterministic and short.
    pub fn extraction(config: &LlmConfig) -> Self {
        Self {
            model: Some(config.extraction_model.clone()),
            temperature: 0.0,
            max_tokens: 512,
        }
    }
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            model: None,
            temperature: 0.7,
            max_tokens: 1024,
        }
    }
}

/// Text generation provider.
///
/// Implementations do not enforce their own deadline beyond transport
/// timeouts; callers wrap calls in `tokio::time::timeout`.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &Prompt, options: &CompletionOptions) -> Result<String, LlmError>;
}
