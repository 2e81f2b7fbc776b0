//! OpenRouterClient -- [`LlmClient`] over an OpenAI-compatible
//! chat-completions endpoint (OpenRouter by default).
//!
//! The API key is read from the environment variable named in
//! `llm.api_key_env` and is only exposed when building request headers.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use propmatch_core::config::LlmConfig;

use crate::llm::{CompletionOptions, LlmClient, LlmError, Prompt, PromptMessage};

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [PromptMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions client.
///
/// Does not derive Debug so the API key never appears in logs.
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    default_model: String,
    site_url: String,
    timeout: Duration,
}

impl OpenRouterClient {
    /// Build a client from configuration, reading the API key from the
    /// configured environment variable.
    pub fn from_config(config: &LlmConfig, timeout: Duration) -> Result<Self, LlmError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| LlmError::MissingApiKey(config.api_key_env.clone()))?;
        Self::new(config, api_key, timeout)
    }

    pub fn new(config: &LlmConfig, api_key: String, timeout: Duration) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Http(e.to_string()))?;

        info!(base_url = %config.base_url, model = %config.model, "LLM client configured");

        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.clone(),
            default_model: config.model.clone(),
            site_url: config.site_url.clone(),
            timeout,
        })
    }
}

#[async_trait]
impl LlmClient for OpenRouterClient {
    async fn complete(&self, prompt: &Prompt, options: &CompletionOptions) -> Result<String, LlmError> {
        let model = options.model.as_deref().unwrap_or(&self.default_model);
        let body = ChatCompletionRequest {
            model,
            messages: prompt.messages(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        debug!(model, messages = prompt.len(), "Sending completion request");

        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", &self.site_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.timeout.as_millis() as u64)
                } else {
                    LlmError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => LlmError::AuthenticationFailed,
                429 => LlmError::RateLimited,
                code => LlmError::Status {
                    status: code,
                    body: error_body,
                },
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?;
        parse_completion(&text)
    }
}

/// Extract the first choice's content from a chat-completions response body.
fn parse_completion(body: &str) -> Result<String, LlmError> {
    let parsed: ChatCompletionResponse = serde_json::from_str(body)
        .map_err(|e| LlmError::Deserialization(e.to_string()))?;

    if let Some(ref model) = parsed.model {
        debug!(model = %model, "Completion received");
    }

    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|c| c.trim().to_string())
        .unwrap_or_default();

    if content.is_empty() {
        return Err(LlmError::EmptyResponse);
    }
    Ok(content)
}
