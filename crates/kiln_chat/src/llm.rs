//! LLM adapter used as the classification collaborator.
//!
//! Supports OpenAI and Anthropic APIs, selected via environment variables or
//! the `[llm]` config section.

use std::time::Duration;

use async_trait::async_trait;
use kiln_core::LlmSettings;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::classifier::Classifier;
use crate::error::{ChatError, ChatResult};
use crate::types::{Message, MessageRole};

const OPENAI_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const MAX_ATTEMPTS: u32 = 3;

/// LLM provider type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    OpenAI,
    Anthropic,
}

impl LlmProvider {
    fn default_model(&self) -> &'static str {
        match self {
            Self::OpenAI => "gpt-4o-mini",
            Self::Anthropic => "claude-3-5-haiku-latest",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::OpenAI => "OpenAI",
            Self::Anthropic => "Anthropic",
        }
    }
}

/// Pick a provider and key. A preferred provider must have its key; without a
/// preference OpenAI wins over Anthropic.
pub fn select_provider(
    preferred: Option<&str>,
    openai_key: Option<String>,
    anthropic_key: Option<String>,
) -> ChatResult<(LlmProvider, String)> {
    let openai_key = openai_key.filter(|k| !k.is_empty());
    let anthropic_key = anthropic_key.filter(|k| !k.is_empty());

    match preferred.map(|p| p.trim().to_ascii_lowercase()).as_deref() {
        Some("openai") => openai_key
            .map(|k| (LlmProvider::OpenAI, k))
            .ok_or(ChatError::LlmNotConfigured),
        Some("anthropic") => anthropic_key
            .map(|k| (LlmProvider::Anthropic, k))
            .ok_or(ChatError::LlmNotConfigured),
        Some(other) => Err(ChatError::Llm(format!("unsupported LLM provider: {}", other))),
        None => openai_key
            .map(|k| (LlmProvider::OpenAI, k))
            .or_else(|| anthropic_key.map(|k| (LlmProvider::Anthropic, k)))
            .ok_or(ChatError::LlmNotConfigured),
    }
}

/// LLM adapter that handles API calls
pub struct LlmAdapter {
    provider: LlmProvider,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl LlmAdapter {
    /// Create a new LLM adapter with explicit configuration
    pub fn new(provider: LlmProvider, api_key: String, model: Option<String>) -> Self {
        let defaults = LlmSettings::default();
        Self {
            provider,
            api_key,
            model: model.unwrap_or_else(|| provider.default_model().to_string()),
            base_url: match provider {
                LlmProvider::OpenAI => OPENAI_URL.to_string(),
                LlmProvider::Anthropic => ANTHROPIC_URL.to_string(),
            },
            max_tokens: defaults.max_tokens,
            temperature: defaults.temperature,
            client: reqwest::Client::new(),
        }
    }

    /// Create an LLM adapter from environment variables
    ///
    /// Checks `OPENAI_API_KEY` then `ANTHROPIC_API_KEY`; `KILN_LLM_MODEL`
    /// overrides the model and `OPENAI_BASE_URL` the OpenAI endpoint.
    pub fn from_env() -> ChatResult<Self> {
        Self::from_settings(&LlmSettings::default())
    }

    /// Create an LLM adapter from config, with credentials from the environment.
    pub fn from_settings(settings: &LlmSettings) -> ChatResult<Self> {
        let (provider, api_key) = select_provider(
            settings.provider.as_deref(),
            std::env::var("OPENAI_API_KEY").ok(),
            std::env::var("ANTHROPIC_API_KEY").ok(),
        )?;

        let model = std::env::var("KILN_LLM_MODEL")
            .ok()
            .filter(|m| !m.is_empty())
            .or_else(|| settings.model.clone());

        let mut adapter = Self::new(provider, api_key, model);
        adapter.max_tokens = settings.max_tokens;
        adapter.temperature = settings.temperature;
        if provider == LlmProvider::OpenAI {
            if let Ok(base_url) = std::env::var("OPENAI_BASE_URL") {
                if !base_url.is_empty() {
                    adapter.base_url = base_url.trim_end_matches('/').to_string();
                }
            }
        }
        Ok(adapter)
    }

    /// Get the current provider
    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    /// Get the current model
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Complete a conversation, with `system_prompt` as the system message.
    pub async fn complete(&self, system_prompt: &str, history: &[Message]) -> ChatResult<String> {
        match self.provider {
            LlmProvider::OpenAI => self.complete_openai(system_prompt, history).await,
            LlmProvider::Anthropic => self.complete_anthropic(system_prompt, history).await,
        }
    }

    async fn complete_openai(&self, system_prompt: &str, history: &[Message]) -> ChatResult<String> {
        let mut messages = vec![ChatMessage {
            role: "system",
            content: system_prompt.to_string(),
        }];
        messages.extend(history.iter().map(|m| ChatMessage {
            role: match m.role {
                MessageRole::System => "system",
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
            },
            content: m.content.clone(),
        }));

        let request = OpenAIRequest {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .send_with_retry(|| {
                self.client
                    .post(&url)
                    .header("Authorization", format!("Bearer {}", self.api_key))
                    .json(&request)
            })
            .await?;

        let result: OpenAIResponse = response
            .json()
            .await
            .map_err(|e| ChatError::Llm(format!("Failed to parse response: {}", e)))?;
        result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ChatError::Llm("No response from OpenAI".to_string()))
    }

    async fn complete_anthropic(
        &self,
        system_prompt: &str,
        history: &[Message],
    ) -> ChatResult<String> {
        // Anthropic takes the system prompt separately and only user/assistant turns
        let messages = history
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| ChatMessage {
                role: if m.role == MessageRole::Assistant {
                    "assistant"
                } else {
                    "user"
                },
                content: m.content.clone(),
            })
            .collect();

        let request = AnthropicRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system: system_prompt,
            messages,
        };
        let response = self
            .send_with_retry(|| {
                self.client
                    .post(&self.base_url)
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", "2023-06-01")
                    .json(&request)
            })
            .await?;

        let result: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ChatError::Llm(format!("Failed to parse response: {}", e)))?;
        let text: Vec<String> = result.content.into_iter().filter_map(|c| c.text).collect();
        if text.is_empty() {
            return Err(ChatError::Llm("No response from Anthropic".to_string()));
        }
        Ok(text.join(""))
    }

    /// Send a request, retrying 5xx and 429 responses with backoff.
    async fn send_with_retry<F>(&self, build: F) -> ChatResult<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_error = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
            }

            let response = build()
                .send()
                .await
                .map_err(|e| ChatError::Llm(format!("Network error: {}", e)))?;

            let status = response.status();
            if status.is_server_error() || status.as_u16() == 429 {
                let body = response.text().await.unwrap_or_default();
                warn!(
                    "{} API error {} (attempt {}/{})",
                    self.provider.label(),
                    status,
                    attempt + 1,
                    MAX_ATTEMPTS
                );
                last_error = Some(ChatError::Llm(format!(
                    "{} API error {}: {}",
                    self.provider.label(),
                    status,
                    body
                )));
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ChatError::Llm(format!(
                    "{} API error {}: {}",
                    self.provider.label(),
                    status,
                    body
                )));
            }

            debug!("{} responded on attempt {}", self.provider.label(), attempt + 1);
            return Ok(response);
        }

        Err(last_error.unwrap_or_else(|| ChatError::Llm("Max retries exceeded".to_string())))
    }
}

#[async_trait]
impl Classifier for LlmAdapter {
    async fn classify(&self, system_prompt: &str, history: &[Message]) -> ChatResult<String> {
        self.complete(system_prompt, history).await
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

// OpenAI API types
#[derive(Debug, Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

// Anthropic API types
#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: Option<String>,
}
