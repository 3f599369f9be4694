//! Chat completion clients.
//!
//! [`ChatModel`] is the seam between the agent and the providers. Two HTTP
//! clients implement it:
//!
//! - **[`AnthropicClient`]**: `POST {anthropic_url}/v1/messages`
//! - **[`OpenAiClient`]**: `POST {openai_url}/chat/completions`
//!
//! [`LlmRouter`] picks one per request from the model name: `gpt*`, `o1*`,
//! `o3*` and `o4*` go to OpenAI, everything else to Anthropic.
//!
//! # Retry Strategy
//!
//! Same policy as the embedding providers:
//! - HTTP 429 and 5xx → retry with backoff 1s, 2s, 4s, ...
//! - Other 4xx → fail immediately
//! - Network errors → retry

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub model: String,
    pub usage: Usage,
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Anthropic,
    OpenAi,
}

pub fn provider_for_model(model: &str) -> Provider {
    let model = model.to_ascii_lowercase();
    if ["gpt", "o1", "o3", "o4"].iter().any(|p| model.starts_with(p)) {
        Provider::OpenAi
    } else {
        Provider::Anthropic
    }
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .context("Failed to create HTTP client")
}

/// Send a JSON POST built by `make`, retrying transient failures.
async fn send_with_retry<F>(label: &str, max_retries: u32, make: F) -> Result<Value>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        match make().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response
                        .json()
                        .await
                        .with_context(|| format!("Invalid {} response body", label));
                }

                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    tracing::warn!(attempt, %status, provider = label, "Chat request failed, retrying");
                    last_err = Some(anyhow!("{} API error {}: {}", label, status, body_text));
                    continue;
                }
                bail!("{} API error {}: {}", label, status, body_text);
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, provider = label, "Chat request failed, retrying");
                last_err = Some(e.into());
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("{} request failed after retries", label)))
}

// ============ Anthropic ============

pub struct AnthropicClient {
    client: reqwest::Client,
    base_url: String,
    version: String,
    api_key: Option<String>,
    max_retries: u32,
}

impl AnthropicClient {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            client: http_client(config.llm.timeout_secs)?,
            base_url: config.llm.anthropic_url.trim_end_matches('/').to_string(),
            version: config.llm.anthropic_version.clone(),
            api_key: config.secrets.anthropic_api_key.clone(),
            max_retries: config.llm.max_retries,
        })
    }
}

#[async_trait]
impl ChatModel for AnthropicClient {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("ANTHROPIC_API_KEY not set"))?;

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": request.messages,
        });
        if let Some(system) = &request.system {
            body["system"] = Value::String(system.clone());
        }

        let url = format!("{}/v1/messages", self.base_url);
        let json = send_with_retry("Anthropic", self.max_retries, || {
            self.client
                .post(&url)
                .header("x-api-key", api_key)
                .header("anthropic-version", &self.version)
                .json(&body)
        })
        .await?;

        parse_anthropic_response(&json, &request.model)
    }
}

/// Concatenates the text blocks of `content[]`.
fn parse_anthropic_response(json: &Value, requested_model: &str) -> Result<ChatResponse> {
    let blocks = json
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("Invalid Anthropic response: missing content"))?;

    let text: String = blocks
        .iter()
        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");

    let usage = json.get("usage");
    let tokens = |key: &str| {
        usage
            .and_then(|u| u.get(key))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
    };

    Ok(ChatResponse {
        text,
        model: json
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(requested_model)
            .to_string(),
        usage: Usage::new(tokens("input_tokens"), tokens("output_tokens")),
    })
}

// ============ OpenAI ============

pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    temperature: f32,
    max_retries: u32,
}

impl OpenAiClient {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            client: http_client(config.llm.timeout_secs)?,
            base_url: config.llm.openai_url.trim_end_matches('/').to_string(),
            api_key: config.secrets.openai_api_key.clone(),
            temperature: config.llm.temperature,
            max_retries: config.llm.max_retries,
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiClient {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("OPENAI_API_KEY not set"))?;

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        for m in &request.messages {
            messages.push(json!({"role": m.role.as_str(), "content": m.content}));
        }

        let body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "temperature": self.temperature,
            "messages": messages,
        });

        let url = format!("{}/chat/completions", self.base_url);
        let json = send_with_retry("OpenAI", self.max_retries, || {
            self.client
                .post(&url)
                .header("Authorization", format!("Bearer {}", api_key))
                .json(&body)
        })
        .await?;

        parse_openai_response(&json, &request.model)
    }
}

fn parse_openai_response(json: &Value, requested_model: &str) -> Result<ChatResponse> {
    let text = json
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing choices[0].message.content"))?
        .to_string();

    let tokens = |key: &str| {
        json.pointer(&format!("/usage/{}", key))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
    };

    Ok(ChatResponse {
        text,
        model: json
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(requested_model)
            .to_string(),
        usage: Usage::new(tokens("prompt_tokens"), tokens("completion_tokens")),
    })
}

// ============ Router ============

/// Dispatches each request to the provider that serves its model.
pub struct LlmRouter {
    anthropic: AnthropicClient,
    openai: OpenAiClient,
}

impl LlmRouter {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            anthropic: AnthropicClient::new(config)?,
            openai: OpenAiClient::new(config)?,
        })
    }
}

#[async_trait]
impl ChatModel for LlmRouter {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
        match provider_for_model(&request.model) {
            Provider::OpenAi => self.openai.complete(request).await,
            Provider::Anthropic => self.anthropic.complete(request).await,
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Replays canned replies and records every request it receives.
    /// Once the script runs out it echoes the last user message.
    #[derive(Default)]
    pub struct ScriptedModel {
        replies: Mutex<Vec<Result<String, String>>>,
        pub requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedModel {
        pub fn new(replies: Vec<Result<&str, &str>>) -> Self {
            Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .rev()
                        .map(|r| r.map(str::to_string).map_err(str::to_string))
                        .collect(),
                ),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(&self, request: &ChatRequest) -> Result<ChatResponse> {
            self.requests.lock().unwrap().push(request.clone());
            let next = self.replies.lock().unwrap().pop();
            let text = match next {
                Some(Ok(text)) => text,
                Some(Err(message)) => bail!(message),
                None => request
                    .messages
                    .last()
                    .map(|m| m.content.clone())
                    .unwrap_or_default(),
            };
            Ok(ChatResponse {
                text,
                model: request.model.clone(),
                usage: Usage::new(10, 5),
            })
        }
    }
}
