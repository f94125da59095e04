//! Client side of the hosted completion service.

#[cfg(test)]
mod tests;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::config::GenerationConfig;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    #[error("completion service rate limit exceeded")]
    RateLimited,
    #[error("completion request timed out")]
    Timeout,
    #[error("completion service error (HTTP {status})")]
    Server { status: u16 },
    #[error("completion request rejected (HTTP {status})")]
    Client { status: u16 },
    #[error("could not reach completion service: {0}")]
    Transport(String),
    #[error("invalid completion response: {0}")]
    InvalidResponse(String),
}

impl CompletionError {
    /// Rate limits, timeouts, server errors and transport failures are worth retrying.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::Timeout | Self::Server { .. } | Self::Transport(_)
        )
    }
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    fn model(&self) -> &str;

    /// One attempt; retrying is the caller's business.
    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError>;
}

/// OpenAI-compatible `/chat/completions` client (Groq by default).
#[derive(Debug, Clone)]
pub struct ChatCompletionClient {
    endpoint: Url,
    model: String,
    api_key: Option<String>,
    agent: ureq::Agent,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

impl ChatCompletionClient {
    /// Reads the API key from the environment variable named in `config`.
    /// Without one, requests go out unauthenticated.
    #[inline]
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let endpoint = config
            .endpoint_url()
            .context("Invalid completion endpoint in config")?;

        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());
        if api_key.is_none() {
            warn!(
                "{} is not set; completion requests will be sent without credentials",
                config.api_key_env
            );
        }

        Ok(Self {
            endpoint,
            model: config.model.clone(),
            api_key,
            agent: build_agent(Duration::from_secs(config.request_timeout_seconds.max(1))),
        })
    }

    #[inline]
    #[must_use]
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = build_agent(timeout);
        self
    }

    #[inline]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    #[inline]
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    #[inline]
    pub fn complete_blocking(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let body = serde_json::to_string(&ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        })
        .map_err(|e| CompletionError::InvalidResponse(format!("could not encode request: {e}")))?;

        debug!("Sending completion request to {}", self.endpoint);

        let mut builder = self
            .agent
            .post(self.endpoint.as_str())
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response_text = builder
            .send(&body)
            .and_then(|mut resp| resp.body_mut().read_to_string())
            .map_err(classify_error)?;

        let response: ChatResponse = serde_json::from_str(&response_text)
            .map_err(|e| CompletionError::InvalidResponse(e.to_string()))?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| CompletionError::InvalidResponse("response has no choices".to_string()))
    }
}

#[async_trait]
impl CompletionClient for ChatCompletionClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let client = self.clone();
        let request = request.clone();
        tokio::task::spawn_blocking(move || client.complete_blocking(&request))
            .await
            .map_err(|e| CompletionError::Transport(format!("completion task failed: {e}")))?
    }
}

fn classify_error(error: ureq::Error) -> CompletionError {
    match error {
        ureq::Error::StatusCode(429) => CompletionError::RateLimited,
        ureq::Error::StatusCode(status) if status >= 500 => CompletionError::Server { status },
        ureq::Error::StatusCode(status) => CompletionError::Client { status },
        ureq::Error::Timeout(_) => CompletionError::Timeout,
        other => CompletionError::Transport(other.to_string()),
    }
}

fn build_agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build()
        .into()
}
