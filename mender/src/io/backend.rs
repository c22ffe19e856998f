//! Model backend abstraction and the HTTP chat-completions implementation.
//!
//! The [`ModelBackend`] trait decouples the loop from the actual service.
//! Tests use scripted backends that return predetermined replies without any
//! network traffic. Only two failure kinds are distinguished for retry
//! purposes (rate limiting and token overflow); every other failure is one
//! opaque service error.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::BackendConfig;

/// One request to the model: system instruction plus user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRequest {
    pub system: String,
    pub user: String,
}

/// The model's free-text reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelReply {
    pub text: String,
}

/// Backend failure kinds the loop branches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Quota exhausted; retry after backoff.
    RateLimited { retry_after: Option<Duration> },
    /// The request exceeded the model's context window; shrink and retry.
    TokenOverflow,
    /// Anything else, treated as one opaque kind.
    Service(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::RateLimited { retry_after } => match retry_after {
                Some(d) => write!(f, "backend rate limited (retry after {}s)", d.as_secs()),
                None => write!(f, "backend rate limited"),
            },
            BackendError::TokenOverflow => write!(f, "request exceeded the model token limit"),
            BackendError::Service(msg) => write!(f, "backend error: {msg}"),
        }
    }
}

impl std::error::Error for BackendError {}

/// Abstraction over generative model services.
pub trait ModelBackend {
    /// Send one request and return the reply text.
    fn generate(&self, request: &ModelRequest) -> Result<ModelReply, BackendError>;

    /// Exact token count for a request, when the service supports it. The
    /// assembler falls back to its rough estimate on `None`.
    fn count_tokens(&self, _request: &ModelRequest) -> Option<usize> {
        None
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: String,
}

/// Backend speaking the OpenAI-style chat-completions protocol.
pub struct HttpBackend {
    client: reqwest::blocking::Client,
    config: BackendConfig,
    api_key: String,
}

impl HttpBackend {
    /// Build a client from configuration, reading the API key from the
    /// configured environment variable.
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            anyhow!(
                "no API key found in ${} (set it or change backend.api_key_env)",
                config.api_key_env
            )
        })?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            config: config.clone(),
            api_key,
        })
    }
}

impl ModelBackend for HttpBackend {
    #[instrument(skip_all, fields(model = %self.config.model))]
    fn generate(&self, request: &ModelRequest) -> Result<ModelReply, BackendError> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                Message {
                    role: "system",
                    content: &request.system,
                },
                Message {
                    role: "user",
                    content: &request.user,
                },
            ],
            max_tokens: self.config.max_output_tokens,
            stream: false,
        };

        let response = self
            .client
            .post(&self.config.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .map_err(|e| BackendError::Service(format!("request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .map_err(|e| BackendError::Service(format!("read response body: {e}")))?;

        if status.as_u16() == 429 {
            warn!("backend rate limited");
            return Err(BackendError::RateLimited {
                retry_after: parse_retry_after(&text).map(Duration::from_secs),
            });
        }
        if !status.is_success() {
            if is_token_overflow(&text) {
                warn!("backend reported token overflow");
                return Err(BackendError::TokenOverflow);
            }
            return Err(BackendError::Service(format!(
                "status {status}: {}",
                excerpt(&text, 400)
            )));
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| BackendError::Service(format!("unparseable response: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        debug!(chars = content.len(), "received model reply");
        Ok(ModelReply { text: content })
    }
}

/// Extract a retry-after hint from a rate-limit response body, if present.
/// Looks for patterns like "retry after X seconds".
fn parse_retry_after(text: &str) -> Option<u64> {
    let lower = text.to_lowercase();
    let pos = lower.find("retry")?;
    for word in lower[pos..].split_whitespace().skip(1).take(5) {
        if let Ok(secs) = word
            .trim_matches(|c: char| !c.is_numeric())
            .parse::<u64>()
        {
            if secs > 0 && secs < 300 {
                return Some(secs);
            }
        }
    }
    None
}

fn is_token_overflow(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("context length")
        || lower.contains("context_length_exceeded")
        || lower.contains("maximum number of tokens")
        || lower.contains("token limit")
}

fn excerpt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}
