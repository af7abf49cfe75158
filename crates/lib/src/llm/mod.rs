//! Completion providers behind one contract.
//!
//! The relay only sees `CompletionClient`; OpenAI-compatible endpoints (OpenAI, Groq,
//! LM Studio) and native Ollama are interchangeable implementations.

mod ollama;
mod openai;

pub use ollama::OllamaClient;
pub use openai::OpenAiClient;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Message returned to the caller when the provider gave no readable error.
pub const UNKNOWN_PROVIDER_ERROR: &str = "unknown provider error";

/// One user turn, optionally with a system prompt that overrides the client's configured one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub system_prompt: Option<String>,
    pub user_text: String,
}

impl CompletionRequest {
    pub fn new(user_text: impl Into<String>) -> Self {
        Self {
            system_prompt: None,
            user_text: user_text.into(),
        }
    }
}

/// Chat message on the wire (`{role, content}`), shared by both providers.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

impl ChatMessage {
    fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }
}

/// System prompt (request wins over the configured one) followed by the user turn.
pub(crate) fn build_messages(
    configured: Option<&str>,
    request: &CompletionRequest,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(2);
    let system = request
        .system_prompt
        .as_deref()
        .or(configured)
        .map(str::trim)
        .filter(|s| !s.is_empty());
    if let Some(system) = system {
        messages.push(ChatMessage::new("system", system));
    }
    messages.push(ChatMessage::new("user", &request.user_text));
    messages
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompletionError {
    #[error("completion timed out")]
    Timeout,
    /// Non-2xx response (`status` set) or no response at all (`status` is None).
    #[error("completion provider rejected request: {message}")]
    ProviderRejected { status: Option<u16>, message: String },
    #[error("malformed completion response: {0}")]
    MalformedResponse(String),
}

impl CompletionError {
    /// Timeouts, unreachable providers and 408/429/5xx are retried; the rest are final.
    pub fn is_transient(&self) -> bool {
        match self {
            CompletionError::Timeout => true,
            CompletionError::ProviderRejected { status: None, .. } => true,
            CompletionError::ProviderRejected {
                status: Some(status),
                ..
            } => crate::channels::is_transient_status(*status),
            CompletionError::MalformedResponse(_) => false,
        }
    }

    /// Classify a reqwest failure that produced no usable response.
    pub(crate) fn from_transport(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CompletionError::Timeout
        } else if e.is_decode() {
            CompletionError::MalformedResponse(e.to_string())
        } else {
            CompletionError::ProviderRejected {
                status: None,
                message: e.to_string(),
            }
        }
    }

    /// Classify a non-2xx response from its status and body.
    pub(crate) fn rejected(status: u16, body: &str) -> Self {
        CompletionError::ProviderRejected {
            status: Some(status),
            message: provider_error_message(body),
        }
    }
}

/// Human-readable error from a provider error body: `error.message` (OpenAI style) or
/// `error` as a string (Ollama style); otherwise a generic message.
pub fn provider_error_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return UNKNOWN_PROVIDER_ERROR.to_string();
    };
    let message = match value.get("error") {
        Some(serde_json::Value::String(s)) => Some(s.as_str()),
        Some(err) => err.get("message").and_then(|m| m.as_str()),
        None => value.get("message").and_then(|m| m.as_str()),
    };
    message
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| UNKNOWN_PROVIDER_ERROR.to_string())
}

/// Text completion from one upstream provider.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Provider name (e.g. "openai"), used in logs and circuit names.
    fn name(&self) -> &str;

    /// Complete one turn; must return `Timeout` rather than hang past `timeout`.
    async fn complete(
        &self,
        request: &CompletionRequest,
        timeout: Duration,
    ) -> Result<String, CompletionError>;
}

/// Build the configured completion client (backend, base URL, model, key, system prompt).
pub fn client_from_config(config: &crate::config::Config) -> Arc<dyn CompletionClient> {
    use crate::config::{self, CompletionBackend};
    let base_url = config::resolve_completion_base_url(config);
    let model = config::resolve_completion_model(config);
    let system_prompt = config.completion.system_prompt.clone();
    match config.completion.backend {
        CompletionBackend::Openai => Arc::new(OpenAiClient::new(
            base_url,
            config::resolve_completion_api_key(config),
            model,
            system_prompt,
        )),
        CompletionBackend::Ollama => Arc::new(OllamaClient::new(base_url, model, system_prompt)),
    }
}
