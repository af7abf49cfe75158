//! OpenAI-compatible chat completions client (OpenAI, Groq, LM Studio's /v1 API).
//!
//! POST {base}/chat/completions with a bearer token; the reply is `choices[0].message.content`.

use crate::llm::{
    build_messages, ChatMessage, CompletionClient, CompletionError, CompletionRequest,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai/v1";
const DEFAULT_MODEL: &str = "llama-3.1-8b-instant";

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct OpenAiClient {
    base_url: String,
    api_key: Option<String>,
    model: String,
    system_prompt: Option<String>,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(
        base_url: Option<String>,
        api_key: Option<String>,
        model: Option<String>,
        system_prompt: Option<String>,
    ) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let model = model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        if api_key.is_none() {
            log::warn!("openai: no api key configured for {}", base_url);
        }
        Self {
            base_url,
            api_key,
            model,
            system_prompt,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    message: Option<OpenAiResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// First choice's content; anything else is a malformed success envelope.
fn first_completion(body: &str) -> Result<String, CompletionError> {
    let data: OpenAiChatResponse = serde_json::from_str(body)
        .map_err(|e| CompletionError::MalformedResponse(e.to_string()))?;
    data.choices
        .into_iter()
        .next()
        .and_then(|c| c.message)
        .and_then(|m| m.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| {
            CompletionError::MalformedResponse("missing choices[0].message.content".to_string())
        })
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        timeout: Duration,
    ) -> Result<String, CompletionError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = OpenAiChatRequest {
            model: &self.model,
            messages: build_messages(self.system_prompt.as_deref(), request),
        };
        let mut req = self.client.post(&url).json(&body).timeout(timeout);
        if let Some(ref key) = self.api_key {
            req = req.bearer_auth(key);
        }
        let res = req.send().await.map_err(CompletionError::from_transport)?;
        let status = res.status();
        let text = res.text().await.map_err(CompletionError::from_transport)?;
        log::debug!("openai: response ({}) {} bytes", status, text.len());
        if !status.is_success() {
            return Err(CompletionError::rejected(status.as_u16(), &text));
        }
        first_completion(&text)
    }
}
