//! Ollama API client (http://127.0.0.1:11434 by default).
//! Non-streaming chat only: POST /api/chat with `stream: false`.

use crate::llm::{
    build_messages, ChatMessage, CompletionClient, CompletionError, CompletionRequest,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";
const DEFAULT_MODEL: &str = "llama3.2:latest";

/// Client for Ollama HTTP API.
#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    model: String,
    system_prompt: Option<String>,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(
        base_url: Option<String>,
        model: Option<String>,
        system_prompt: Option<String>,
    ) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            system_prompt,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<ChatMessage>,
}

#[async_trait]
impl CompletionClient for OllamaClient {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        timeout: Duration,
    ) -> Result<String, CompletionError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: build_messages(self.system_prompt.as_deref(), request),
            stream: false,
        };
        let res = self
            .client
            .post(&url)
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(CompletionError::from_transport)?;
        let status = res.status();
        let text = res.text().await.map_err(CompletionError::from_transport)?;
        if !status.is_success() {
            return Err(CompletionError::rejected(status.as_u16(), &text));
        }
        let data: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| CompletionError::MalformedResponse(e.to_string()))?;
        data.message
            .map(|m| m.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                CompletionError::MalformedResponse("missing message.content".to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    #[tokio::test]
    async fn chat_returns_message_content() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/chat")
            .match_body(Matcher::PartialJson(json!({
                "model": "qwen3:8b",
                "stream": false,
                "messages": [{ "role": "user", "content": "hello" }]
            })))
            .with_status(200)
            .with_body(
                json!({
                    "model": "qwen3:8b",
                    "message": { "role": "assistant", "content": "Hi there" },
                    "done": true
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = OllamaClient::new(Some(server.url()), Some("qwen3:8b".to_string()), None);
        let reply = client
            .complete(&CompletionRequest::new("hello"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply, "Hi there");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn error_string_is_provider_message() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/chat")
            .with_status(404)
            .with_body(r#"{"error":"model \"qwen3:8b\" not found, try pulling it first"}"#)
            .create_async()
            .await;

        let client = OllamaClient::new(Some(server.url()), Some("qwen3:8b".to_string()), None);
        let err = client
            .complete(&CompletionRequest::new("hello"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CompletionError::ProviderRejected {
                status: Some(404),
                message: "model \"qwen3:8b\" not found, try pulling it first".to_string()
            }
        );
    }
}
