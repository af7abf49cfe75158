//! Gupshup WhatsApp gateway: form-encoded POST to the send-message API.

use crate::channels::delivery::{DeliveryClient, DeliveryError, DeliveryResult, OutboundMessage};
use async_trait::async_trait;
use std::time::Duration;

const DEFAULT_API_URL: &str = "https://api.gupshup.io/wa/api/v1/msg";

/// Delivery client for the Gupshup messaging API.
#[derive(Clone)]
pub struct GupshupClient {
    id: String,
    api_url: String,
    api_key: Option<String>,
    source: Option<String>,
    src_name: String,
    channel: String,
    client: reqwest::Client,
}

impl GupshupClient {
    pub fn new(
        api_url: Option<String>,
        api_key: Option<String>,
        source: Option<String>,
        src_name: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        let api_url = api_url
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        if api_key.is_none() {
            log::warn!("gupshup: no api key configured, deliveries will be rejected");
        }
        Self {
            id: "gupshup".to_string(),
            api_url,
            api_key,
            source,
            src_name: src_name.into(),
            channel: channel.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Build from the delivery section, with env overrides applied.
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(
            Some(config.delivery.api_url.clone()),
            crate::config::resolve_delivery_api_key(config),
            crate::config::resolve_delivery_source(config),
            config.delivery.src_name.clone(),
            config.delivery.channel.clone(),
        )
    }

    /// Form fields for one outbound message.
    fn form<'a>(&'a self, message: &'a OutboundMessage) -> Vec<(&'static str, &'a str)> {
        vec![
            ("channel", self.channel.as_str()),
            ("source", self.source.as_deref().unwrap_or("")),
            ("destination", message.conversation_id.as_str()),
            ("message", message.text.as_str()),
            ("src.name", self.src_name.as_str()),
        ]
    }
}

#[async_trait]
impl DeliveryClient for GupshupClient {
    fn id(&self) -> &str {
        &self.id
    }

    async fn deliver(
        &self,
        message: &OutboundMessage,
        timeout: Duration,
    ) -> Result<DeliveryResult, DeliveryError> {
        let res = self
            .client
            .post(&self.api_url)
            .header("apikey", self.api_key.as_deref().unwrap_or(""))
            .form(&self.form(message))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout
                } else {
                    DeliveryError::Unreachable(e.to_string())
                }
            })?;
        let status = res.status();
        let body = match res.text().await {
            Ok(b) => b,
            Err(e) if e.is_timeout() => return Err(DeliveryError::Timeout),
            // The provider already answered; resending on a lost body would duplicate the message.
            Err(e) => {
                log::warn!("gupshup: reading {} response body failed: {}", status, e);
                String::new()
            }
        };
        log::debug!("gupshup: send response {} {}", status, body);
        Ok(DeliveryResult {
            success: status.is_success(),
            provider_status: status.as_u16(),
            provider_body: body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn outbound() -> OutboundMessage {
        OutboundMessage {
            conversation_id: "15551234567".to_string(),
            text: "Drink warm fluids & rest.".to_string(),
        }
    }

    fn client(url: String) -> GupshupClient {
        GupshupClient::new(
            Some(url),
            Some("gs-key".to_string()),
            Some("917834811114".to_string()),
            "Connectify",
            "whatsapp",
        )
    }

    #[tokio::test]
    async fn posts_form_with_api_key() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/wa/api/v1/msg")
            .match_header("apikey", "gs-key")
            .match_header("content-type", "application/x-www-form-urlencoded")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("channel".into(), "whatsapp".into()),
                Matcher::UrlEncoded("source".into(), "917834811114".into()),
                Matcher::UrlEncoded("destination".into(), "15551234567".into()),
                Matcher::UrlEncoded("message".into(), "Drink warm fluids & rest.".into()),
                Matcher::UrlEncoded("src.name".into(), "Connectify".into()),
            ]))
            .with_status(202)
            .with_body(r#"{"status":"submitted","messageId":"ee4a68a0"}"#)
            .create_async()
            .await;

        let gs = client(format!("{}/wa/api/v1/msg", server.url()));
        let result = gs.deliver(&outbound(), Duration::from_secs(5)).await.unwrap();
        assert!(result.success);
        assert_eq!(result.provider_status, 202);
        assert!(result.provider_body.contains("submitted"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_2xx_is_reported_not_raised() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/msg")
            .with_status(401)
            .with_body(r#"{"status":"error","message":"Authentication Failed"}"#)
            .create_async()
            .await;

        let gs = client(format!("{}/msg", server.url()));
        let result = gs.deliver(&outbound(), Duration::from_secs(5)).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.provider_status, 401);
        assert!(result.provider_body.contains("Authentication Failed"));
        assert!(!DeliveryError::from(result).is_transient());
    }

    /// Answers one request with `status_line` and a body shorter than its Content-Length.
    fn truncated_body_server(status_line: &'static str) -> String {
        use std::io::{Read, Write};
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = stream.read(&mut chunk).unwrap();
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            if k.eq_ignore_ascii_case("content-length") {
                                v.trim().parse::<usize>().ok()
                            } else {
                                None
                            }
                        })
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!("{}\r\nContent-Length: 100\r\n\r\nshort", status_line);
            stream.write_all(response.as_bytes()).unwrap();
        });
        format!("http://{}/msg", addr)
    }

    #[tokio::test]
    async fn accepted_send_with_unreadable_body_still_counts_as_sent() {
        let gs = client(truncated_body_server("HTTP/1.1 202 Accepted"));
        let result = gs.deliver(&outbound(), Duration::from_secs(5)).await.unwrap();
        assert!(result.success);
        assert_eq!(result.provider_status, 202);
        assert!(result.provider_body.is_empty());
    }

    #[tokio::test]
    async fn rejected_send_with_unreadable_body_keeps_its_status() {
        let gs = client(truncated_body_server("HTTP/1.1 503 Service Unavailable"));
        let result = gs.deliver(&outbound(), Duration::from_secs(5)).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.provider_status, 503);
        assert!(DeliveryError::from(result).is_transient());
    }

    #[tokio::test]
    async fn unreachable_gateway_is_an_error() {
        let gs = client("http://127.0.0.1:9/msg".to_string());
        let err = gs.deliver(&outbound(), Duration::from_secs(2)).await.unwrap_err();
        assert!(err.is_transient());
    }
}
