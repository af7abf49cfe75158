//! Outbound delivery contract: one implementation per messaging gateway.

use async_trait::async_trait;
use std::time::Duration;

/// Reply addressed to a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub conversation_id: String,
    pub text: String,
}

/// What the gateway answered. Non-2xx responses are reported here, not raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    pub success: bool,
    pub provider_status: u16,
    pub provider_body: String,
}

/// 408, 429 and 5xx are worth retrying; other statuses will not change on retry.
pub fn is_transient_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("delivery timed out")]
    Timeout,
    #[error("delivery gateway rejected message: {status} {body}")]
    GatewayRejected { status: u16, body: String },
    #[error("delivery gateway unreachable: {0}")]
    Unreachable(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        match self {
            DeliveryError::Timeout | DeliveryError::Unreachable(_) => true,
            DeliveryError::GatewayRejected { status, .. } => is_transient_status(*status),
        }
    }
}

impl From<DeliveryResult> for DeliveryError {
    fn from(result: DeliveryResult) -> Self {
        DeliveryError::GatewayRejected {
            status: result.provider_status,
            body: result.provider_body,
        }
    }
}

/// Sends replies through one outbound gateway.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    /// Gateway id (e.g. "gupshup"), used in logs and circuit names.
    fn id(&self) -> &str;

    /// Deliver one message.
    /// `Err` only when no HTTP response was obtained (timeout, connection failure).
    async fn deliver(
        &self,
        message: &OutboundMessage,
        timeout: Duration,
    ) -> Result<DeliveryResult, DeliveryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_statuses() {
        for s in [408, 429, 500, 502, 503, 599] {
            assert!(is_transient_status(s), "{s}");
        }
        for s in [200, 400, 401, 403, 404, 422, 600] {
            assert!(!is_transient_status(s), "{s}");
        }
    }

    #[test]
    fn rejected_result_converts_to_error() {
        let result = DeliveryResult {
            success: false,
            provider_status: 503,
            provider_body: "busy".to_string(),
        };
        let err = DeliveryError::from(result);
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "delivery gateway rejected message: 503 busy");
        let rejected = DeliveryError::GatewayRejected {
            status: 401,
            body: String::new(),
        };
        assert!(!rejected.is_transient());
        assert!(DeliveryError::Timeout.is_transient());
    }
}
