//! Gateway HTTP wire types (webhook acknowledgement, health).

use crate::relay::{RelayOutcome, StatsSnapshot, SubmitError};
use serde::{Deserialize, Serialize};

/// Webhook acknowledgement: `{ "status", "messageId"?, "reply"?, "reason"? }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Text that reached the user (the completion, or the fallback on failure).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl WebhookResponse {
    fn new(status: &str) -> Self {
        Self {
            status: status.to_string(),
            message_id: None,
            reply: None,
            reason: None,
        }
    }

    pub fn invalid_json() -> Self {
        Self {
            reason: Some("invalid-json".to_string()),
            ..Self::new("error")
        }
    }

    pub fn retry(e: SubmitError) -> Self {
        Self {
            reason: Some(e.to_string()),
            ..Self::new("retry")
        }
    }
}

impl From<RelayOutcome> for WebhookResponse {
    fn from(outcome: RelayOutcome) -> Self {
        match outcome {
            RelayOutcome::Success { message_id, reply } => Self {
                message_id: Some(message_id),
                reply: Some(reply),
                ..Self::new("success")
            },
            RelayOutcome::Failed {
                message_id,
                failure,
                delivered_reply,
            } => Self {
                message_id: Some(message_id),
                reply: delivered_reply,
                reason: Some(failure.to_string()),
                ..Self::new("failed")
            },
            RelayOutcome::Ignored { message_id, reason } => Self {
                message_id,
                reason: Some(reason.as_str().to_string()),
                ..Self::new("ignored")
            },
        }
    }
}

/// `GET /` body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub runtime: &'static str,
    pub port: u16,
    pub stats: StatsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::CompletionError;
    use crate::relay::{Failure, IgnoreReason};
    use serde_json::json;

    #[test]
    fn ignored_outcome_serializes_reason_only() {
        let resp = WebhookResponse::from(RelayOutcome::Ignored {
            message_id: None,
            reason: IgnoreReason::UnrecognizedSchema,
        });
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({ "status": "ignored", "reason": "unrecognized-schema" })
        );
    }

    #[test]
    fn failed_outcome_carries_fallback_reply() {
        let resp = WebhookResponse::from(RelayOutcome::Failed {
            message_id: "m1".to_string(),
            failure: Failure::Completion(CompletionError::Timeout),
            delivered_reply: Some("Sorry".to_string()),
        });
        assert_eq!(resp.status, "failed");
        assert_eq!(resp.message_id.as_deref(), Some("m1"));
        assert_eq!(resp.reply.as_deref(), Some("Sorry"));
        assert!(resp.reason.is_some());
    }

    #[test]
    fn invalid_json_and_retry_shapes() {
        assert_eq!(
            serde_json::to_value(WebhookResponse::invalid_json()).unwrap(),
            json!({ "status": "error", "reason": "invalid-json" })
        );
        assert_eq!(
            WebhookResponse::retry(SubmitError::ShuttingDown).status,
            "retry"
        );
    }
}
