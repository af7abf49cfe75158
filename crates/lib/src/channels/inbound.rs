//! Inbound webhook event and the canonical message it normalizes into.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Raw webhook payload as received, before any schema is recognized.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            received_at: Utc::now(),
        }
    }
}

/// A message from a channel, normalized so the rest of the relay never sees provider envelopes.
///
/// `text` is trimmed and never empty.
/// `conversation_id` (sender phone/address) is the unit of ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalMessage {
    /// Provider-assigned id, or `derived-<sha256>` of the raw payload when the envelope
    /// carries none.
    pub message_id: String,
    pub conversation_id: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
}
