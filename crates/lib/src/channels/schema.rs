//! Inbound schema recognition: one of several known webhook envelopes -> `CanonicalMessage`.
//!
//! Recognizers are tried in a fixed priority order; the first one whose structure matches
//! wins, even if its text turns out to be empty. Unknown shapes and text-less messages are
//! typed outcomes, not failures.

use crate::channels::inbound::{CanonicalMessage, InboundEvent};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Known inbound envelope shapes, in default priority order (most specific first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SchemaKind {
    /// Cloud API `entry[].changes[].value.messages[]` envelope.
    MetaCloud,
    /// Gateway `payload.payload.text` / `payload.sender.phone` envelope.
    Gupshup,
    /// Flat `{ message, sender }` envelope.
    Flat,
}

impl SchemaKind {
    pub const ALL: [SchemaKind; 3] = [SchemaKind::MetaCloud, SchemaKind::Gupshup, SchemaKind::Flat];

    pub fn as_str(self) -> &'static str {
        match self {
            SchemaKind::MetaCloud => "metaCloud",
            SchemaKind::Gupshup => "gupshup",
            SchemaKind::Flat => "flat",
        }
    }

    /// Structural match only: the sender must be present, the text may still be missing.
    fn recognize(self, raw: &Value) -> Option<Envelope<'_>> {
        match self {
            SchemaKind::MetaCloud => {
                let message = raw.pointer("/entry/0/changes/0/value/messages/0")?;
                let from = message.get("from").and_then(as_address)?;
                Some(Envelope::MetaCloud { message, from })
            }
            SchemaKind::Gupshup => {
                let outer = raw.get("payload")?;
                if !outer.get("payload").is_some_and(Value::is_object) {
                    return None;
                }
                let phone = outer.pointer("/sender/phone").and_then(as_address)?;
                Some(Envelope::Gupshup { root: raw, outer, phone })
            }
            SchemaKind::Flat => {
                let message = raw.get("message")?;
                if !(message.is_string() || message.is_object()) {
                    return None;
                }
                let sender = raw.get("sender").and_then(|s| match s {
                    Value::Object(_) => s
                        .get("phone")
                        .and_then(as_address)
                        .or_else(|| s.get("id").and_then(as_address)),
                    other => as_address(other),
                })?;
                Some(Envelope::Flat { root: raw, message, sender })
            }
        }
    }
}

impl std::fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an inbound event produced no canonical message.
/// The relay acknowledges these and never retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NormalizationError {
    #[error("unrecognized-schema")]
    UnrecognizedSchema,
    #[error("empty-text")]
    EmptyText,
}

impl NormalizationError {
    pub fn reason(self) -> &'static str {
        match self {
            NormalizationError::UnrecognizedSchema => "unrecognized-schema",
            NormalizationError::EmptyText => "empty-text",
        }
    }
}

/// A structurally recognized envelope, borrowing from the raw payload.
enum Envelope<'a> {
    MetaCloud {
        message: &'a Value,
        from: String,
    },
    Gupshup {
        root: &'a Value,
        outer: &'a Value,
        phone: String,
    },
    Flat {
        root: &'a Value,
        message: &'a Value,
        sender: String,
    },
}

impl Envelope<'_> {
    fn into_parts(self) -> EnvelopeParts {
        match self {
            Envelope::MetaCloud { message, from } => EnvelopeParts {
                sender: from,
                text: message.pointer("/text/body").and_then(Value::as_str).map(str::to_string),
                id: message.get("id").and_then(as_address),
                timestamp: message.get("timestamp").and_then(|t| unix_time(t, 1)),
            },
            Envelope::Gupshup { root, outer, phone } => EnvelopeParts {
                sender: phone,
                text: outer.pointer("/payload/text").and_then(Value::as_str).map(str::to_string),
                id: outer.get("id").and_then(as_address),
                timestamp: root.get("timestamp").and_then(|t| unix_time(t, 1_000)),
            },
            Envelope::Flat { root, message, sender } => EnvelopeParts {
                sender,
                text: match message {
                    Value::String(s) => Some(s.clone()),
                    other => other.get("text").and_then(Value::as_str).map(str::to_string),
                },
                id: root
                    .get("id")
                    .or_else(|| root.get("messageId"))
                    .and_then(as_address),
                timestamp: root.get("timestamp").and_then(|t| unix_time(t, 1)),
            },
        }
    }
}

struct EnvelopeParts {
    sender: String,
    text: Option<String>,
    id: Option<String>,
    timestamp: Option<DateTime<Utc>>,
}

/// String or integer field as a non-empty string (phone numbers arrive both ways).
fn as_address(v: &Value) -> Option<String> {
    let s = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) if n.is_u64() || n.is_i64() => n.to_string(),
        _ => return None,
    };
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Unix timestamp (string or number) in units of `1/per_second` seconds.
fn unix_time(v: &Value, per_second: i64) -> Option<DateTime<Utc>> {
    let raw = match v {
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        Value::Number(n) => n.as_i64()?,
        _ => return None,
    };
    let millis = raw.checked_mul(1_000 / per_second)?;
    Utc.timestamp_millis_opt(millis).single()
}

/// Stable id for envelopes without one: identical redeliveries hash to the same id.
fn derived_message_id(raw: &Value) -> String {
    let digest = Sha256::digest(raw.to_string().as_bytes());
    let hex: String = digest.iter().take(16).map(|b| format!("{:02x}", b)).collect();
    format!("derived-{}", hex)
}

/// Ordered set of recognizers.
#[derive(Debug, Clone)]
pub struct SchemaMatcher {
    order: Vec<SchemaKind>,
}

impl Default for SchemaMatcher {
    fn default() -> Self {
        Self::new(SchemaKind::ALL.to_vec())
    }
}

impl SchemaMatcher {
    /// Recognizers are tried in the given order; duplicates are dropped.
    pub fn new(order: Vec<SchemaKind>) -> Self {
        let mut deduped = Vec::with_capacity(order.len());
        for kind in order {
            if !deduped.contains(&kind) {
                deduped.push(kind);
            }
        }
        Self { order: deduped }
    }

    pub fn order(&self) -> &[SchemaKind] {
        &self.order
    }

    /// Which recognizer claims this payload, if any.
    pub fn recognize(&self, raw: &Value) -> Option<SchemaKind> {
        self.order
            .iter()
            .copied()
            .find(|kind| kind.recognize(raw).is_some())
    }

    /// Normalize an inbound event into a canonical message.
    pub fn normalize(&self, event: &InboundEvent) -> Result<CanonicalMessage, NormalizationError> {
        let raw = &event.payload;
        let (kind, envelope) = self
            .order
            .iter()
            .find_map(|kind| kind.recognize(raw).map(|e| (*kind, e)))
            .ok_or(NormalizationError::UnrecognizedSchema)?;
        let parts = envelope.into_parts();
        let text = parts
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(NormalizationError::EmptyText)?;
        log::debug!("schema: matched {} for {}", kind, parts.sender);
        Ok(CanonicalMessage {
            message_id: parts.id.unwrap_or_else(|| derived_message_id(raw)),
            conversation_id: parts.sender,
            text: text.to_string(),
            received_at: parts.timestamp.unwrap_or(event.received_at),
        })
    }
}
