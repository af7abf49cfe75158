//! Communication channels: inbound webhook schemas and outbound delivery gateways.
//!
//! Inbound payloads are normalized by the schema matcher into canonical messages;
//! replies leave through a `DeliveryClient` (e.g. Gupshup).

mod delivery;
mod gupshup;
mod inbound;
mod schema;

pub use delivery::{
    is_transient_status, DeliveryClient, DeliveryError, DeliveryResult, OutboundMessage,
};
pub use gupshup::GupshupClient;
pub use inbound::{CanonicalMessage, InboundEvent};
pub use schema::{NormalizationError, SchemaKind, SchemaMatcher};
