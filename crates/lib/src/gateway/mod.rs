//! Gateway: HTTP front door for inbound webhooks.
//!
//! `POST {webhookPath}` accepts provider JSON and answers once the relay reaches a terminal
//! state for it; `GET /` is the health check.

mod protocol;
mod server;

pub use protocol::{HealthResponse, WebhookResponse};
pub use server::{router, run_gateway, serve, GatewayState};
