//! Relay core library: inbound schema normalization, completion and delivery clients,
//! the relay orchestrator, and the HTTP gateway used by the CLI.

pub mod channels;
pub mod config;
pub mod gateway;
pub mod init;
pub mod llm;
pub mod relay;
