//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.relay/config.json`) and environment.
//! Provider credentials may come from the environment; env overrides the file.

use crate::channels::SchemaKind;
use crate::relay::RelaySettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Completion provider (LLM) settings.
    #[serde(default)]
    pub completion: CompletionConfig,

    /// Outbound messaging gateway settings.
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Orchestrator policy: workers, retries, circuit breaking, dedup.
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Gateway bind, port and webhook route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP (default 15151).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Route the inbound webhook is served on (default "/webhook").
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,
}

fn default_gateway_port() -> u16 {
    15151
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_webhook_path() -> String {
    "/webhook".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            webhook_path: default_webhook_path(),
        }
    }
}

/// Which completion backend to talk to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionBackend {
    /// OpenAI-compatible `/chat/completions` (OpenAI, Groq, LM Studio, ...).
    #[default]
    Openai,

    /// Native Ollama `/api/chat`.
    Ollama,
}

/// Completion provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionConfig {
    #[serde(default)]
    pub backend: CompletionBackend,
    /// Provider base URL. Overridden by GROQ_BASE_URL env.
    pub base_url: Option<String>,
    /// Model id passed as-is to the provider. Overridden by GROQ_MODEL env.
    pub model: Option<String>,
    /// Bearer token. Overridden by GROQ_API_KEY env.
    pub api_key: Option<String>,
    /// Fixed system prompt sent ahead of every user turn. An empty string sends none.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: Option<String>,
    /// Hard per-request timeout in seconds (default 10).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

/// System prompt used unless the config sets its own.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a compassionate and knowledgeable virtual doctor \
assistant. Greet the user politely. Offer helpful health guidance, suggest home remedies for \
mild issues, and always remind the user to consult a real doctor for serious concerns. Respond \
clearly and concisely, like a helpful doctor friend.";

fn default_system_prompt() -> Option<String> {
    Some(DEFAULT_SYSTEM_PROMPT.to_string())
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            backend: CompletionBackend::default(),
            base_url: None,
            model: None,
            api_key: None,
            system_prompt: default_system_prompt(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Outbound gateway (Gupshup WhatsApp API) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryConfig {
    /// Send-message endpoint.
    #[serde(default = "default_delivery_api_url")]
    pub api_url: String,
    /// API key sent in the `apikey` header. Overridden by GUPSHUP_API_KEY env.
    pub api_key: Option<String>,
    /// Sender number registered with the gateway. Overridden by GUPSHUP_SENDER env.
    pub source: Option<String>,
    /// App name (`src.name` form field).
    #[serde(default = "default_src_name")]
    pub src_name: String,
    /// Channel identifier (`channel` form field).
    #[serde(default = "default_delivery_channel")]
    pub channel: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_delivery_api_url() -> String {
    "https://api.gupshup.io/wa/api/v1/msg".to_string()
}

fn default_src_name() -> String {
    "Connectify".to_string()
}

fn default_delivery_channel() -> String {
    "whatsapp".to_string()
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            api_url: default_delivery_api_url(),
            api_key: None,
            source: None,
            src_name: default_src_name(),
            channel: default_delivery_channel(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Orchestrator policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Maximum number of messages processed concurrently (across conversations).
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Retries after the first attempt for transient completion/delivery failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Consecutive transient failures that open a provider's circuit.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_cooldown_secs")]
    pub circuit_cooldown_secs: u64,
    /// How long a processed message id is remembered.
    #[serde(default = "default_dedup_retention_secs")]
    pub dedup_retention_secs: u64,
    /// Upper bound on remembered message ids; oldest are evicted first.
    #[serde(default = "default_dedup_max_entries")]
    pub dedup_max_entries: usize,
    /// Reply delivered when the completion provider cannot answer.
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,
    /// Enabled inbound schemas, in priority order.
    #[serde(default = "default_schemas")]
    pub schemas: Vec<SchemaKind>,
}

fn default_workers() -> usize {
    8
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    8_000
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_cooldown_secs() -> u64 {
    30
}

fn default_dedup_retention_secs() -> u64 {
    3_600
}

fn default_dedup_max_entries() -> usize {
    10_000
}

fn default_fallback_reply() -> String {
    "Sorry, I'm currently unavailable. Please try again later.".to_string()
}

fn default_schemas() -> Vec<SchemaKind> {
    SchemaKind::ALL.to_vec()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_cooldown_secs: default_circuit_cooldown_secs(),
            dedup_retention_secs: default_dedup_retention_secs(),
            dedup_max_entries: default_dedup_max_entries(),
            fallback_reply: default_fallback_reply(),
            schemas: default_schemas(),
        }
    }
}

impl RelayConfig {
    /// Orchestrator settings with durations resolved and lower bounds applied.
    pub fn settings(
        &self,
        completion_timeout_secs: u64,
        delivery_timeout_secs: u64,
    ) -> RelaySettings {
        RelaySettings {
            workers: self.workers.max(1),
            max_retries: self.max_retries,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)),
            circuit_failure_threshold: self.circuit_failure_threshold.max(1),
            circuit_cooldown: Duration::from_secs(self.circuit_cooldown_secs),
            dedup_retention: Duration::from_secs(self.dedup_retention_secs),
            dedup_max_entries: self.dedup_max_entries.max(1),
            completion_timeout: Duration::from_secs(completion_timeout_secs.max(1)),
            delivery_timeout: Duration::from_secs(delivery_timeout_secs.max(1)),
            fallback_reply: self.fallback_reply.clone(),
        }
    }
}

impl Config {
    /// Orchestrator settings derived from the relay, completion and delivery sections.
    pub fn relay_settings(&self) -> RelaySettings {
        self.relay
            .settings(self.completion.timeout_secs, self.delivery.timeout_secs)
    }
}

/// Non-empty, trimmed value of an environment variable.
fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn config_value(value: Option<&String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Resolve the completion API key: env GROQ_API_KEY overrides config.
pub fn resolve_completion_api_key(config: &Config) -> Option<String> {
    env_value("GROQ_API_KEY").or_else(|| config_value(config.completion.api_key.as_ref()))
}

/// Resolve the completion base URL: env GROQ_BASE_URL overrides config.
pub fn resolve_completion_base_url(config: &Config) -> Option<String> {
    env_value("GROQ_BASE_URL").or_else(|| config_value(config.completion.base_url.as_ref()))
}

/// Resolve the completion model: env GROQ_MODEL overrides config.
pub fn resolve_completion_model(config: &Config) -> Option<String> {
    env_value("GROQ_MODEL").or_else(|| config_value(config.completion.model.as_ref()))
}

/// Resolve the delivery API key: env GUPSHUP_API_KEY overrides config.
pub fn resolve_delivery_api_key(config: &Config) -> Option<String> {
    env_value("GUPSHUP_API_KEY").or_else(|| config_value(config.delivery.api_key.as_ref()))
}

/// Resolve the delivery sender: env GUPSHUP_SENDER overrides config.
pub fn resolve_delivery_source(config: &Config) -> Option<String> {
    env_value("GUPSHUP_SENDER").or_else(|| config_value(config.delivery.source.as_ref()))
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("RELAY_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".relay").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path (or default path). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        parse_config(&s).with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

/// Parse config JSON text.
pub fn parse_config(s: &str) -> Result<Config> {
    let config: Config = serde_json::from_str(s)?;
    if config.relay.schemas.is_empty() {
        anyhow::bail!("relay.schemas must list at least one inbound schema");
    }
    Ok(config)
}
