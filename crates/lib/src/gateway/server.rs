//! Gateway HTTP server: health check and inbound webhook.

use crate::channels::InboundEvent;
use crate::config::{self, Config};
use crate::gateway::protocol::{HealthResponse, WebhookResponse};
use crate::relay::RelayOrchestrator;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::future::Future;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub orchestrator: RelayOrchestrator,
    /// Port actually bound (reported by the health check).
    pub port: u16,
}

/// Routes: `GET /` health, `POST {webhook_path}` inbound events.
pub fn router(state: GatewayState, webhook_path: &str) -> Router {
    let path = if webhook_path.starts_with('/') {
        webhook_path.to_string()
    } else {
        format!("/{}", webhook_path)
    };
    Router::new()
        .route("/", get(health_http))
        .route(&path, post(webhook))
        .with_state(state)
}

/// Run the gateway from config until SIGINT/SIGTERM.
pub async fn run_gateway(config: Config) -> Result<()> {
    if config::resolve_completion_api_key(&config).is_none()
        && config.completion.backend == config::CompletionBackend::Openai
    {
        log::warn!("no completion API key configured (set completion.apiKey or GROQ_API_KEY)");
    }
    if config::resolve_delivery_api_key(&config).is_none() {
        log::warn!("no delivery API key configured (set delivery.apiKey or GUPSHUP_API_KEY)");
    }
    if config::resolve_delivery_source(&config).is_none() {
        log::warn!("no delivery source number configured (set delivery.source or GUPSHUP_SENDER)");
    }

    let orchestrator = RelayOrchestrator::from_config(&config);
    let bind_addr = format!("{}:{}", config.gateway.bind.trim(), config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!(
        "gateway listening on {} (webhook {})",
        bind_addr,
        config.gateway.webhook_path
    );
    serve(listener, orchestrator, &config.gateway.webhook_path, shutdown_signal()).await
}

/// Serve on `listener` until `shutdown` resolves. Then the relay stops accepting, open
/// requests drain, and the relay's conversation workers are awaited.
pub async fn serve<F>(
    listener: tokio::net::TcpListener,
    orchestrator: RelayOrchestrator,
    webhook_path: &str,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let port = listener
        .local_addr()
        .context("reading listener address")?
        .port();
    let state = GatewayState {
        orchestrator: orchestrator.clone(),
        port,
    };
    let app = router(state, webhook_path);

    let closer = orchestrator.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            log::info!("shutdown requested, draining relay and connections");
            closer.close();
        })
        .await
        .context("gateway server exited")?;
    orchestrator.shutdown().await;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received");
}

/// POST webhook: parse JSON, hand to the relay, answer with the terminal state.
async fn webhook(
    State(state): State<GatewayState>,
    body: Bytes,
) -> (StatusCode, Json<WebhookResponse>) {
    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            log::info!("webhook: rejecting non-JSON body: {}", e);
            return (StatusCode::BAD_REQUEST, Json(WebhookResponse::invalid_json()));
        }
    };
    match state.orchestrator.handle(InboundEvent::new(payload)).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome.into())),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, Json(WebhookResponse::retry(e))),
    }
}

/// GET / returns health JSON with relay counters (for health checks).
async fn health_http(State(state): State<GatewayState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        runtime: "running",
        port: state.port,
        stats: state.orchestrator.stats(),
    })
}
