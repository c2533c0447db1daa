//! Chat Gateway
//!
//! Single-binary service exposing an OpenAI-compatible chat-completion API
//! over an upstream chat backend:
//! 1. Loads credential tokens from a flat file into a rotating pool
//! 2. Runs each request through a per-credential session, retrying on
//!    auth/rate-limit/upstream failures with the next credential
//! 3. Transcodes upstream event streams into `chat.completion.chunk` SSE
//! 4. Optionally forwards everything else to the upstream host

mod admin;
mod chat;
mod config;
mod error;
mod metrics;
mod proxy;
mod retry;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use chat_session::{Backend, HttpBackend};
use common::Secret;
use metrics_exporter_prometheus::PrometheusHandle;
use token_pool::{Pool, TokenValidator, spawn_refresh_task};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::metrics::ServiceCounters;
use crate::proxy::GatewayState;
use crate::retry::{Orchestrator, RetryPolicy};

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<Pool>,
    pub orchestrator: Arc<Orchestrator>,
    pub authorization: Arc<Vec<Secret<String>>>,
    pub gateway: GatewayState,
    /// Route prefix for chat and token routes, `""` or `/segment`
    pub api_prefix: String,
    pub counters: ServiceCounters,
    pub prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
fn build_router(state: AppState, max_connections: usize) -> Router {
    let prefix = state.api_prefix.clone();
    Router::new()
        .route(
            &format!("{prefix}/v1/chat/completions"),
            post(chat::chat_completions),
        )
        .route(&format!("{prefix}/tokens"), get(admin::tokens_page))
        .route(&format!("{prefix}/tokens/upload"), post(admin::upload_tokens))
        .route(&format!("{prefix}/tokens/clear"), post(admin::clear_tokens))
        .route(&format!("{prefix}/tokens/error"), post(admin::error_tokens))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/", get(proxy::landing_page))
        .route("/backend-api/gizmos/bootstrap", get(proxy::gizmos_bootstrap))
        .route("/backend-api/me", get(proxy::backend_me))
        .fallback(proxy::passthrough_handler)
        .layer(CorsLayer::permissive())
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filter from LOG_LEVEL then RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting chat-gateway");

    // Install before anything emits metrics (the pool publishes gauges on open)
    let prometheus_handle = metrics::install_recorder()?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let api_prefix = config.server.route_prefix();

    info!(
        listen_addr = %config.server.listen_addr,
        base_url = %config.upstream.base_url,
        api_prefix = %api_prefix,
        caller_keys = config.auth.authorization.len(),
        gateway = config.gateway.enabled,
        scheduled_refresh = config.pool.scheduled_refresh,
        "configuration loaded"
    );

    let pool = Arc::new(
        Pool::open(
            config.pool.token_file.clone(),
            Duration::from_secs(config.pool.revalidate_after_secs),
        )
        .await
        .with_context(|| {
            format!(
                "failed to open token file {}",
                config.pool.token_file.display()
            )
        })?,
    );

    let backend = Arc::new(
        HttpBackend::new(
            config.upstream.base_url.clone(),
            &config.upstream.user_agent,
            config.upstream.timeout(),
        )
        .context("failed to build upstream client")?,
    );

    let refresh_task = config.pool.scheduled_refresh.then(|| {
        let validator: Arc<dyn TokenValidator> = backend.clone();
        spawn_refresh_task(
            pool.clone(),
            validator,
            Duration::from_secs(config.pool.refresh_interval_secs),
        )
    });

    let orchestrator = Orchestrator::new(
        backend as Arc<dyn Backend>,
        RetryPolicy {
            max_attempts: config.pool.max_retries,
            backoff: Duration::from_millis(config.pool.retry_backoff_ms),
            stream_idle_timeout: config.upstream.stream_idle_timeout(),
        },
    );

    let gateway = GatewayState {
        client: reqwest::Client::builder()
            .build()
            .context("failed to build passthrough client")?,
        base_url: config.upstream.base_url.clone(),
        timeout: config.upstream.timeout(),
        config: config.gateway.clone(),
    };

    let counters = ServiceCounters::new();
    let app_state = AppState {
        pool,
        orchestrator: Arc::new(orchestrator),
        authorization: Arc::new(config.auth.authorization),
        gateway,
        api_prefix,
        counters: counters.clone(),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the signal fires, not when the server starts
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    if let Some(task) = refresh_task {
        task.abort();
    }
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            let remaining = counters.in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Pool health: 200 while any token is usable, 503 when none are.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.pool.snapshot().await;
    let status = snapshot.status();
    let status_code = if status == "unhealthy" {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    } else {
        axum::http::StatusCode::OK
    };

    let body = serde_json::json!({
        "status": status,
        "pool": {
            "tokens_total": snapshot.tokens_total,
            "tokens_active": snapshot.tokens_active,
            "tokens_quarantined": snapshot.quarantined.len(),
        },
        "uptime_seconds": state.counters.started_at.elapsed().as_secs(),
        "requests_served": state.counters.requests_total.load(Ordering::Relaxed),
        "errors_total": state.counters.errors_total.load(Ordering::Relaxed),
        "in_flight": state.counters.in_flight.load(Ordering::Relaxed),
    });

    (status_code, axum::Json(body))
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
