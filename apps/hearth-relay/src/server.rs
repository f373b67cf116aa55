use std::future::Future;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use crate::broadcast::FanoutReport;
use crate::config::RelayConfig;
use crate::registry::CloseReason;
use crate::state::AppState;
use crate::store::InMemoryStore;
use crate::sync::SyncNotice;
use crate::websocket::ws_handler;

/// Every route on one listener.
pub fn build_router(state: AppState) -> Router {
    public_router(state.clone()).merge(internal_router(state))
}

/// Device-facing routes.
pub fn public_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Routes for the sync service. `/sync/notify` pushes frames to any user's
/// devices unauthenticated, so deployments should bind it to a private address.
pub fn internal_router(state: AppState) -> Router {
    Router::new()
        .route("/sync/notify", post(sync_notify_handler))
        .with_state(state)
}

/// Serves every route on `listener` until `shutdown` resolves, running the heartbeat alongside.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = build_router(state.clone());
    serve_router(listener, state, router, shutdown).await
}

async fn serve_router<F>(listener: TcpListener, state: AppState, router: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let heartbeat = state.heartbeat().spawn();

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error");

    heartbeat.abort();
    for connection in state.registry().live_connections() {
        state
            .registry()
            .close(connection.id(), CloseReason::ServerShutdown);
    }
    result
}

pub async fn run(config: RelayConfig, state: AppState) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("hearth-relay listening on {}", config.listen_addr);

    let (stop_tx, stop_rx) = watch::channel(false);
    let internal = match config.internal_addr {
        Some(addr) => {
            let internal_listener = TcpListener::bind(addr)
                .await
                .context("failed to bind internal listener")?;
            info!("internal routes listening on {addr}");
            let router = internal_router(state.clone());
            Some(tokio::spawn(async move {
                axum::serve(internal_listener, router)
                    .with_graceful_shutdown(stopped(stop_rx))
                    .await
            }))
        }
        None => None,
    };
    let router = match internal {
        Some(_) => public_router(state.clone()),
        None => build_router(state.clone()),
    };

    serve_router(listener, state, router, async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    })
    .await?;
    if let Some(task) = internal {
        task.await
            .context("internal listener task failed")?
            .context("internal listener shutdown with error")?;
    }

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.changed().await;
}

/// State for the binary: in-memory store plus collaborators from `config`.
pub fn default_state(config: &RelayConfig) -> AppState {
    AppState::from_config(config, InMemoryStore::new())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry().snapshot())
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics() {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn sync_notify_handler(
    State(state): State<AppState>,
    Json(notice): Json<SyncNotice>,
) -> Json<FanoutReport> {
    info!(
        target_user = %notice.target_user,
        operation = %notice.operation,
        "sync notice received"
    );
    Json(state.broadcaster().deliver_notice(notice))
}
