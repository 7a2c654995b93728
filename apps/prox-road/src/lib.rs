//! prox-road: presence and signaling relay for ProxCity peers.
//!
//! Clients connect over a websocket, JOIN with an identity string, and then
//! exchange SIGNAL frames that the server relays verbatim to a target session
//! or to every session of a target identity. A liveness monitor pings each
//! session and reaps the ones that stop answering.

pub mod cli;
pub mod config;
pub mod handlers;
pub mod liveness;
pub mod registry;
pub mod router;
pub mod telemetry;
pub mod websocket;

use std::future::Future;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::liveness::LivenessConfig;
use crate::registry::IdentityRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: IdentityRegistry,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(metrics: Option<PrometheusHandle>) -> Self {
        Self {
            registry: IdentityRegistry::new(),
            metrics,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(websocket::websocket_handler))
        .route("/ws", get(websocket::websocket_handler))
        .route("/health", get(handlers::health_check))
        .route("/debug/stats", get(handlers::registry_stats))
        .route("/metrics", get(handlers::metrics))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve signaling on `listener` until `shutdown` resolves. The liveness
/// monitor runs for as long as the server does.
pub async fn serve<F>(
    listener: TcpListener,
    state: AppState,
    liveness: LivenessConfig,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let monitor = liveness::spawn_monitor(state.registry.clone(), liveness);
    let app = build_router(state);

    if let Ok(addr) = listener.local_addr() {
        info!("prox-road listening on {}", addr);
    }

    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server shutdown with error");

    monitor.abort();
    result
}
