//! HTTP surface: WebSocket upgrade, relay information, and health checks.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Host, State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dispatch::Dispatcher;
use crate::ws;

#[derive(Serialize, Deserialize)]
struct Health {
    status: String,
}

/// The process-wide router; every route resolves its tenant from the Host
/// header.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .with_state(dispatcher)
}

/// Serve until the shutdown future resolves.
pub async fn serve(
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(dispatcher).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Health check endpoint.
async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}

/// WebSocket upgrade for relay clients; the relay information document for
/// plain HTTP requests.
async fn root(
    upgrade: Option<WebSocketUpgrade>,
    Host(host): Host,
    State(dispatcher): State<Arc<Dispatcher>>,
) -> Response {
    let instance = match dispatcher.get(&host) {
        Ok(instance) => instance,
        Err(e) => {
            debug!(host, error = %e, "dispatch failed");
            return (StatusCode::NOT_FOUND, "no relay configured for this host").into_response();
        }
    };
    match upgrade {
        Some(upgrade) => upgrade.on_upgrade(move |socket| ws::process(socket, instance)),
        None => (
            [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
            Json(instance.relay_info()),
        )
            .into_response(),
    }
}
