// src/server/http_bridge.rs

//! The HTTP side of the bridge: command submission, client listing and
//! Prometheus metrics.

use crate::core::errors::CommandError;
use crate::core::metrics::gather_metrics;
use crate::core::{CommandCorrelator, DeviceHub};
use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{any, get},
};
use serde::Deserialize;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Shared handles for every HTTP handler.
#[derive(Clone)]
pub struct BridgeState {
    pub hub: Arc<DeviceHub>,
    pub correlator: Arc<CommandCorrelator>,
    pub command_timeout: Duration,
}

#[derive(Debug, Deserialize)]
pub struct CommandQuery {
    #[serde(default)]
    imei: String,
}

/// Builds the bridge's routes.
pub fn router(state: BridgeState) -> Router {
    Router::new()
        .route("/cmd", any(command_handler))
        .route("/list-clients", get(list_clients_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Sends the request body to the device and answers with its reply.
async fn command_handler(
    State(state): State<BridgeState>,
    Query(query): Query<CommandQuery>,
    body: String,
) -> impl IntoResponse {
    let imei = query.imei.trim();
    if imei.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing imei parameter\n".to_string());
    }
    let command = body.trim();
    if command.is_empty() {
        return (StatusCode::BAD_REQUEST, "empty command\n".to_string());
    }

    match state
        .correlator
        .send_command_and_wait(imei, command, state.command_timeout)
        .await
    {
        Ok(reply) => (StatusCode::OK, format!("{reply}\n")),
        Err(e @ CommandError::SendFailed(_)) => {
            error!("send packet error ({})", e);
            (StatusCode::BAD_REQUEST, format!("{e}\n"))
        }
        Err(e @ CommandError::DeviceDisconnected) => {
            (StatusCode::SERVICE_UNAVAILABLE, format!("{e}\n"))
        }
        Err(e @ CommandError::ResponseTimeout) => {
            (StatusCode::GATEWAY_TIMEOUT, format!("{e}\n"))
        }
    }
}

async fn list_clients_handler(State(state): State<BridgeState>) -> impl IntoResponse {
    let mut body = String::new();
    for client in state.hub.list_clients() {
        let _ = writeln!(body, "{client}");
    }
    (StatusCode::OK, body)
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        gather_metrics(),
    )
}

/// Serves the bridge on `listener` until shutdown is signalled.
pub async fn run_http_bridge(
    listener: TcpListener,
    state: BridgeState,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!("http server listening at {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("HTTP server shutting down.");
        })
        .await?;
    Ok(())
}
