// src/server/spawner.rs

//! Spawns all of the bridge's long-running background tasks.

use super::context::{ServerContext, ServerInit};
use super::http_bridge::{self, BridgeState};
use anyhow::{Result, anyhow};
use tracing::info;

/// Spawns the HTTP bridge, the publisher pool and the MQTT event loop into the
/// context's JoinSet.
pub fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let ServerInit {
        publisher,
        mqtt_eventloop,
        http_listener,
    } = ctx
        .init
        .take()
        .ok_or_else(|| anyhow!("background tasks have already been spawned"))?;
    let bridge_state = BridgeState {
        hub: ctx.hub.clone(),
        correlator: ctx.correlator.clone(),
        command_timeout: ctx.config.http.command_timeout,
    };
    let shutdown_tx = &ctx.shutdown_tx;
    let background_tasks = &mut ctx.background_tasks;

    // --- MQTT Connection ---
    let shutdown_rx_mqtt = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        mqtt_eventloop.run(shutdown_rx_mqtt).await;
        Ok(())
    });

    // --- Telemetry Publisher Pool ---
    let shutdown_rx_publisher = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        publisher.run(shutdown_rx_publisher).await;
        Ok(())
    });

    // --- HTTP Command Bridge ---
    let shutdown_rx_http = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        http_bridge::run_http_bridge(http_listener, bridge_state, shutdown_rx_http).await
    });

    info!("All background tasks have been spawned.");
    Ok(())
}
