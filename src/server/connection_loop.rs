// src/server/connection_loop.rs

//! Contains the main server loop: serves devices and handles graceful shutdown.

use super::context::ServerContext;
use anyhow::{Context, Result, anyhow};
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

/// Serves devices until a signal arrives or a critical task fails, then shuts
/// everything down.
pub async fn run(ctx: ServerContext) -> Result<()> {
    let ServerContext {
        hub,
        device_listener,
        shutdown_tx,
        mut background_tasks,
        ..
    } = ctx;

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;

    let serve = hub.serve(device_listener, shutdown_tx.clone());
    tokio::pin!(serve);
    let mut hub_finished = false;

    let outcome = loop {
        tokio::select! {
            biased;

            _ = sigint.recv() => {
                info!("SIGINT received, initiating graceful shutdown.");
                break Ok(());
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, initiating graceful shutdown.");
                break Ok(());
            }

            Some(res) = background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => warn!("A background task finished unexpectedly without an error."),
                    Ok(Err(e)) => {
                        error!("CRITICAL: Background task failed: {}. Shutting down.", e);
                        break Err(e);
                    }
                    Err(e) => {
                        error!("CRITICAL: Background task panicked: {e:?}. Shutting down.");
                        break Err(anyhow!("background task panicked: {e}"));
                    }
                }
            }

            res = &mut serve => {
                hub_finished = true;
                match res {
                    Ok(()) => break Ok(()),
                    Err(e) => {
                        error!("CRITICAL: Device listener failed: {}. Shutting down.", e);
                        break Err(e.into());
                    }
                }
            }
        }
    };

    info!("Shutting down. Sending signal to all tasks.");
    if shutdown_tx.send(()).is_err() {
        warn!("No task was listening for the shutdown signal.");
    }

    if !hub_finished && let Err(e) = serve.await {
        error!("Device listener finished with error: {}", e);
    }

    info!("Waiting for background tasks to finish...");
    if tokio::time::timeout(Duration::from_secs(10), async {
        while background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for background tasks to finish cleanly.");
        background_tasks.shutdown().await;
    }
    info!("Server shutdown complete.");
    outcome
}
