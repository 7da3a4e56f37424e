// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;

mod connection_loop;
mod context;
mod http_bridge;
mod initialization;
mod spawner;

pub use http_bridge::{BridgeState, router, run_http_bridge};

/// The main server startup function, orchestrating all setup phases.
pub async fn run(config: Config) -> Result<()> {
    // 1. Build the registry, hub, correlator and bus client; bind both listeners.
    let mut server_context = initialization::setup(config).await?;

    // 2. Spawn the HTTP bridge, the publisher pool and the MQTT event loop.
    spawner::spawn_all(&mut server_context)?;

    // 3. Serve devices until a signal arrives or a critical task fails.
    connection_loop::run(server_context).await
}
