// src/main.rs

//! The main entry point for the trackbridge server.

use anyhow::Result;
use std::env;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*};
use trackbridge::config::Config;
use trackbridge::server;

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("trackbridge version {VERSION}");
        return Ok(());
    }

    // Without --config the built-in defaults are used.
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1));

    let mut config = match config_path {
        Some(path) => match Config::from_file(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load configuration from \"{path}\": {e:#}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    if let Err(e) = config.apply_cli_overrides(&args) {
        eprintln!("{e:#}");
        std::process::exit(2);
    }

    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::registry()
        .with(EnvFilter::new(log_level))
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(true),
        )
        .init();

    if let Err(e) = server::run(config).await {
        error!("Server runtime error: {:#}", e);
        return Err(e);
    }
    Ok(())
}
