// src/server/initialization.rs

//! Builds every bridge component from the configuration and binds both listeners.

use super::context::{ServerContext, ServerInit};
use crate::config::Config;
use crate::core::publisher::{MqttBus, PublisherPool, telemetry_channel};
use crate::core::{
    CommandCorrelator, DeviceHub, DeviceRegistry, HubSettings, TelemetryDispatcher,
};
use anyhow::{Context, Result, anyhow};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_rustls::{TlsAcceptor, rustls};
use tracing::info;

/// Initializes all bridge components before starting the main loop.
pub async fn setup(config: Config) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let acceptor = setup_tls(&config)?;

    let registry = Arc::new(DeviceRegistry::new());
    let correlator = Arc::new(CommandCorrelator::new(registry.clone()));

    let (bus, mqtt_eventloop) = MqttBus::connect(&config.mqtt)?;
    let (telemetry_tx, telemetry_rx) = telemetry_channel(config.publisher.queue_capacity);
    let publisher = PublisherPool::new(
        Arc::new(bus),
        config.mqtt.topic.clone(),
        config.publisher.workers,
        telemetry_rx,
    );
    let dispatcher = Arc::new(TelemetryDispatcher::new(correlator.clone(), telemetry_tx));

    let settings = HubSettings {
        idle_timeout: config.device.idle_timeout,
        handshake_timeout: config.device.handshake_timeout,
        max_frame_size: config.device.max_frame_size,
    };
    let mut hub = DeviceHub::new(registry, settings)
        .with_observer(dispatcher)
        .with_observer(correlator.clone());
    if let Some(acceptor) = acceptor {
        hub = hub.with_tls(acceptor);
    }
    info!("Device hub initialized.");

    let device_listener = TcpListener::bind(config.device.address.as_str())
        .await
        .with_context(|| format!("tcp listener create error ({})", config.device.address))?;
    let http_listener = TcpListener::bind(config.http.address.as_str())
        .await
        .with_context(|| format!("http listen error ({})", config.http.address))?;

    Ok(ServerContext {
        config,
        hub: Arc::new(hub),
        correlator,
        device_listener,
        shutdown_tx,
        background_tasks: JoinSet::new(),
        init: Some(ServerInit {
            publisher,
            mqtt_eventloop,
            http_listener,
        }),
    })
}

/// Sets up the TLS acceptor if TLS is enabled in the configuration.
fn setup_tls(config: &Config) -> Result<Option<TlsAcceptor>> {
    if config.tls.enabled {
        info!("TLS is enabled on the device listener. Loading certificate and key.");
        let certs = load_certs(&config.tls.cert_path)?;
        let key = load_key(&config.tls.key_path)?;
        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
    } else {
        Ok(None)
    }
}

/// Loads TLS certificates from a PEM file.
fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let cert_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open certificate file '{}': {}", path, e))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(anyhow!("No certificates found in '{}'", path));
    }
    Ok(certs)
}

/// Loads a private key from a PEM file.
fn load_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let key_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open private key file '{}': {}", path, e))?;
    let mut key_reader = BufReader::new(key_file);
    rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| anyhow!("No private key found in key file '{}'", path))
}

/// Logs key configuration parameters at startup.
fn log_startup_info(config: &Config) {
    info!(
        "Device idle timeout {:?}, command timeout {:?}.",
        config.device.idle_timeout, config.http.command_timeout
    );
    info!(
        "Publishing telemetry to MQTT broker {} on topic '{}' as '{}'.",
        config.mqtt.broker, config.mqtt.topic, config.mqtt.client_id
    );
}
