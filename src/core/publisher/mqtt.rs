// src/core/publisher/mqtt.rs

//! The MQTT implementation of `MessageBus`, backed by `rumqttc`.

use super::MessageBus;
use crate::config::MqttConfig;
use crate::core::errors::BusError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const DEFAULT_MQTT_PORT: u16 = 1883;
const MIN_RECONNECT_WAIT: Duration = Duration::from_secs(1);
const MAX_RECONNECT_WAIT: Duration = Duration::from_secs(15);

/// Publishes with QoS 0: at most once, no acknowledgment.
#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
}

/// Drives the MQTT connection. Must be polled for publishes to reach the broker.
pub struct MqttEventLoop {
    eventloop: EventLoop,
    broker: String,
}

impl MqttBus {
    /// Builds the client and its event loop. No network I/O happens until the
    /// event loop is run.
    pub fn connect(config: &MqttConfig) -> Result<(Self, MqttEventLoop)> {
        let (host, port) = split_broker(&config.broker)?;
        let mut options = MqttOptions::new(config.client_id.clone(), host, port);
        options.set_keep_alive(config.keep_alive);
        let (client, eventloop) = AsyncClient::new(options, config.request_capacity);
        Ok((
            Self { client },
            MqttEventLoop {
                eventloop,
                broker: config.broker.clone(),
            },
        ))
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .await
            .map_err(|e| BusError::Client(e.to_string()))
    }
}

impl MqttEventLoop {
    /// Polls the connection until shutdown, reconnecting with exponential backoff.
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut wait = MIN_RECONNECT_WAIT;
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("MQTT event loop shutting down.");
                    return;
                }
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("MQTT connected to {:?}", self.broker);
                        wait = MIN_RECONNECT_WAIT;
                    }
                    Ok(other) => debug!("MQTT event: {:?}", other),
                    Err(e) => {
                        warn!(
                            "MQTT disconnected from {:?} (err: {}), reconnecting in {:?}",
                            self.broker, e, wait
                        );
                        tokio::select! {
                            _ = shutdown_rx.recv() => return,
                            _ = tokio::time::sleep(wait) => {}
                        }
                        wait = (wait * 2).min(MAX_RECONNECT_WAIT);
                    }
                }
            }
        }
    }
}

/// Splits `host:port`, defaulting the port when absent.
pub fn split_broker(broker: &str) -> Result<(String, u16)> {
    let broker = broker.trim().trim_start_matches("mqtt://");
    match broker.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port
                .parse()
                .with_context(|| format!("Invalid MQTT broker port in '{broker}'"))?;
            Ok((host.to_string(), port))
        }
        Some(_) => anyhow::bail!("MQTT broker address '{broker}' has no host"),
        None if broker.is_empty() => anyhow::bail!("MQTT broker address is empty"),
        None => Ok((broker.to_string(), DEFAULT_MQTT_PORT)),
    }
}
