// src/core/publisher/mod.rs

//! Forwards decoded telemetry to the message bus.
//!
//! The dispatcher enqueues events with `try_send`, so a slow or unreachable bus
//! never stalls a device's read loop; a fixed pool of workers drains the queue
//! and makes exactly one publish attempt per event.

pub mod mqtt;

use crate::core::errors::BusError;
use crate::core::metrics;
use crate::core::protocol::Packet;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub use mqtt::{MqttBus, MqttEventLoop};

/// A publish-only message bus client.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Makes a single delivery attempt. Retrying, if any, is the client's concern.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError>;
}

/// The envelope published for every packet that carries telemetry records.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    pub imei: String,
    pub packet: Arc<Packet>,
    pub time: DateTime<Utc>,
}

impl TelemetryEvent {
    pub fn new(imei: impl Into<String>, packet: Arc<Packet>) -> Self {
        Self {
            imei: imei.into(),
            packet,
            time: Utc::now(),
        }
    }

    /// The JSON body published to the bus.
    pub fn to_payload(&self) -> Result<Bytes, BusError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// The producer side of the publish queue.
#[derive(Debug, Clone)]
pub struct TelemetrySender {
    tx: mpsc::Sender<TelemetryEvent>,
}

impl TelemetrySender {
    /// Queues `event` without waiting. Returns false if it had to be dropped.
    pub fn try_enqueue(&self, event: TelemetryEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                metrics::TELEMETRY_DROPPED_TOTAL.inc();
                warn!("[{}]: telemetry queue full, dropping event", event.imei);
                false
            }
            Err(TrySendError::Closed(event)) => {
                metrics::TELEMETRY_DROPPED_TOTAL.inc();
                debug!("[{}]: publisher stopped, dropping event", event.imei);
                false
            }
        }
    }
}

/// Creates the bounded queue between the dispatcher and the publisher pool.
pub fn telemetry_channel(capacity: usize) -> (TelemetrySender, mpsc::Receiver<TelemetryEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (TelemetrySender { tx }, rx)
}

/// A fixed pool of tasks publishing queued telemetry events.
pub struct PublisherPool {
    bus: Arc<dyn MessageBus>,
    topic: String,
    workers: usize,
    rx: mpsc::Receiver<TelemetryEvent>,
}

impl PublisherPool {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        topic: impl Into<String>,
        workers: usize,
        rx: mpsc::Receiver<TelemetryEvent>,
    ) -> Self {
        Self {
            bus,
            topic: topic.into(),
            workers: workers.max(1),
            rx,
        }
    }

    /// Runs the workers until shutdown, then publishes whatever is still queued.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Telemetry publisher started with {} workers on topic '{}'.",
            self.workers, self.topic
        );
        let rx = Arc::new(Mutex::new(self.rx));
        // Workers subscribe here, before any stop is sent, so none can miss it.
        let (stop_tx, _) = broadcast::channel(1);
        let mut workers = JoinSet::new();
        for worker_id in 0..self.workers {
            let rx = rx.clone();
            let bus = self.bus.clone();
            let topic = self.topic.clone();
            let stop_rx = stop_tx.subscribe();
            workers.spawn(async move {
                run_worker(worker_id, rx, bus, topic, stop_rx).await;
            });
        }

        tokio::select! {
            _ = shutdown_rx.recv() => {
                let _ = stop_tx.send(());
            }
            // Every sender is gone and the queue is empty.
            _ = async { while workers.join_next().await.is_some() {} } => {}
        }
        while workers.join_next().await.is_some() {}

        let mut rx = rx.lock().await;
        rx.close();
        let mut drained = 0usize;
        while let Some(event) = rx.recv().await {
            publish_event(self.bus.as_ref(), &self.topic, event).await;
            drained += 1;
        }
        if drained > 0 {
            debug!("Published {} queued telemetry events on shutdown.", drained);
        }
        info!("Telemetry publisher shutting down.");
    }
}

async fn run_worker(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<TelemetryEvent>>>,
    bus: Arc<dyn MessageBus>,
    topic: String,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => None,
            event = async { rx.lock().await.recv().await } => event,
        };
        let Some(event) = next else {
            debug!("Publisher worker {} exiting.", worker_id);
            return;
        };
        publish_event(bus.as_ref(), &topic, event).await;
    }
}

async fn publish_event(bus: &dyn MessageBus, topic: &str, event: TelemetryEvent) {
    let result = match event.to_payload() {
        Ok(payload) => bus.publish(topic, payload).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => {
            metrics::TELEMETRY_PUBLISHED_TOTAL.inc();
            debug!(
                "[{}]: published {} records to '{}'",
                event.imei,
                event.packet.data.len(),
                topic
            );
        }
        Err(e) => {
            metrics::TELEMETRY_PUBLISH_FAILURES_TOTAL.inc();
            error!("[{}]: telemetry publish error ({})", event.imei, e);
        }
    }
}
