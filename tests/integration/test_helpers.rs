// tests/integration/test_helpers.rs

//! Test helpers and utilities for integration tests

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinSet;
use tokio_util::codec::Decoder;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;
use trackbridge::core::errors::BusError;
use trackbridge::core::protocol::{DecodedFrame, Packet, TeltonikaCodec, encode_packet};
use trackbridge::core::publisher::{MessageBus, PublisherPool, telemetry_channel};
use trackbridge::core::{
    CommandCorrelator, DeviceHub, DeviceRegistry, HubSettings, TelemetryDispatcher,
};
use trackbridge::server::{BridgeState, run_http_bridge};

pub const TOPIC: &str = "tcp-server";

/// Installs a test-friendly subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("warn"))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// An in-memory `MessageBus` that records every publish.
#[derive(Default)]
pub struct RecordingBus {
    published: Mutex<Vec<(String, Bytes)>>,
    notify: Notify,
}

impl RecordingBus {
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.published.lock().unwrap().clone()
    }

    /// Waits until at least `count` events have been published.
    pub async fn wait_for(&self, count: usize) -> Vec<(String, Bytes)> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notified = self.notify.notified();
                let published = self.published();
                if published.len() >= count {
                    return published;
                }
                notified.await;
            }
        })
        .await
        .expect("timed out waiting for published telemetry")
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        self.notify.notify_waiters();
        Ok(())
    }
}

/// A fully wired bridge on loopback ports, with the MQTT client replaced by a
/// `RecordingBus`.
pub struct TestBridge {
    pub hub: Arc<DeviceHub>,
    pub correlator: Arc<CommandCorrelator>,
    pub bus: Arc<RecordingBus>,
    pub device_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub http: reqwest::Client,
    shutdown_tx: broadcast::Sender<()>,
    tasks: JoinSet<()>,
}

impl TestBridge {
    /// Starts a bridge with short timeouts suitable for tests.
    pub async fn start() -> Self {
        Self::with_settings(
            HubSettings {
                idle_timeout: Duration::from_secs(10),
                handshake_timeout: Duration::from_secs(2),
                ..HubSettings::default()
            },
            Duration::from_millis(500),
        )
        .await
    }

    pub async fn with_settings(settings: HubSettings, command_timeout: Duration) -> Self {
        init_tracing();
        let (shutdown_tx, _) = broadcast::channel(1);

        let registry = Arc::new(DeviceRegistry::new());
        let correlator = Arc::new(CommandCorrelator::new(registry.clone()));
        let bus = Arc::new(RecordingBus::default());
        let (telemetry_tx, telemetry_rx) = telemetry_channel(64);
        let publisher = PublisherPool::new(bus.clone(), TOPIC, 2, telemetry_rx);
        let dispatcher = Arc::new(TelemetryDispatcher::new(correlator.clone(), telemetry_tx));
        let hub = Arc::new(
            DeviceHub::new(registry, settings)
                .with_observer(dispatcher)
                .with_observer(correlator.clone()),
        );

        let device_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let device_addr = device_listener.local_addr().unwrap();
        let http_addr = http_listener.local_addr().unwrap();

        let mut tasks = JoinSet::new();
        let serve_hub = hub.clone();
        let serve_shutdown = shutdown_tx.clone();
        tasks.spawn(async move {
            serve_hub
                .serve(device_listener, serve_shutdown)
                .await
                .expect("device listener failed");
        });
        let publisher_shutdown = shutdown_tx.subscribe();
        tasks.spawn(async move { publisher.run(publisher_shutdown).await });
        let state = BridgeState {
            hub: hub.clone(),
            correlator: correlator.clone(),
            command_timeout,
        };
        let http_shutdown = shutdown_tx.subscribe();
        tasks.spawn(async move {
            run_http_bridge(http_listener, state, http_shutdown)
                .await
                .expect("http bridge failed");
        });

        Self {
            hub,
            correlator,
            bus,
            device_addr,
            http_addr,
            http: reqwest::Client::new(),
            shutdown_tx,
            tasks,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.http_addr, path)
    }

    /// Posts `command` for `imei` and returns the status code and body.
    pub async fn post_command(&self, imei: &str, command: &str) -> (u16, String) {
        let response = self
            .http
            .post(self.url(&format!("/cmd?imei={imei}")))
            .body(command.to_string())
            .send()
            .await
            .expect("http request failed");
        let status = response.status().as_u16();
        (status, response.text().await.unwrap())
    }

    pub async fn list_clients(&self) -> String {
        self.http
            .get(self.url("/list-clients"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap()
    }

    /// Polls until `identifier` is registered (or no longer is, when `present` is false).
    pub async fn wait_registered(&self, identifier: &str, present: bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.hub.registry().get(identifier).is_some() != present {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("registry did not reach the expected state");
    }

    /// Polls until a command for `identifier` is waiting on a reply.
    pub async fn wait_pending(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.correlator.pending_count() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pending command count did not settle");
    }

    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(());
        let _ = tokio::time::timeout(Duration::from_secs(5), async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;
    }
}

/// The device side of a loopback connection.
pub struct FakeDevice {
    pub stream: TcpStream,
    buf: BytesMut,
    codec: TeltonikaCodec,
}

impl FakeDevice {
    /// Connects and performs the handshake, asserting the server's ack.
    pub async fn connect(addr: SocketAddr, imei: &str) -> Self {
        let mut device = Self::connect_raw(addr).await;
        device.send_identifier(imei).await;
        let ack = device.read_bytes(1).await;
        assert_eq!(ack, vec![0x01], "server must ack the identification");
        device
    }

    /// Connects without identifying.
    pub async fn connect_raw(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            stream,
            buf: BytesMut::new(),
            codec: TeltonikaCodec::default(),
        }
    }

    pub async fn send_identifier(&mut self, imei: &str) {
        let mut msg = (imei.len() as u16).to_be_bytes().to_vec();
        msg.extend_from_slice(imei.as_bytes());
        self.stream.write_all(&msg).await.unwrap();
    }

    pub async fn send_packet(&mut self, packet: &Packet) {
        let bytes = encode_packet(packet).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    pub async fn read_bytes(&mut self, n: usize) -> Vec<u8> {
        let mut out = vec![0u8; n];
        tokio::time::timeout(Duration::from_secs(5), self.stream.read_exact(&mut out))
            .await
            .expect("timed out reading from server")
            .unwrap();
        out
    }

    /// Reads the server's record-count acknowledgment for an AVL frame.
    pub async fn read_record_ack(&mut self) -> u32 {
        let bytes = self.read_bytes(4).await;
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Reads one complete frame written by the server.
    pub async fn read_frame(&mut self) -> DecodedFrame {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(frame) = self.codec.decode(&mut self.buf).unwrap() {
                    return frame;
                }
                let n = self.stream.read_buf(&mut self.buf).await.unwrap();
                assert!(n > 0, "server closed the connection mid-frame");
            }
        })
        .await
        .expect("timed out waiting for a frame")
    }

    /// Waits until the server closes the connection.
    pub async fn expect_closed(&mut self) {
        let mut scratch = [0u8; 64];
        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match self.stream.read(&mut scratch).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => continue,
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "server did not close the connection");
    }
}
