// src/config.rs

//! Manages bridge configuration: loading, command-line overrides, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::warn;

/// Settings for the device-facing TCP listener.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DeviceConfig {
    #[serde(default = "default_device_address")]
    pub address: String,
    /// A connection with no complete frame for this long is closed.
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// How long a new connection may take to send its identifier.
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Frames whose data section exceeds this many bytes close the connection.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: default_device_address(),
            idle_timeout: default_idle_timeout(),
            handshake_timeout: default_idle_timeout(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

fn default_device_address() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_idle_timeout() -> Duration {
    Duration::from_secs(15 * 60)
}
fn default_max_frame_size() -> usize {
    crate::core::protocol::DEFAULT_MAX_FRAME_SIZE
}

/// Settings for the command and client listing HTTP server.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_http_address")]
    pub address: String,
    /// The longest a `/cmd` request waits for the device to reply.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: default_http_address(),
            command_timeout: default_command_timeout(),
        }
    }
}

fn default_http_address() -> String {
    "0.0.0.0:8081".to_string()
}
fn default_command_timeout() -> Duration {
    Duration::from_secs(3 * 60)
}

/// Settings for the MQTT telemetry bus.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MqttConfig {
    #[serde(default = "default_broker")]
    pub broker: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_keep_alive", with = "humantime_serde")]
    pub keep_alive: Duration,
    /// Capacity of the client's outgoing request channel.
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            topic: default_topic(),
            client_id: default_client_id(),
            keep_alive: default_keep_alive(),
            request_capacity: default_request_capacity(),
        }
    }
}

fn default_broker() -> String {
    "localhost:1883".to_string()
}
fn default_topic() -> String {
    "tcp-server".to_string()
}
fn default_client_id() -> String {
    "clien-42".to_string()
}
fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}
fn default_request_capacity() -> usize {
    64
}

/// Sizing of the telemetry publisher pool.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PublisherConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Events beyond this many queued are dropped rather than blocking a device.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    1024
}

/// Configuration for TLS on the device listener.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cert_path")]
    pub cert_path: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_path: default_cert_path(),
            key_path: default_key_path(),
        }
    }
}

fn default_cert_path() -> String {
    "trackbridge.crt".to_string()
}
fn default_key_path() -> String {
    "trackbridge.key".to_string()
}

/// Represents the final, validated bridge configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub tls: TlsConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            device: DeviceConfig::default(),
            http: HttpConfig::default(),
            mqtt: MqttConfig::default(),
            publisher: PublisherConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to load configuration from '{path}'"))
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Applies the command-line flags that override file settings.
    ///
    /// Recognized: `--address`, `--http`, `--broker`, `--topic`, `--client-id`,
    /// `--log-level`. `--config` is consumed by the caller and skipped here.
    pub fn apply_cli_overrides(&mut self, args: &[String]) -> Result<()> {
        let mut iter = args.iter().skip(1);
        while let Some(flag) = iter.next() {
            let target = match flag.as_str() {
                "--address" => &mut self.device.address,
                "--http" => &mut self.http.address,
                "--broker" => &mut self.mqtt.broker,
                "--topic" => &mut self.mqtt.topic,
                "--client-id" => &mut self.mqtt.client_id,
                "--log-level" => &mut self.log_level,
                "--config" => {
                    iter.next();
                    continue;
                }
                other => return Err(anyhow!("Unknown argument '{other}'")),
            };
            let value = iter
                .next()
                .ok_or_else(|| anyhow!("{flag} flag requires a value"))?;
            *target = value.clone();
        }
        self.validate()
    }

    /// Validates the configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.device.address.trim().is_empty() {
            return Err(anyhow!("device.address cannot be empty"));
        }
        if self.http.address.trim().is_empty() {
            return Err(anyhow!("http.address cannot be empty"));
        }
        if self.device.address.trim() == self.http.address.trim() {
            return Err(anyhow!(
                "device.address and http.address cannot be the same"
            ));
        }
        if self.device.idle_timeout.is_zero() {
            return Err(anyhow!("device.idle_timeout cannot be 0"));
        }
        if self.device.handshake_timeout.is_zero() {
            return Err(anyhow!("device.handshake_timeout cannot be 0"));
        }
        if self.device.max_frame_size == 0 {
            return Err(anyhow!("device.max_frame_size cannot be 0"));
        }
        if self.http.command_timeout.is_zero() {
            return Err(anyhow!("http.command_timeout cannot be 0"));
        }
        if self.mqtt.broker.trim().is_empty() {
            return Err(anyhow!("mqtt.broker cannot be empty"));
        }
        if self.mqtt.topic.trim().is_empty() {
            return Err(anyhow!("mqtt.topic cannot be empty"));
        }
        if self.mqtt.client_id.trim().is_empty() {
            return Err(anyhow!("mqtt.client_id cannot be empty"));
        }
        if self.mqtt.request_capacity == 0 {
            return Err(anyhow!("mqtt.request_capacity cannot be 0"));
        }
        if self.publisher.workers == 0 {
            return Err(anyhow!("publisher.workers cannot be 0"));
        }
        if self.publisher.queue_capacity == 0 {
            return Err(anyhow!("publisher.queue_capacity cannot be 0"));
        }
        if self.publisher.queue_capacity < self.publisher.workers {
            warn!(
                "publisher.queue_capacity ({}) is smaller than publisher.workers ({}); some workers will idle.",
                self.publisher.queue_capacity, self.publisher.workers
            );
        }

        if self.tls.enabled {
            if self.tls.cert_path.trim().is_empty() {
                return Err(anyhow!("tls.cert_path cannot be empty when TLS is enabled"));
            }
            if self.tls.key_path.trim().is_empty() {
                return Err(anyhow!("tls.key_path cannot be empty when TLS is enabled"));
            }
        }
        Ok(())
    }
}
