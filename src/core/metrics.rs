// src/core/metrics.rs

//! Defines and registers Prometheus metrics for bridge monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, TextEncoder, register_counter, register_counter_vec,
    register_gauge, register_histogram,
};

lazy_static! {
    // --- Device Connections ---
    /// The number of identified devices currently registered.
    pub static ref CONNECTED_DEVICES: Gauge =
        register_gauge!("trackbridge_connected_devices", "Number of currently registered devices.").unwrap();
    /// The total number of sockets accepted on the device listener.
    pub static ref CONNECTIONS_RECEIVED_TOTAL: Counter =
        register_counter!("trackbridge_connections_received_total", "Total number of device connections accepted.").unwrap();
    /// Connections closed because the identification message was invalid or missing.
    pub static ref HANDSHAKE_FAILURES_TOTAL: Counter =
        register_counter!("trackbridge_handshake_failures_total", "Total number of failed device handshakes.").unwrap();
    pub static ref PACKETS_DECODED_TOTAL: Counter =
        register_counter!("trackbridge_packets_decoded_total", "Total number of frames decoded from devices.").unwrap();
    pub static ref DECODE_ERRORS_TOTAL: Counter =
        register_counter!("trackbridge_decode_errors_total", "Total number of connections closed by a decode error.").unwrap();


    // --- Commands ---
    pub static ref COMMANDS_SENT_TOTAL: Counter =
        register_counter!("trackbridge_commands_sent_total", "Total number of commands written to devices.").unwrap();
    /// Completed command requests, labeled by outcome.
    pub static ref COMMAND_OUTCOMES_TOTAL: CounterVec =
        register_counter_vec!("trackbridge_command_outcomes_total", "Total number of command requests, labeled by outcome.", &["outcome"]).unwrap();
    /// Device messages that no waiting command received.
    pub static ref REPLIES_DROPPED_TOTAL: Counter =
        register_counter!("trackbridge_replies_dropped_total", "Total number of device messages not delivered to a waiting command.").unwrap();
    pub static ref COMMAND_LATENCY_SECONDS: Histogram =
        register_histogram!("trackbridge_command_latency_seconds", "Latency of command requests in seconds.").unwrap();


    // --- Telemetry ---
    pub static ref TELEMETRY_PUBLISHED_TOTAL: Counter =
        register_counter!("trackbridge_telemetry_published_total", "Total number of telemetry events handed to the message bus.").unwrap();
    pub static ref TELEMETRY_PUBLISH_FAILURES_TOTAL: Counter =
        register_counter!("trackbridge_telemetry_publish_failures_total", "Total number of failed telemetry publish attempts.").unwrap();
    /// Events discarded because the publish queue was full.
    pub static ref TELEMETRY_DROPPED_TOTAL: Counter =
        register_counter!("trackbridge_telemetry_dropped_total", "Total number of telemetry events dropped before publishing.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# failed to encode metrics: {e}\n"))
}
