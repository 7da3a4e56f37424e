// src/core/dispatcher.rs

//! Routes every decoded packet: text messages to a waiting command, telemetry
//! records to the publish queue.

use crate::core::correlator::CommandCorrelator;
use crate::core::hub::HubObserver;
use crate::core::metrics;
use crate::core::protocol::Packet;
use crate::core::publisher::{TelemetryEvent, TelemetrySender};
use crate::core::registry::DeviceConnection;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct TelemetryDispatcher {
    correlator: Arc<CommandCorrelator>,
    telemetry: TelemetrySender,
}

impl TelemetryDispatcher {
    pub fn new(correlator: Arc<CommandCorrelator>, telemetry: TelemetrySender) -> Self {
        Self {
            correlator,
            telemetry,
        }
    }
}

impl HubObserver for TelemetryDispatcher {
    /// Only the first message of a packet can answer a command; any further
    /// messages in the same packet are logged and counted as dropped.
    fn on_packet(&self, conn: &DeviceConnection, packet: &Arc<Packet>) {
        if let Some((first, rest)) = packet.messages.split_first() {
            // Counted before the waiter wakes.
            if !rest.is_empty() {
                metrics::REPLIES_DROPPED_TOTAL.inc_by(rest.len() as f64);
                warn!(
                    "[{}]: dropping {} additional message(s) from one packet",
                    conn.identifier(),
                    rest.len()
                );
            }
            let delivered =
                self.correlator
                    .deliver_reply(conn.identifier(), conn.session_id(), first.text.clone());
            if !delivered {
                metrics::REPLIES_DROPPED_TOTAL.inc();
                debug!(
                    "[{}]: message '{}' arrived with no command waiting",
                    conn.identifier(),
                    first.text
                );
            }
        }

        if packet.has_telemetry() {
            self.telemetry
                .try_enqueue(TelemetryEvent::new(conn.identifier(), packet.clone()));
        }
    }
}
