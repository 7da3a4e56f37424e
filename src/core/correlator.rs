// src/core/correlator.rs

//! Correlates an outbound command with the device's asynchronous reply.
//!
//! # Core Design: One Command In Flight Per Device
//!
//! Each identifier has a *lane*: a single-permit semaphore whose FIFO wait
//! queue orders competing commands for the same device. Only the permit
//! holder may install a `PendingReplySlot`, so at most one slot exists per
//! identifier and a waiting command never observes another command's slot.
//!
//! The slot remembers the session the command was written to. A reply or a
//! disconnect from any other session (e.g. a stale connection being torn down
//! after the device reconnected) is not routed to it. The connection itself
//! is checked once the command is written, which covers a close that raced
//! with installing the slot.
//!
//! All cleanup happens in `LaneGuard::drop`, so a caller that abandons the
//! request mid-wait still frees the slot and the lane.

use crate::core::errors::{CommandError, HubError};
use crate::core::hub::HubObserver;
use crate::core::metrics;
use crate::core::protocol::Packet;
use crate::core::registry::{ClientInfo, DeviceRegistry, SessionId};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::time::timeout_at;
use tracing::{debug, info};

/// What a waiting command is woken with.
#[derive(Debug)]
enum SlotEvent {
    Reply(String),
    Disconnected,
}

/// The single-capacity mailbox for one in-flight command.
#[derive(Debug)]
struct PendingReplySlot {
    session_id: SessionId,
    tx: oneshot::Sender<SlotEvent>,
}

/// Manages per-device command lanes and reply slots.
#[derive(Debug)]
pub struct CommandCorrelator {
    registry: Arc<DeviceRegistry>,
    lanes: DashMap<String, Arc<Semaphore>>,
    slots: DashMap<String, PendingReplySlot>,
}

impl CommandCorrelator {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            registry,
            lanes: DashMap::new(),
            slots: DashMap::new(),
        }
    }

    /// Sends `command` to the device and waits for its reply.
    ///
    /// The whole call, including the wait for an earlier command on the same
    /// device to finish, is bounded by `wait`.
    pub async fn send_command_and_wait(
        &self,
        identifier: &str,
        command: &str,
        wait: Duration,
    ) -> Result<String, CommandError> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + wait;

        let result = self.acquire_and_exchange(identifier, command, deadline).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.label(),
        };
        metrics::COMMAND_OUTCOMES_TOTAL
            .with_label_values(&[outcome])
            .inc();
        metrics::COMMAND_LATENCY_SECONDS.observe(started.elapsed().as_secs_f64());
        result
    }

    async fn acquire_and_exchange(
        &self,
        identifier: &str,
        command: &str,
        deadline: tokio::time::Instant,
    ) -> Result<String, CommandError> {
        // Declared before any local lane handle, so those are dropped first.
        let mut guard = LaneGuard {
            correlator: self,
            identifier,
            lane: None,
            permit: None,
            slot_installed: false,
        };
        let lane = self
            .lanes
            .entry(identifier.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();
        guard.lane = Some(lane.clone());

        let permit = match lane.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!("command for '{}' waiting for the pending one", identifier);
                match timeout_at(deadline, lane.acquire_owned()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) | Err(_) => return Err(CommandError::ResponseTimeout),
                }
            }
        };
        guard.permit = Some(permit);

        let conn = self.registry.get(identifier).ok_or_else(|| {
            CommandError::SendFailed(HubError::NotFound(identifier.to_string()))
        })?;

        let (tx, mut rx) = oneshot::channel();
        self.slots.insert(
            identifier.to_string(),
            PendingReplySlot {
                session_id: conn.session_id(),
                tx,
            },
        );
        guard.slot_installed = true;

        conn.send_packet(&Packet::command(command))
            .await
            .map_err(CommandError::SendFailed)?;
        metrics::COMMANDS_SENT_TOTAL.inc();
        info!("command '{}' sent to '{}'", command, identifier);

        // A close that ran before the slot was installed never reaches it.
        // Once closed, the session delivers no further replies.
        if conn.is_closed() {
            return match rx.try_recv() {
                Ok(SlotEvent::Reply(text)) => Ok(text),
                _ => Err(CommandError::DeviceDisconnected),
            };
        }

        match timeout_at(deadline, rx).await {
            Ok(Ok(SlotEvent::Reply(text))) => Ok(text),
            Ok(Ok(SlotEvent::Disconnected)) | Ok(Err(_)) => Err(CommandError::DeviceDisconnected),
            Err(_) => Err(CommandError::ResponseTimeout),
        }
    }

    /// Hands `text` to the command waiting on `identifier`, if that command was
    /// sent to `session_id`. Returns whether a waiter received it.
    pub fn deliver_reply(&self, identifier: &str, session_id: SessionId, text: String) -> bool {
        match self
            .slots
            .remove_if(identifier, |_, slot| slot.session_id == session_id)
        {
            Some((_, slot)) => slot.tx.send(SlotEvent::Reply(text)).is_ok(),
            None => false,
        }
    }

    /// Fails the command waiting on the closed session, if any.
    pub fn notify_disconnect(&self, info: &ClientInfo) -> bool {
        match self
            .slots
            .remove_if(&info.identifier, |_, slot| slot.session_id == info.session_id)
        {
            Some((_, slot)) => {
                debug!("failing pending command for '{}': device gone", info.identifier);
                slot.tx.send(SlotEvent::Disconnected).is_ok()
            }
            None => false,
        }
    }

    /// The number of commands currently waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.slots.len()
    }

    /// The number of identifiers with a command in flight or queued.
    pub fn active_lanes(&self) -> usize {
        self.lanes.len()
    }
}

impl HubObserver for CommandCorrelator {
    fn on_close(&self, info: &ClientInfo) {
        self.notify_disconnect(info);
    }
}

/// Releases the slot, the permit and, when unused, the lane itself.
struct LaneGuard<'a> {
    correlator: &'a CommandCorrelator,
    identifier: &'a str,
    lane: Option<Arc<Semaphore>>,
    permit: Option<OwnedSemaphorePermit>,
    slot_installed: bool,
}

impl Drop for LaneGuard<'_> {
    fn drop(&mut self) {
        // Only the permit holder installs slots, so the entry is ours.
        if self.slot_installed {
            self.correlator.slots.remove(self.identifier);
        }
        drop(self.permit.take());
        drop(self.lane.take());
        // A lane referenced only by the map has no holder and no waiters.
        self.correlator
            .lanes
            .remove_if(self.identifier, |_, lane| Arc::strong_count(lane) == 1);
    }
}
