//! Registration handshake tracking
//!
//! Registration is a one-shot exchange: the constellation sends REGISTER and
//! the ack comes back asynchronously through the message router. The tracker
//! is the side channel between the two — a single-resolution boolean signal
//! per device, created before the REGISTER frame is sent and observed by the
//! connecting caller under its own timeout.
//!
//! The first HEARTBEAT with status OK counts as an implicit positive ack; an
//! ERROR during the registration phase is a negative ack. Anything after the
//! first resolution is ignored.

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use constellation_core::DeviceId;

// ----------------------------------------------------------------------------
// Registration Tracker
// ----------------------------------------------------------------------------

enum RegState {
    Waiting(oneshot::Sender<bool>),
    Done(bool),
}

/// Per-device one-shot registration signals
#[derive(Default)]
pub struct RegistrationTracker {
    states: DashMap<DeviceId, RegState>,
}

impl RegistrationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the signal for a fresh handshake, replacing any stale state from
    /// a previous connection. Must be called before the REGISTER frame is
    /// sent.
    pub fn begin(&self, device_id: &DeviceId) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.states.insert(device_id.clone(), RegState::Waiting(tx));
        rx
    }

    /// Resolve the signal. Only the first resolution counts; later calls
    /// (subsequent heartbeats) are ignored.
    pub fn complete(&self, device_id: &DeviceId, accepted: bool) {
        match self.states.entry(device_id.clone()) {
            MapEntry::Occupied(mut entry) => {
                if let RegState::Waiting(_) = entry.get() {
                    if let RegState::Waiting(tx) =
                        std::mem::replace(entry.get_mut(), RegState::Done(accepted))
                    {
                        if tx.send(accepted).is_err() {
                            debug!(device = %device_id, "registration waiter gone before ack");
                        }
                    }
                }
            }
            MapEntry::Vacant(entry) => {
                // Ack raced ahead of begin(); remember the outcome
                entry.insert(RegState::Done(accepted));
            }
        }
    }

    /// Whether the device is still waiting for its ack. The router uses this
    /// to classify an ERROR frame as a registration rejection.
    pub fn is_waiting(&self, device_id: &DeviceId) -> bool {
        matches!(
            self.states.get(device_id).as_deref(),
            Some(RegState::Waiting(_))
        )
    }

    /// Drop all state for a device on teardown
    pub fn clear(&self, device_id: &DeviceId) {
        self.states.remove(device_id);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
