//! Per-device heartbeat sending
//!
//! One periodic task per connected device: send a HEARTBEAT frame, sleep,
//! repeat while the transport reports connected. A send failure just ends
//! the loop — the router's disconnect path is triggered independently by the
//! same transport failure, so the monitor never reports disconnects itself.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace};

use constellation_core::{DeviceId, Envelope};

use crate::transport::Transport;

// ----------------------------------------------------------------------------
// Heartbeat Monitor
// ----------------------------------------------------------------------------

/// Owns the per-device heartbeat sender tasks
pub struct HeartbeatMonitor {
    constellation_id: String,
    interval: Duration,
    tasks: DashMap<DeviceId, JoinHandle<()>>,
}

impl HeartbeatMonitor {
    pub fn new(constellation_id: impl Into<String>, interval: Duration) -> Self {
        Self {
            constellation_id: constellation_id.into(),
            interval,
            tasks: DashMap::new(),
        }
    }

    /// Start the heartbeat sender for a device, replacing any previous one
    pub fn start(&self, device_id: &DeviceId, transport: Arc<dyn Transport>) {
        let constellation_id = self.constellation_id.clone();
        let interval = self.interval;
        let id = device_id.clone();

        let handle = tokio::spawn(async move {
            loop {
                if !transport.is_connected() {
                    debug!(device = %id, "heartbeat loop ending: transport gone");
                    break;
                }
                let envelope = Envelope::heartbeat(&constellation_id, &id);
                let frame = match envelope.encode() {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(device = %id, error = %e, "heartbeat encode failed");
                        break;
                    }
                };
                if let Err(e) = transport.send(frame).await {
                    debug!(device = %id, error = %e, "heartbeat send failed, stopping");
                    break;
                }
                trace!(device = %id, "heartbeat sent");
                sleep(interval).await;
            }
        });

        if let Some(previous) = self.tasks.insert(device_id.clone(), handle) {
            previous.abort();
        }
    }

    /// Stop the heartbeat sender for a device. Idempotent.
    pub fn stop(&self, device_id: &DeviceId) {
        if let Some((_, handle)) = self.tasks.remove(device_id) {
            handle.abort();
            debug!(device = %device_id, "heartbeat stopped");
        }
    }

    /// Whether a heartbeat sender is currently registered for the device
    pub fn is_running(&self, device_id: &DeviceId) -> bool {
        self.tasks.contains_key(device_id)
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        for entry in self.tasks.iter() {
            entry.value().abort();
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::stub_link;
    use constellation_core::MessageType;

    #[tokio::test]
    async fn test_heartbeats_flow_until_stopped() {
        let (transport, mut device) = stub_link();
        let monitor = HeartbeatMonitor::new("c", Duration::from_millis(10));
        let id = DeviceId::new("d1");

        monitor.start(&id, transport);
        let first = device.recv().await.expect("first heartbeat");
        assert_eq!(first.message_type, MessageType::Heartbeat);
        let second = device.recv().await.expect("second heartbeat");
        assert_eq!(second.message_type, MessageType::Heartbeat);

        monitor.stop(&id);
        assert!(!monitor.is_running(&id));
        // stop is idempotent
        monitor.stop(&id);
    }

    #[tokio::test]
    async fn test_loop_ends_when_transport_closes() {
        let (transport, device) = stub_link();
        let monitor = HeartbeatMonitor::new("c", Duration::from_millis(5));
        let id = DeviceId::new("d1");

        transport.close().await;
        drop(device);
        monitor.start(&id, transport);

        // Give the loop a moment to observe the dead transport and exit
        sleep(Duration::from_millis(20)).await;
        let handle = monitor.tasks.get(&id).expect("bookkeeping entry");
        assert!(handle.is_finished());
    }
}
