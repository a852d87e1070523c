//! Request/response correlation tables
//!
//! Two independent maps from correlation id to a one-shot completion handle:
//! one for task responses, one for device-info responses. The message router
//! resolves entries as frames arrive; callers insert an entry before sending
//! and await the handle under their own timeout.
//!
//! Unknown-correlation and duplicate-completion conditions are recoverable
//! races (a response arriving after a timeout, or arriving twice) — they are
//! logged and never escalated to errors. Resolution removes the entry
//! atomically, so no entry outlives its device's connection: a device-level
//! disconnect cancels every outstanding entry for that device at once.

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use constellation_core::{ConstellationError, DeviceId, DeviceInfo, MessageStatus};

// ----------------------------------------------------------------------------
// Completion Payloads
// ----------------------------------------------------------------------------

/// Resolved outcome of one task exchange, as reported by the device
#[derive(Debug, Clone)]
pub struct TaskResponse {
    pub status: MessageStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl TaskResponse {
    /// Whether the device reported a successful completion
    pub fn is_success(&self) -> bool {
        self.status.is_success() && self.error.is_none()
    }
}

type TaskWaiter = oneshot::Sender<Result<TaskResponse, ConstellationError>>;
type InfoWaiter = oneshot::Sender<Result<DeviceInfo, ConstellationError>>;

struct Entry<W> {
    device_id: DeviceId,
    waiter: W,
}

// ----------------------------------------------------------------------------
// Pending Tables
// ----------------------------------------------------------------------------

/// The two correlation tables, keyed by correlation id
#[derive(Default)]
pub struct PendingTables {
    tasks: DashMap<String, Entry<TaskWaiter>>,
    device_info: DashMap<String, Entry<InfoWaiter>>,
}

impl PendingTables {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Task correlation
    // ------------------------------------------------------------------

    /// Register a waiter for a task response. The caller owns the returned
    /// receiver and its timeout.
    pub fn insert_task(
        &self,
        correlation_id: &str,
        device_id: DeviceId,
    ) -> oneshot::Receiver<Result<TaskResponse, ConstellationError>> {
        let (waiter, rx) = oneshot::channel();
        self.tasks
            .insert(correlation_id.to_string(), Entry { device_id, waiter });
        rx
    }

    /// Caller-side cleanup after a timeout or send failure
    pub fn remove_task(&self, correlation_id: &str) {
        self.tasks.remove(correlation_id);
    }

    /// Resolve a task waiter. Invoked only by the message router.
    ///
    /// An absent id means the waiter already timed out, was cancelled, or was
    /// completed before — all recoverable, all logged, never raised.
    pub fn complete_task(&self, correlation_id: &str, response: TaskResponse) {
        match self.tasks.remove(correlation_id) {
            Some((_, entry)) => {
                if entry.waiter.send(Ok(response)).is_err() {
                    debug!(correlation_id, "task waiter dropped before completion");
                }
            }
            None => {
                warn!(
                    correlation_id,
                    "task completion with no pending request (timed out or already completed)"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Device-info correlation
    // ------------------------------------------------------------------

    /// Register a waiter for a device-info response
    pub fn insert_device_info(
        &self,
        correlation_id: &str,
        device_id: DeviceId,
    ) -> oneshot::Receiver<Result<DeviceInfo, ConstellationError>> {
        let (waiter, rx) = oneshot::channel();
        self.device_info
            .insert(correlation_id.to_string(), Entry { device_id, waiter });
        rx
    }

    /// Caller-side cleanup after a timeout or send failure
    pub fn remove_device_info(&self, correlation_id: &str) {
        self.device_info.remove(correlation_id);
    }

    /// Resolve a device-info waiter. Invoked only by the message router.
    pub fn complete_device_info(&self, correlation_id: &str, info: DeviceInfo) {
        match self.device_info.remove(correlation_id) {
            Some((_, entry)) => {
                if entry.waiter.send(Ok(info)).is_err() {
                    debug!(correlation_id, "device info waiter dropped before completion");
                }
            }
            None => {
                warn!(
                    correlation_id,
                    "device info completion with no pending request"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Device-level cancellation
    // ------------------------------------------------------------------

    /// Cancel every outstanding entry for a device in both tables.
    ///
    /// Called on every disconnect, manual or detected. Waiting callers
    /// unblock immediately with a disconnect error instead of running out
    /// their nominal timeouts.
    pub fn cancel_for_device(&self, device_id: &DeviceId) -> usize {
        let mut cancelled = 0;

        let task_ids: Vec<String> = self
            .tasks
            .iter()
            .filter(|e| &e.value().device_id == device_id)
            .map(|e| e.key().clone())
            .collect();
        for id in task_ids {
            if let Some((_, entry)) = self.tasks.remove(&id) {
                let _ = entry.waiter.send(Err(ConstellationError::DeviceDisconnected {
                    device_id: device_id.clone(),
                }));
                cancelled += 1;
            }
        }

        let info_ids: Vec<String> = self
            .device_info
            .iter()
            .filter(|e| &e.value().device_id == device_id)
            .map(|e| e.key().clone())
            .collect();
        for id in info_ids {
            if let Some((_, entry)) = self.device_info.remove(&id) {
                let _ = entry.waiter.send(Err(ConstellationError::DeviceDisconnected {
                    device_id: device_id.clone(),
                }));
                cancelled += 1;
            }
        }

        if cancelled > 0 {
            debug!(device = %device_id, cancelled, "cancelled pending requests on disconnect");
        }
        cancelled
    }

    /// Number of outstanding task waiters (test observability)
    pub fn pending_task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Number of outstanding device-info waiters (test observability)
    pub fn pending_device_info_count(&self) -> usize {
        self.device_info.len()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn response_ok() -> TaskResponse {
        TaskResponse {
            status: MessageStatus::Completed,
            result: Some(json!({"ok": true})),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_complete_resolves_waiter_once() {
        let tables = PendingTables::new();
        let rx = tables.insert_task("c-1", DeviceId::new("d1"));

        tables.complete_task("c-1", response_ok());
        let resolved = rx.await.unwrap().unwrap();
        assert!(resolved.is_success());
        assert_eq!(tables.pending_task_count(), 0);

        // Second completion for the same id is a logged no-op
        tables.complete_task("c-1", response_ok());
    }

    #[tokio::test]
    async fn test_unknown_correlation_does_not_panic() {
        let tables = PendingTables::new();
        tables.complete_task("never-registered", response_ok());
        tables.complete_device_info("never-registered", DeviceInfo::default());
    }

    #[tokio::test]
    async fn test_cancel_for_device_scopes_to_one_device() {
        let tables = PendingTables::new();
        let rx_d1 = tables.insert_task("c-1", DeviceId::new("d1"));
        let rx_d2 = tables.insert_task("c-2", DeviceId::new("d2"));
        let rx_info = tables.insert_device_info("i-1", DeviceId::new("d1"));

        let cancelled = tables.cancel_for_device(&DeviceId::new("d1"));
        assert_eq!(cancelled, 2);

        let err = rx_d1.await.unwrap().unwrap_err();
        assert_eq!(err.error_category(), "device_disconnection");
        let err = rx_info.await.unwrap().unwrap_err();
        assert_eq!(err.error_category(), "device_disconnection");

        // d2's entry survives
        assert_eq!(tables.pending_task_count(), 1);
        tables.complete_task("c-2", response_ok());
        assert!(rx_d2.await.unwrap().unwrap().is_success());
    }

    #[tokio::test]
    async fn test_caller_side_removal_wins_race() {
        let tables = PendingTables::new();
        let rx = tables.insert_task("c-1", DeviceId::new("d1"));
        drop(rx); // caller timed out and went away

        tables.remove_task("c-1");
        tables.complete_task("c-1", response_ok());
        assert_eq!(tables.pending_task_count(), 0);
    }

    #[test]
    fn test_response_success_requires_no_error() {
        let mut response = response_ok();
        assert!(response.is_success());
        response.error = Some("device-side failure".to_string());
        assert!(!response.is_success());
    }
}
