//! Per-device FIFO task dispatch
//!
//! Each device runs at most one task at a time; everything else waits in that
//! device's queue in submission order. The busy-check-or-enqueue decision and
//! the pop-next-or-go-idle decision both happen under one dispatch lock (with
//! the registry locked inside it, always in that order), so two concurrent
//! submitters can never both see IDLE and no completed task can miss a
//! freshly queued successor.
//!
//! Queues for different devices are independent; dispatch across devices is
//! fully parallel.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use constellation_core::{
    ConstellationError, DeviceId, DeviceRegistry, ExecutionResult, Result, TaskId, TaskRequest,
};

// ----------------------------------------------------------------------------
// Queue Entries
// ----------------------------------------------------------------------------

/// A task parked behind the device's current one, with its caller's handle
pub(crate) struct QueuedTask {
    pub task: TaskRequest,
    pub done: oneshot::Sender<ExecutionResult>,
}

/// Outcome of an assignment attempt
#[derive(Debug)]
pub(crate) enum Assignment {
    /// Device was idle; the caller must execute the task now
    RunNow,
    /// Device was busy; the task is queued and this handle resolves when it
    /// eventually runs
    Enqueued(oneshot::Receiver<ExecutionResult>),
}

/// What the drain loop does after finishing one task
pub(crate) enum NextStep {
    /// Execute this queued task next; it is already marked BUSY
    Run(QueuedTask),
    /// The device disconnected: fail every surrendered caller immediately
    FailAll(Vec<QueuedTask>),
    /// Queue empty (device returned to IDLE) or another drain owns the device
    Done,
}

// ----------------------------------------------------------------------------
// Task Queues
// ----------------------------------------------------------------------------

/// Per-device FIFO queues behind the single dispatch lock
#[derive(Default)]
pub struct TaskQueues {
    queues: Mutex<HashMap<DeviceId, VecDeque<QueuedTask>>>,
}

impl TaskQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide between immediate execution and queueing.
    ///
    /// Precondition checks fail fast before any network I/O: the device must
    /// be registered and connected. When the device is idle it is marked BUSY
    /// with this task before the lock drops, so no second submitter can slip
    /// in.
    pub(crate) async fn assign(
        &self,
        registry: &Mutex<DeviceRegistry>,
        task: &TaskRequest,
    ) -> Result<Assignment> {
        let mut queues = self.queues.lock().await;
        let mut registry = registry.lock().await;

        let record = registry
            .get(&task.device_id)
            .ok_or_else(|| ConstellationError::NotRegistered {
                device_id: task.device_id.clone(),
            })?;
        if !record.status.is_connected() {
            return Err(ConstellationError::NotConnected {
                device_id: task.device_id.clone(),
            });
        }

        if registry.is_busy(&task.device_id) {
            let (done, handle) = oneshot::channel();
            let queue = queues.entry(task.device_id.clone()).or_default();
            queue.push_back(QueuedTask {
                task: task.clone(),
                done,
            });
            debug!(
                device = %task.device_id,
                task = %task.task_id,
                queued = queue.len(),
                "device busy, task queued"
            );
            Ok(Assignment::Enqueued(handle))
        } else {
            registry.set_busy(&task.device_id, task.task_id.clone());
            Ok(Assignment::RunNow)
        }
    }

    /// Finish the current task and atomically decide what the drain does
    /// next. Runs after every execution, success or failure, so the queue
    /// always drains.
    ///
    /// While the device is connected and this drain still owns it (the
    /// finished task is still the registry's current task), the next queued
    /// task is claimed BUSY under the lock. Once the device is disconnected
    /// the entire remaining queue is surrendered in one step so its callers
    /// can be failed immediately, without ever racing a reconnected link.
    pub(crate) async fn after_completion(
        &self,
        registry: &Mutex<DeviceRegistry>,
        device_id: &DeviceId,
        finished: &TaskId,
    ) -> NextStep {
        let mut queues = self.queues.lock().await;
        let mut registry = registry.lock().await;

        let connected = registry
            .get(device_id)
            .map(|r| r.status.is_connected())
            .unwrap_or(false);

        if !connected {
            let remaining: Vec<QueuedTask> = queues
                .remove(device_id)
                .map(|q| q.into_iter().collect())
                .unwrap_or_default();
            return NextStep::FailAll(remaining);
        }

        // Another submission claimed the device while it was disconnected
        // and reconnected mid-drain; its own drain owns the queue now
        if registry.current_task(device_id).as_ref() != Some(finished) {
            return NextStep::Done;
        }

        match queues.get_mut(device_id).and_then(VecDeque::pop_front) {
            Some(queued) => {
                registry.set_busy(device_id, queued.task.task_id.clone());
                NextStep::Run(queued)
            }
            None => {
                registry.set_idle(device_id);
                NextStep::Done
            }
        }
    }

    /// Current queue depth for a device
    pub async fn queue_size(&self, device_id: &DeviceId) -> usize {
        self.queues
            .lock()
            .await
            .get(device_id)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Drop a device's queue entirely (used by explicit device removal).
    /// Pending callers see their handles close with a disconnect-style
    /// failure produced by the manager.
    pub(crate) async fn take_queue(&self, device_id: &DeviceId) -> Vec<QueuedTask> {
        self.queues
            .lock()
            .await
            .remove(device_id)
            .map(|q| q.into_iter().collect())
            .unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
