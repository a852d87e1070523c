//! Device manager and reconnection supervision
//!
//! The [`DeviceManager`] is the coordinator that owns every per-device map —
//! registry, correlation tables, registration signals, heartbeat tasks,
//! dispatch queues, and live links — and is the only way to reach them, so
//! the invariant "at most one transport and one in-flight task per device"
//! stays mechanically enforceable.
//!
//! Disconnects detected by a router arrive over the notifier channel; the
//! supervisor task cancels everything the device owed, then retries the
//! connection up to the device's budget with a fixed delay. A manual
//! disconnect shares the cleanup and skips the retries.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use constellation_core::message::task_correlation_id;
use constellation_core::{
    ConstellationConfig, ConstellationError, DeviceId, DeviceInfo, DeviceRecord, DeviceRegistry,
    DeviceStatus, Envelope, ExecutionResult, Result, TaskId, TaskRequest,
};

use crate::dispatch::{Assignment, NextStep, TaskQueues};
use crate::heartbeat::HeartbeatMonitor;
use crate::pending::{PendingTables, TaskResponse};
use crate::registration::RegistrationTracker;
use crate::router::{spawn_router, RouterContext};
use crate::transport::{Connector, Transport};

// ----------------------------------------------------------------------------
// Device Manager
// ----------------------------------------------------------------------------

struct DeviceLink {
    transport: Arc<dyn Transport>,
    router: JoinHandle<()>,
}

/// Coordinator for the whole device fleet. Cheap to clone; clones share
/// state.
#[derive(Clone)]
pub struct DeviceManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: ConstellationConfig,
    connector: Arc<dyn Connector>,
    registry: Arc<Mutex<DeviceRegistry>>,
    pending: Arc<PendingTables>,
    registration: Arc<RegistrationTracker>,
    heartbeats: HeartbeatMonitor,
    queues: TaskQueues,
    /// One live link per device, at most
    links: DashMap<DeviceId, DeviceLink>,
    disconnect_tx: mpsc::UnboundedSender<DeviceId>,
}

impl DeviceManager {
    /// Create the manager and start its disconnect supervisor.
    ///
    /// Must be called inside a tokio runtime. The connector is injected so
    /// tests plug in the in-memory stub.
    pub fn new(config: ConstellationConfig, connector: Arc<dyn Connector>) -> Self {
        let (disconnect_tx, mut disconnect_rx) = mpsc::unbounded_channel::<DeviceId>();

        let heartbeats =
            HeartbeatMonitor::new(config.constellation_id.clone(), config.heartbeat_interval);

        let inner = Arc::new(ManagerInner {
            config,
            connector,
            registry: Arc::new(Mutex::new(DeviceRegistry::new())),
            pending: Arc::new(PendingTables::new()),
            registration: Arc::new(RegistrationTracker::new()),
            heartbeats,
            queues: TaskQueues::new(),
            links: DashMap::new(),
            disconnect_tx,
        });

        // Supervisor: one recovery task per disconnect event, devices in
        // parallel. Weak so dropping the manager ends the loop.
        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(device_id) = disconnect_rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                tokio::spawn(async move {
                    inner.handle_disconnect(device_id).await;
                });
            }
        });

        Self { inner }
    }

    /// Configuration in effect
    pub fn config(&self) -> &ConstellationConfig {
        &self.inner.config
    }

    /// Create the registry record for a device. Connecting is separate.
    pub async fn register_device(
        &self,
        device_id: DeviceId,
        server_url: impl Into<String>,
        capabilities: Vec<String>,
        max_retries: Option<u32>,
    ) {
        let record = DeviceRecord::new(
            device_id.clone(),
            server_url,
            capabilities,
            max_retries.unwrap_or(self.inner.config.max_retries),
        );
        self.inner.registry.lock().await.register(record);
        info!(device = %device_id, "device registered");
    }

    /// Open the device's transport and run the registration handshake.
    ///
    /// A fresh call (`is_reconnection = false`) counts against the device's
    /// connection-attempt budget regardless of outcome; reconnection attempts
    /// never do. Returns `Ok(true)` on success, `Ok(false)` on any
    /// connection-level failure (the record's status reflects why), and an
    /// error only when the device was never registered.
    pub async fn connect_device(&self, device_id: &DeviceId, is_reconnection: bool) -> Result<bool> {
        self.inner.connect_device(device_id, is_reconnection).await
    }

    /// User-initiated disconnect: same cleanup as a detected disconnect, no
    /// automatic retry.
    pub async fn disconnect_device(&self, device_id: &DeviceId) -> Result<()> {
        if !self.inner.registry.lock().await.contains(device_id) {
            return Err(ConstellationError::NotRegistered {
                device_id: device_id.clone(),
            });
        }
        self.inner.teardown(device_id).await;
        info!(device = %device_id, "device disconnected by request");
        Ok(())
    }

    /// Tear a device down completely and drop its record
    pub async fn remove_device(&self, device_id: &DeviceId) -> Result<()> {
        self.inner.teardown(device_id).await;

        // Anything still queued can never run; fail its callers
        let abandoned = self.inner.queues.take_queue(device_id).await;
        for queued in abandoned {
            let err = ConstellationError::DeviceDisconnected {
                device_id: device_id.clone(),
            };
            let result = ExecutionResult::from_error(queued.task.task_id.clone(), device_id, &err);
            let _ = queued.done.send(result);
        }

        match self.inner.registry.lock().await.remove(device_id) {
            Some(_) => {
                info!(device = %device_id, "device removed");
                Ok(())
            }
            None => Err(ConstellationError::NotRegistered {
                device_id: device_id.clone(),
            }),
        }
    }

    /// Dispatch a task through the per-device FIFO policy.
    ///
    /// Precondition violations (unknown or disconnected device) fail fast
    /// with an error before any network I/O. Everything that goes wrong
    /// after that — timeout, disconnect mid-flight, device-reported failure —
    /// comes back as a failed [`ExecutionResult`] instead.
    pub async fn submit_task(&self, task: TaskRequest) -> Result<ExecutionResult> {
        let device_id = task.device_id.clone();
        match self
            .inner
            .queues
            .assign(&self.inner.registry, &task)
            .await?
        {
            Assignment::Enqueued(handle) => match handle.await {
                Ok(result) => Ok(result),
                // The queue was dropped wholesale (device removal)
                Err(_) => {
                    let err = ConstellationError::DeviceDisconnected {
                        device_id: device_id.clone(),
                    };
                    Ok(ExecutionResult::from_error(task.task_id, &device_id, &err))
                }
            },
            Assignment::RunNow => {
                let finished = task.task_id.clone();
                let result = self.inner.execute_now(&task).await;
                self.inner.clone().spawn_drain(device_id, finished);
                Ok(result)
            }
        }
    }

    /// Low-level single exchange: send the TASK frame and await its TASK_END
    /// under the task's timeout. Raises instead of wrapping failures; the
    /// dispatcher is the caller that turns these into results.
    pub async fn send_task_to_device(&self, task: &TaskRequest) -> Result<TaskResponse> {
        self.inner.send_task_to_device(task).await
    }

    /// Ask a device to describe itself. Best-effort callers pass a short
    /// timeout and tolerate the error.
    pub async fn request_device_info(
        &self,
        device_id: &DeviceId,
        wait: Duration,
    ) -> Result<DeviceInfo> {
        self.inner.request_device_info(device_id, wait).await
    }

    /// Snapshot of device records, optionally connected-only
    pub async fn list_devices(&self, connected_only: bool) -> Vec<DeviceRecord> {
        self.inner
            .registry
            .lock()
            .await
            .list(connected_only)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Current status of one device
    pub async fn device_status(&self, device_id: &DeviceId) -> Option<DeviceStatus> {
        self.inner
            .registry
            .lock()
            .await
            .get(device_id)
            .map(|r| r.status)
    }

    /// Snapshot of one device record
    pub async fn device_record(&self, device_id: &DeviceId) -> Option<DeviceRecord> {
        self.inner.registry.lock().await.get(device_id).cloned()
    }

    /// Depth of a device's task queue
    pub async fn queue_size(&self, device_id: &DeviceId) -> usize {
        self.inner.queues.queue_size(device_id).await
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        for entry in self.links.iter() {
            entry.value().router.abort();
        }
    }
}

// ----------------------------------------------------------------------------
// Connection Lifecycle
// ----------------------------------------------------------------------------

impl ManagerInner {
    async fn connect_device(&self, device_id: &DeviceId, is_reconnection: bool) -> Result<bool> {
        // One live transport per device: replace, never stack
        if self.links.contains_key(device_id) {
            self.teardown(device_id).await;
        }

        let (url, capabilities) = {
            let mut registry = self.registry.lock().await;
            let record =
                registry
                    .get(device_id)
                    .ok_or_else(|| ConstellationError::NotRegistered {
                        device_id: device_id.clone(),
                    })?;
            let url = record.server_url.clone();
            let capabilities: Vec<String> = record.capabilities.iter().cloned().collect();
            if !is_reconnection {
                registry.increment_connection_attempts(device_id);
            }
            registry.update_status(device_id, DeviceStatus::Connecting);
            (url, capabilities)
        };

        let transport = match self.connector.connect(&url).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!(device = %device_id, url = %url, error = %e, "connection failed");
                self.note_connect_failure(device_id, is_reconnection).await;
                return Ok(false);
            }
        };

        self.registry
            .lock()
            .await
            .update_status(device_id, DeviceStatus::Registering);

        // Arm the ack signal and start the receive loop BEFORE sending
        // REGISTER; the ack is delivered asynchronously through the router
        // and would be lost if the loop were not polling yet
        let ack = self.registration.begin(device_id);
        let router = spawn_router(RouterContext {
            device_id: device_id.clone(),
            transport: transport.clone(),
            pending: self.pending.clone(),
            registration: self.registration.clone(),
            registry: self.registry.clone(),
            disconnects: self.disconnect_tx.clone(),
        });
        self.links.insert(
            device_id.clone(),
            DeviceLink {
                transport: transport.clone(),
                router,
            },
        );
        tokio::task::yield_now().await;

        let register =
            Envelope::register(&self.config.constellation_id, device_id, capabilities);
        let sent = match register.encode() {
            Ok(frame) => transport.send(frame).await.map_err(ConstellationError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!(device = %device_id, error = %e, "failed to send registration");
            self.teardown(device_id).await;
            self.note_connect_failure(device_id, is_reconnection).await;
            return Ok(false);
        }

        let accepted = matches!(timeout(self.config.register_timeout, ack).await, Ok(Ok(true)));
        if !accepted {
            warn!(device = %device_id, "registration not acknowledged");
            self.teardown(device_id).await;
            self.note_connect_failure(device_id, is_reconnection).await;
            return Ok(false);
        }

        self.registry
            .lock()
            .await
            .update_status(device_id, DeviceStatus::Connected);

        // Best-effort: a device that cannot describe itself still connects
        match self
            .request_device_info(device_id, self.config.device_info_timeout)
            .await
        {
            Ok(info) => {
                self.registry
                    .lock()
                    .await
                    .merge_device_info(device_id, &info);
            }
            Err(e) => debug!(device = %device_id, error = %e, "device info unavailable"),
        }

        self.heartbeats.start(device_id, transport.clone());
        {
            let mut registry = self.registry.lock().await;
            registry.update_status(device_id, DeviceStatus::Idle);
            registry.reset_connection_attempts(device_id);
        }
        info!(device = %device_id, reconnection = is_reconnection, "device connected");
        Ok(true)
    }

    /// Shared cleanup for manual disconnects, detected disconnects, and
    /// failed connection attempts. Returns whether a live link existed, so
    /// stale disconnect notifications become no-ops.
    async fn teardown(&self, device_id: &DeviceId) -> bool {
        let removed = self.links.remove(device_id);
        let existed = removed.is_some();
        if let Some((_, link)) = removed {
            link.router.abort();
            link.transport.close().await;
        }

        self.pending.cancel_for_device(device_id);
        self.heartbeats.stop(device_id);
        self.registration.clear(device_id);

        let mut registry = self.registry.lock().await;
        if registry.contains(device_id) {
            registry.update_status(device_id, DeviceStatus::Disconnected);
        }
        existed
    }

    async fn note_connect_failure(&self, device_id: &DeviceId, is_reconnection: bool) {
        let mut registry = self.registry.lock().await;
        let Some(record) = registry.get(device_id) else {
            return;
        };
        let attempts = record.connection_attempts;
        let budget = record.max_retries;

        if !is_reconnection && attempts >= budget {
            warn!(device = %device_id, attempts, budget, "connection budget exhausted");
            registry.update_status(device_id, DeviceStatus::Failed);
        } else {
            registry.update_status(device_id, DeviceStatus::Disconnected);
        }
    }

    /// Recovery path for router-detected disconnects
    async fn handle_disconnect(&self, device_id: DeviceId) {
        // A notification can outlive its link: the device may have been
        // reconnected (fresh healthy link) before this event was processed
        if let Some(link) = self.links.get(&device_id) {
            if link.transport.is_connected() {
                debug!(device = %device_id, "ignoring stale disconnect notification");
                return;
            }
        }
        if !self.teardown(&device_id).await {
            // A manual disconnect or replacement already cleaned up
            return;
        }
        warn!(device = %device_id, "device disconnected, pending work cancelled");

        let budget = {
            let registry = self.registry.lock().await;
            registry.get(&device_id).map(|r| r.max_retries)
        };
        let Some(budget) = budget else {
            return;
        };

        for attempt in 1..=budget {
            sleep(self.config.reconnect_delay).await;
            info!(device = %device_id, attempt, budget, "attempting reconnection");
            match self.connect_device(&device_id, true).await {
                Ok(true) => {
                    info!(device = %device_id, attempt, "reconnected");
                    return;
                }
                Ok(false) => continue,
                // Device was removed while we were retrying
                Err(_) => return,
            }
        }

        warn!(device = %device_id, budget, "reconnection attempts exhausted");
        self.registry
            .lock()
            .await
            .update_status(&device_id, DeviceStatus::Failed);
    }
}

// ----------------------------------------------------------------------------
// Request/Response Exchanges
// ----------------------------------------------------------------------------

impl ManagerInner {
    fn transport_for(&self, device_id: &DeviceId) -> Result<Arc<dyn Transport>> {
        self.links
            .get(device_id)
            .map(|link| link.transport.clone())
            .ok_or_else(|| ConstellationError::NotConnected {
                device_id: device_id.clone(),
            })
    }

    async fn send_task_to_device(&self, task: &TaskRequest) -> Result<TaskResponse> {
        let device_id = &task.device_id;
        let transport = self.transport_for(device_id)?;

        let correlation_id =
            task_correlation_id(&self.config.constellation_id, &task.task_id);
        let handle = self.pending.insert_task(&correlation_id, device_id.clone());

        let metadata = if task.metadata.is_empty() {
            None
        } else {
            Some(task.metadata.clone())
        };
        let envelope = Envelope::task(
            &self.config.constellation_id,
            device_id,
            &correlation_id,
            &task.task_name,
            task.request.clone(),
            metadata,
        );

        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(e) => {
                self.pending.remove_task(&correlation_id);
                return Err(e);
            }
        };
        if let Err(e) = transport.send(frame).await {
            self.pending.remove_task(&correlation_id);
            return Err(e.into());
        }
        debug!(device = %device_id, task = %task.task_id, correlation_id = %correlation_id, "task sent");

        match timeout(task.timeout, handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ConstellationError::Execution {
                reason: "completion handle dropped without a response".to_string(),
            }),
            Err(_) => {
                self.pending.remove_task(&correlation_id);
                Err(ConstellationError::TaskTimeout {
                    task_id: task.task_id.clone(),
                    timeout: task.timeout,
                })
            }
        }
    }

    async fn request_device_info(
        &self,
        device_id: &DeviceId,
        wait: Duration,
    ) -> Result<DeviceInfo> {
        let transport = self.transport_for(device_id)?;

        let request_id = Uuid::new_v4().to_string();
        let handle = self
            .pending
            .insert_device_info(&request_id, device_id.clone());

        let envelope =
            Envelope::device_info_request(&self.config.constellation_id, device_id, &request_id);
        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(e) => {
                self.pending.remove_device_info(&request_id);
                return Err(e);
            }
        };
        if let Err(e) = transport.send(frame).await {
            self.pending.remove_device_info(&request_id);
            return Err(e.into());
        }

        match timeout(wait, handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ConstellationError::Execution {
                reason: "device info handle dropped without a response".to_string(),
            }),
            Err(_) => {
                self.pending.remove_device_info(&request_id);
                Err(ConstellationError::DeviceInfoTimeout {
                    device_id: device_id.clone(),
                })
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Dispatch Execution
// ----------------------------------------------------------------------------

impl ManagerInner {
    /// Execute one task against its device and report a structured outcome,
    /// never an exception: the drain loop must survive individual failures.
    async fn execute_now(&self, task: &TaskRequest) -> ExecutionResult {
        match self.send_task_to_device(task).await {
            Ok(response) => {
                if response.is_success() {
                    ExecutionResult::success(task.task_id.clone(), &task.device_id, response.result)
                } else {
                    let error = response
                        .error
                        .unwrap_or_else(|| "task reported failure".to_string());
                    let mut result =
                        ExecutionResult::failure(task.task_id.clone(), &task.device_id, error);
                    result.result = response.result;
                    result
                }
            }
            Err(e) => {
                debug!(device = %task.device_id, task = %task.task_id, error = %e, "task failed");
                ExecutionResult::from_error(task.task_id.clone(), &task.device_id, &e)
            }
        }
    }

    /// Drain the device's queue after an immediate execution finished. Each
    /// queued task runs through the same path; a failing task never stops
    /// its successors.
    fn spawn_drain(self: Arc<Self>, device_id: DeviceId, mut finished: TaskId) {
        tokio::spawn(async move {
            loop {
                match self
                    .queues
                    .after_completion(&self.registry, &device_id, &finished)
                    .await
                {
                    NextStep::Run(queued) => {
                        finished = queued.task.task_id.clone();
                        let result = self.execute_now(&queued.task).await;
                        let _ = queued.done.send(result);
                    }
                    NextStep::FailAll(abandoned) => {
                        for queued in abandoned {
                            let err = ConstellationError::DeviceDisconnected {
                                device_id: device_id.clone(),
                            };
                            let result = ExecutionResult::from_error(
                                queued.task.task_id.clone(),
                                &device_id,
                                &err,
                            );
                            let _ = queued.done.send(result);
                        }
                        break;
                    }
                    NextStep::Done => break,
                }
            }
        });
    }
}

