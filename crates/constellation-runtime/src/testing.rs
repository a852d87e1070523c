//! In-memory transport stubs for tests
//!
//! `stub_link` builds a channel-backed transport pair: the constellation side
//! implements [`Transport`], the far side is a [`StubDevice`] the test drives
//! as if it were the device agent. [`StubConnector`] plugs the pairs into the
//! manager through the [`Connector`] seam, and [`spawn_agent`] runs a
//! scripted agent over a `StubDevice` for happy-path tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use constellation_core::{Envelope, MessageStatus, MessageType, TransportError};

use crate::transport::{Connector, Transport};

// ----------------------------------------------------------------------------
// Stub Transport
// ----------------------------------------------------------------------------

/// Constellation half of an in-memory link
pub struct StubTransport {
    to_device: mpsc::UnboundedSender<String>,
    from_device: Mutex<mpsc::UnboundedReceiver<String>>,
    connected: Arc<AtomicBool>,
    closed: Notify,
}

#[async_trait]
impl Transport for StubTransport {
    async fn send(&self, text: String) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.to_device.send(text).map_err(|_| {
            self.connected.store(false, Ordering::SeqCst);
            TransportError::SendFailed {
                reason: "peer endpoint dropped".to_string(),
            }
        })
    }

    async fn receive(&self) -> Result<String, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        let mut from_device = self.from_device.lock().await;
        tokio::select! {
            frame = from_device.recv() => match frame {
                Some(frame) => Ok(frame),
                None => {
                    self.connected.store(false, Ordering::SeqCst);
                    Err(TransportError::Closed)
                }
            },
            // notify_one stores a permit, so a close that lands before this
            // receive is polled still wakes it
            _ = self.closed.notified() => Err(TransportError::Closed),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.notify_one();
    }
}

// ----------------------------------------------------------------------------
// Stub Device
// ----------------------------------------------------------------------------

/// Far end of an in-memory link, driven by the test as the device agent
pub struct StubDevice {
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
}

impl StubDevice {
    /// Receive the next frame sent by the constellation, decoded. `None`
    /// once the constellation side is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let frame = self.incoming.recv().await?;
            match Envelope::decode(&frame) {
                Ok(envelope) => return Some(envelope),
                Err(_) => continue,
            }
        }
    }

    /// Receive frames until one of the given type arrives (skipping
    /// heartbeats and anything else in between)
    pub async fn recv_type(&mut self, message_type: MessageType) -> Option<Envelope> {
        loop {
            let envelope = self.recv().await?;
            if envelope.message_type == message_type {
                return Some(envelope);
            }
        }
    }

    /// Inject a server frame into the constellation's receive loop
    pub fn send(&self, envelope: &Envelope) {
        if let Ok(frame) = envelope.encode() {
            let _ = self.outgoing.send(frame);
        }
    }

    /// Inject an arbitrary text frame, malformed ones included
    pub fn send_raw(&self, frame: &str) {
        let _ = self.outgoing.send(frame.to_string());
    }

    /// Reply with the implicit registration ack (HEARTBEAT, status OK)
    pub fn ack_registration(&self) {
        let mut reply = Envelope::new(MessageType::Heartbeat);
        reply.status = Some(MessageStatus::Ok);
        self.send(&reply);
    }

    /// Reply to a TASK frame with a TASK_END carrying the given outcome
    pub fn finish_task(&self, task: &Envelope, outcome: Result<Value, String>) {
        let mut reply = Envelope::new(MessageType::TaskEnd);
        reply.response_id = task.session_id.clone();
        match outcome {
            Ok(result) => {
                reply.status = Some(MessageStatus::Completed);
                reply.result = Some(result);
            }
            Err(error) => {
                reply.status = Some(MessageStatus::Failed);
                reply.error = Some(error);
            }
        }
        self.send(&reply);
    }

    /// Whether the link is still up from the device's point of view
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Tear the link down as a network failure would: the constellation's
    /// receive loop observes a close
    pub fn drop_connection(self) {
        self.connected.store(false, Ordering::SeqCst);
        // Dropping self drops the outgoing sender; the constellation's
        // receive returns Closed
    }
}

/// Build a connected in-memory link
pub fn stub_link() -> (Arc<StubTransport>, StubDevice) {
    let (to_device_tx, to_device_rx) = mpsc::unbounded_channel();
    let (from_device_tx, from_device_rx) = mpsc::unbounded_channel();
    let connected = Arc::new(AtomicBool::new(true));

    let transport = Arc::new(StubTransport {
        to_device: to_device_tx,
        from_device: Mutex::new(from_device_rx),
        connected: connected.clone(),
        closed: Notify::new(),
    });
    let device = StubDevice {
        incoming: to_device_rx,
        outgoing: from_device_tx,
        connected,
    };
    (transport, device)
}

// ----------------------------------------------------------------------------
// Stub Connector
// ----------------------------------------------------------------------------

/// Scripted outcome for one `connect` call
pub enum StubPlan {
    /// Fail the dial
    Refuse,
    /// Open a fresh in-memory link and hand its device end to the test
    Accept,
}

/// Scripted [`Connector`]: each `connect` call consumes the next plan; an
/// empty plan queue refuses, so reconnection-exhaustion tests need no setup.
pub struct StubConnector {
    plan: StdMutex<std::collections::VecDeque<StubPlan>>,
    endpoints: mpsc::UnboundedSender<StubDevice>,
    attempts: AtomicU32,
}

impl StubConnector {
    /// Create the connector and the stream of device endpoints it produces
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<StubDevice>) {
        let (endpoints, endpoint_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            plan: StdMutex::new(std::collections::VecDeque::new()),
            endpoints,
            attempts: AtomicU32::new(0),
        });
        (connector, endpoint_rx)
    }

    /// Queue one planned outcome
    pub fn queue(&self, plan: StubPlan) {
        self.plan.lock().expect("plan lock").push_back(plan);
    }

    /// Queue `n` accepting outcomes
    pub fn queue_accepts(&self, n: usize) {
        for _ in 0..n {
            self.queue(StubPlan::Accept);
        }
    }

    /// Total `connect` calls observed
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for StubConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Transport>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let plan = self
            .plan
            .lock()
            .expect("plan lock")
            .pop_front()
            .unwrap_or(StubPlan::Refuse);

        match plan {
            StubPlan::Refuse => Err(TransportError::ConnectFailed {
                url: url.to_string(),
                reason: "refused by stub plan".to_string(),
            }),
            StubPlan::Accept => {
                let (transport, device) = stub_link();
                self.endpoints
                    .send(device)
                    .map_err(|_| TransportError::ConnectFailed {
                        url: url.to_string(),
                        reason: "no endpoint consumer".to_string(),
                    })?;
                Ok(transport)
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Scripted Agent
// ----------------------------------------------------------------------------

/// Behavior knobs for [`spawn_agent`]
#[derive(Clone, Default)]
pub struct AgentOptions {
    /// Payload for DEVICE_INFO_RESPONSE frames; `None` leaves requests
    /// unanswered so the best-effort info fetch times out
    pub device_info: Option<Value>,
    /// Simulated execution time per task
    pub task_delay: Duration,
    /// Task names that fail with a scripted error
    pub fail_task_names: HashSet<String>,
    /// Start-order log of task names, shared with the test
    pub started: Option<Arc<StdMutex<Vec<String>>>>,
}

/// Run a scripted device agent over a stub link: acks registration, answers
/// heartbeats and info requests, and completes tasks by echoing the request
/// payload.
pub fn spawn_agent(mut device: StubDevice, opts: AgentOptions) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(envelope) = device.recv().await {
            match envelope.message_type {
                MessageType::Register | MessageType::Heartbeat => {
                    device.ack_registration();
                }
                MessageType::DeviceInfoRequest => {
                    if let Some(info) = &opts.device_info {
                        let mut reply = Envelope::new(MessageType::DeviceInfoResponse);
                        reply.response_id = envelope.request_id.clone();
                        reply.result = Some(info.clone());
                        device.send(&reply);
                    }
                }
                MessageType::Task => {
                    let name = envelope.task_name.clone().unwrap_or_default();
                    if let Some(log) = &opts.started {
                        log.lock().expect("start log lock").push(name.clone());
                    }
                    if !opts.task_delay.is_zero() {
                        sleep(opts.task_delay).await;
                    }
                    let outcome = if opts.fail_task_names.contains(&name) {
                        Err(format!("scripted failure for {}", name))
                    } else {
                        Ok(envelope.request.clone().unwrap_or(Value::Null))
                    };
                    device.finish_task(&envelope, outcome);
                }
                _ => {}
            }
        }
    })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stub_link_roundtrip() {
        let (transport, mut device) = stub_link();

        transport
            .send(Envelope::new(MessageType::Command).encode().unwrap())
            .await
            .unwrap();
        let received = device.recv().await.unwrap();
        assert_eq!(received.message_type, MessageType::Command);

        device.ack_registration();
        let frame = transport.receive().await.unwrap();
        let envelope = Envelope::decode(&frame).unwrap();
        assert_eq!(envelope.message_type, MessageType::Heartbeat);
    }

    #[tokio::test]
    async fn test_drop_connection_closes_receive() {
        let (transport, device) = stub_link();
        device.drop_connection();

        let err = transport.receive().await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_receive() {
        let (transport, _device) = stub_link();
        let receiver = transport.clone();
        let pending = tokio::spawn(async move { receiver.receive().await });

        tokio::task::yield_now().await;
        transport.close().await;
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_connector_defaults_to_refuse() {
        let (connector, _endpoints) = StubConnector::new();
        assert!(connector.connect("ws://x").await.is_err());
        connector.queue(StubPlan::Accept);
        assert!(connector.connect("ws://x").await.is_ok());
        assert_eq!(connector.attempts(), 2);
    }
}
