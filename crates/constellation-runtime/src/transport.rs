//! Transport abstraction for the constellation control plane
//!
//! One bidirectional byte-stream connection per device. The [`Transport`]
//! trait is the seam between the runtime and the wire; [`WsTransport`] is the
//! production WebSocket implementation, and the stub transport in
//! [`crate::testing`] is the in-memory one used by tests.
//!
//! All operations suspend the caller, never the process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::error::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use constellation_core::TransportError;

// ----------------------------------------------------------------------------
// Transport Trait
// ----------------------------------------------------------------------------

/// Unified transport interface for device connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one text frame
    async fn send(&self, text: String) -> Result<(), TransportError>;

    /// Receive the next text frame; returns `Closed` once the peer is gone
    async fn receive(&self) -> Result<String, TransportError>;

    /// Liveness flag; flips to false on close or transport failure
    fn is_connected(&self) -> bool;

    /// Close the connection. Idempotent.
    async fn close(&self);
}

/// Factory seam for opening transports, so the reconnection supervisor and
/// the tests share one code path
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Transport>, TransportError>;
}

// ----------------------------------------------------------------------------
// WebSocket Transport
// ----------------------------------------------------------------------------

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// WebSocket transport over tokio-tungstenite.
///
/// Sink and stream halves live behind independent mutexes so one task can
/// block in `receive` while heartbeat and dispatch tasks send concurrently.
pub struct WsTransport {
    sink: Mutex<WsSink>,
    source: Mutex<WsSource>,
    connected: AtomicBool,
}

impl WsTransport {
    fn new(sink: WsSink, source: WsSource) -> Self {
        Self {
            sink: Mutex::new(sink),
            source: Mutex::new(source),
            connected: AtomicBool::new(true),
        }
    }

    fn mark_closed(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, text: String) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text)).await.map_err(|e| {
            self.mark_closed();
            match e {
                WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
                other => TransportError::SendFailed {
                    reason: other.to_string(),
                },
            }
        })
    }

    async fn receive(&self) -> Result<String, TransportError> {
        let mut source = self.source.lock().await;
        loop {
            match source.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Binary(bytes))) => {
                    return Ok(String::from_utf8_lossy(&bytes).into_owned())
                }
                Some(Ok(Message::Close(_))) | None => {
                    self.mark_closed();
                    return Err(TransportError::Closed);
                }
                // Control frames are handled by tungstenite; skip them
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                    self.mark_closed();
                    return Err(TransportError::Closed);
                }
                Some(Err(e)) => {
                    self.mark_closed();
                    return Err(TransportError::ReceiveFailed {
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if !self.is_connected() {
            return;
        }
        self.mark_closed();
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!(error = %e, "websocket close handshake failed");
        }
    }
}

// ----------------------------------------------------------------------------
// WebSocket Connector
// ----------------------------------------------------------------------------

/// Opens `WsTransport` connections with `tokio_tungstenite::connect_async`
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Transport>, TransportError> {
        let (stream, _response) =
            connect_async(url)
                .await
                .map_err(|e| TransportError::ConnectFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
        debug!(url, "websocket connected");
        let (sink, source) = stream.split();
        Ok(Arc::new(WsTransport::new(sink, source)))
    }
}
