//! Constellation Runtime
//!
//! Tokio-based runtime for the constellation control plane. It coordinates a
//! fleet of remote worker devices over WebSocket: one receive loop and one
//! heartbeat sender per device, request/response correlation through one-shot
//! completion handles, per-device FIFO task dispatch, and automatic bounded
//! reconnection.
//!
//! The [`DeviceManager`] is the single entry point; everything else is the
//! machinery it owns. Tests plug in the in-memory transport from
//! [`testing`] through the [`Connector`] seam.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod dispatch;
pub mod heartbeat;
pub mod manager;
pub mod pending;
pub mod registration;
pub mod router;
pub mod testing;
pub mod transport;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use manager::DeviceManager;
pub use pending::{PendingTables, TaskResponse};
pub use transport::{Connector, Transport, WsConnector, WsTransport};
