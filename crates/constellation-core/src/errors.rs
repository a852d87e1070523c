//! Error types for the constellation control plane
//!
//! This module contains the transport-level error type and the main
//! ConstellationError that unifies it with precondition, correlation, and
//! execution failures. Every variant maps to a stable `error_category()`
//! string so callers can branch on failure kind without matching message
//! text.

use crate::types::{DeviceId, TaskId};
use std::time::Duration;

// ----------------------------------------------------------------------------
// Transport Errors
// ----------------------------------------------------------------------------

/// Failures at the byte-stream connection layer
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed to {url}: {reason}")]
    ConnectFailed { url: String, reason: String },

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },

    #[error("Connection closed")]
    Closed,

    #[error("Transport is not connected")]
    NotConnected,
}

// ----------------------------------------------------------------------------
// Constellation Errors
// ----------------------------------------------------------------------------

/// Unified error type for the constellation control plane
#[derive(Debug, thiserror::Error)]
pub enum ConstellationError {
    /// Eager precondition check: the device was never registered
    #[error("Device {device_id} is not registered")]
    NotRegistered { device_id: DeviceId },

    /// Eager precondition check: the device has no live transport
    #[error("Device {device_id} is not connected")]
    NotConnected { device_id: DeviceId },

    /// Transport-level failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The server rejected the registration handshake
    #[error("Registration rejected for device {device_id}: {reason}")]
    RegistrationRejected { device_id: DeviceId, reason: String },

    /// No registration ack arrived within the configured window
    #[error("Registration timed out for device {device_id}")]
    RegistrationTimeout { device_id: DeviceId },

    /// A task response did not arrive within the caller's timeout
    #[error("Task {task_id} timed out after {timeout:?}")]
    TaskTimeout { task_id: TaskId, timeout: Duration },

    /// A device-info response did not arrive within the caller's timeout
    #[error("Device info request to {device_id} timed out")]
    DeviceInfoTimeout { device_id: DeviceId },

    /// The device disconnected while a caller was waiting on it
    #[error("Device {device_id} disconnected while waiting")]
    DeviceDisconnected { device_id: DeviceId },

    /// Wire frame could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other failure from the send/execute path
    #[error("Execution error: {reason}")]
    Execution { reason: String },
}

impl ConstellationError {
    /// Stable discriminator for structured failure metadata.
    ///
    /// Callers branch on this instead of parsing display strings.
    pub fn error_category(&self) -> &'static str {
        match self {
            Self::NotRegistered { .. } => "not_registered",
            Self::NotConnected { .. } => "not_connected",
            Self::Transport(_) => "transport",
            Self::RegistrationRejected { .. } => "registration_rejected",
            Self::RegistrationTimeout { .. } => "registration_timeout",
            Self::TaskTimeout { .. } => "timeout",
            Self::DeviceInfoTimeout { .. } => "timeout",
            Self::DeviceDisconnected { .. } => "device_disconnection",
            Self::Serialization(_) => "serialization",
            Self::Execution { .. } => "execution_error",
        }
    }

    /// Whether this failure means the device's connection is gone.
    ///
    /// Disconnect-class failures carry `disconnected: true` in result
    /// metadata so queued callers can distinguish them from task-level
    /// failures. Send and receive failures count: the transport marks itself
    /// closed when either fails.
    pub fn is_disconnection(&self) -> bool {
        matches!(
            self,
            Self::DeviceDisconnected { .. }
                | Self::NotConnected { .. }
                | Self::Transport(TransportError::Closed)
                | Self::Transport(TransportError::NotConnected)
                | Self::Transport(TransportError::SendFailed { .. })
                | Self::Transport(TransportError::ReceiveFailed { .. })
        )
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let err = ConstellationError::NotRegistered {
            device_id: DeviceId::new("d1"),
        };
        assert_eq!(err.error_category(), "not_registered");

        let err = ConstellationError::DeviceDisconnected {
            device_id: DeviceId::new("d1"),
        };
        assert_eq!(err.error_category(), "device_disconnection");
        assert!(err.is_disconnection());

        let err = ConstellationError::TaskTimeout {
            task_id: TaskId::new("t1"),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(err.error_category(), "timeout");
        assert!(!err.is_disconnection());
    }

    #[test]
    fn test_transport_error_conversion() {
        let err: ConstellationError = TransportError::Closed.into();
        assert_eq!(err.error_category(), "transport");
        assert!(err.is_disconnection());
    }

    #[test]
    fn test_display_names_devices() {
        let err = ConstellationError::NotConnected {
            device_id: DeviceId::new("tablet-3"),
        };
        assert!(err.to_string().contains("tablet-3"));
    }
}
