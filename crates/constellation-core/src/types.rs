//! Core types for the constellation control plane
//!
//! This module defines the fundamental identifiers used throughout the
//! protocol, using newtype patterns for semantic validation and type safety.

use core::fmt;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Device Identifier
// ----------------------------------------------------------------------------

/// Stable identity of a remote worker device (unique key in the registry)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a new DeviceId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ----------------------------------------------------------------------------
// Task Identifier
// ----------------------------------------------------------------------------

/// Identifier of a single unit of work dispatched to a device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Create a new TaskId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random TaskId
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ----------------------------------------------------------------------------
// Device Status
// ----------------------------------------------------------------------------

/// Lifecycle status of a device as tracked by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    /// No live transport
    Disconnected,
    /// Transport dial in progress
    Connecting,
    /// Transport open, registration handshake in flight
    Registering,
    /// Registered but not yet ready for tasks
    Connected,
    /// Ready to accept a task
    Idle,
    /// Exactly one task in flight
    Busy,
    /// Reconnection budget exhausted (terminal until explicit reconnect)
    Failed,
}

impl DeviceStatus {
    /// Whether the device currently has a usable transport
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Idle | Self::Busy)
    }

    /// Whether the device can accept a new in-flight task right now
    pub fn is_available(self) -> bool {
        matches!(self, Self::Idle)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Registering => "REGISTERING",
            Self::Connected => "CONNECTED",
            Self::Idle => "IDLE",
            Self::Busy => "BUSY",
            Self::Failed => "FAILED",
        };
        write!(f, "{}", name)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
