//! Task requests and execution results
//!
//! A task is an opaque unit of work shipped to one device. This core never
//! inspects the request payload; it only correlates the response and reports
//! a structured outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::errors::ConstellationError;
use crate::types::{DeviceId, TaskId};

// ----------------------------------------------------------------------------
// Task Request
// ----------------------------------------------------------------------------

/// A unit of work addressed to one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub device_id: DeviceId,
    /// Opaque payload forwarded verbatim to the device agent
    pub request: Value,
    pub task_name: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// Caller-side wait bound for the response
    pub timeout: Duration,
    pub created_at: DateTime<Utc>,
}

impl TaskRequest {
    /// Create a task with a generated id
    pub fn new(
        device_id: DeviceId,
        task_name: impl Into<String>,
        request: Value,
        timeout: Duration,
    ) -> Self {
        Self {
            task_id: TaskId::generate(),
            device_id,
            request,
            task_name: task_name.into(),
            metadata: BTreeMap::new(),
            timeout,
            created_at: Utc::now(),
        }
    }

    /// Override the generated task id
    pub fn with_task_id(mut self, task_id: TaskId) -> Self {
        self.task_id = task_id;
        self
    }

    /// Attach caller metadata
    pub fn with_metadata(mut self, metadata: BTreeMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

// ----------------------------------------------------------------------------
// Execution Result
// ----------------------------------------------------------------------------

/// Structured outcome of a task, successful or not.
///
/// Metadata always carries `device_id`; disconnect- and timeout-class
/// failures additionally carry `disconnected: true` and `error_category` so
/// callers can branch without parsing the error string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: TaskId,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl ExecutionResult {
    /// Successful outcome with the device's opaque result payload
    pub fn success(task_id: TaskId, device_id: &DeviceId, result: Option<Value>) -> Self {
        Self {
            task_id,
            success: true,
            result,
            error: None,
            metadata: base_metadata(device_id),
        }
    }

    /// Failed outcome reported by the device itself
    pub fn failure(task_id: TaskId, device_id: &DeviceId, error: impl Into<String>) -> Self {
        let mut metadata = base_metadata(device_id);
        metadata.insert("error_category".into(), Value::String("execution_error".into()));
        Self {
            task_id,
            success: false,
            result: None,
            error: Some(error.into()),
            metadata,
        }
    }

    /// Failed outcome converted from a control-plane error.
    ///
    /// Stamps `error_type`/`error_category` from the error taxonomy and
    /// `disconnected: true` for disconnect-class failures.
    pub fn from_error(task_id: TaskId, device_id: &DeviceId, err: &ConstellationError) -> Self {
        let mut metadata = base_metadata(device_id);
        metadata.insert(
            "error_category".into(),
            Value::String(err.error_category().into()),
        );
        if err.is_disconnection() {
            metadata.insert("disconnected".into(), Value::Bool(true));
            metadata.insert(
                "error_type".into(),
                Value::String("device_disconnection".into()),
            );
        } else {
            metadata.insert(
                "error_type".into(),
                Value::String(err.error_category().into()),
            );
        }
        metadata.insert("task_id".into(), Value::String(task_id.to_string()));

        Self {
            task_id,
            success: false,
            result: None,
            error: Some(err.to_string()),
            metadata,
        }
    }

    /// Whether this failure was caused by the device's connection going away
    pub fn is_disconnection(&self) -> bool {
        self.metadata
            .get("disconnected")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

fn base_metadata(device_id: &DeviceId) -> BTreeMap<String, Value> {
    let mut metadata = BTreeMap::new();
    metadata.insert("device_id".into(), Value::String(device_id.to_string()));
    metadata
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_carries_device_id() {
        let result = ExecutionResult::success(
            TaskId::new("t1"),
            &DeviceId::new("d1"),
            Some(json!({"screenshot": "…"})),
        );
        assert!(result.success);
        assert_eq!(result.metadata["device_id"], json!("d1"));
        assert!(!result.is_disconnection());
    }

    #[test]
    fn test_disconnect_error_metadata() {
        let err = ConstellationError::DeviceDisconnected {
            device_id: DeviceId::new("d1"),
        };
        let result = ExecutionResult::from_error(TaskId::new("t1"), &DeviceId::new("d1"), &err);

        assert!(!result.success);
        assert!(result.is_disconnection());
        assert_eq!(result.metadata["error_type"], json!("device_disconnection"));
        assert_eq!(result.metadata["error_category"], json!("device_disconnection"));
        assert_eq!(result.metadata["task_id"], json!("t1"));
        assert!(result.error.as_deref().unwrap().contains("d1"));
    }

    #[test]
    fn test_timeout_error_metadata() {
        let err = ConstellationError::TaskTimeout {
            task_id: TaskId::new("t1"),
            timeout: Duration::from_secs(30),
        };
        let result = ExecutionResult::from_error(TaskId::new("t1"), &DeviceId::new("d1"), &err);

        assert_eq!(result.metadata["error_category"], json!("timeout"));
        assert!(!result.is_disconnection());
    }

    #[test]
    fn test_task_request_builder() {
        let task = TaskRequest::new(
            DeviceId::new("d1"),
            "tap_button",
            json!({"x": 10, "y": 20}),
            Duration::from_secs(60),
        )
        .with_task_id(TaskId::new("t-fixed"));

        assert_eq!(task.task_id, TaskId::new("t-fixed"));
        assert_eq!(task.task_name, "tap_button");
        assert_eq!(task.timeout, Duration::from_secs(60));
    }
}
