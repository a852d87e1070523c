//! Wire protocol envelopes for the constellation control plane
//!
//! Messages are JSON-encoded envelopes exchanged over WebSocket text frames.
//! A single [`Envelope`] struct covers both directions; all fields except the
//! message type are optional and omitted from the wire when unset, so frames
//! stay minimal and tolerant of peers that send more than we understand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::errors::ConstellationError;
use crate::types::DeviceId;

// ----------------------------------------------------------------------------
// Message Type and Status
// ----------------------------------------------------------------------------

/// Message type discriminator shared by both directions of the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Register,
    Heartbeat,
    Task,
    DeviceInfoRequest,
    Command,
    TaskEnd,
    Error,
    DeviceInfoResponse,
    /// Any type this build does not know about. Routed to a log line and
    /// ignored so newer servers can speak to older constellations.
    #[serde(other)]
    Unknown,
}

/// Status field carried by heartbeats, task-end frames, and errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageStatus {
    Ok,
    Continue,
    Completed,
    Error,
    Failed,
}

impl MessageStatus {
    /// Whether this status reports a successful outcome
    pub fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::Continue | Self::Completed)
    }
}

/// Role advertised in the `client_type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientType {
    Constellation,
}

// ----------------------------------------------------------------------------
// Envelope
// ----------------------------------------------------------------------------

/// JSON message envelope exchanged with device agents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_type: Option<ClientType>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,

    /// Correlation key for task exchanges
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Correlation key for device-info exchanges
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Server-side echo of the correlation key; preferred over session_id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,

    /// Opaque task payload; this core never inspects its semantics
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, Value>>,
}

impl Envelope {
    /// Bare envelope of the given type with a fresh timestamp and every other
    /// field unset. The typed constructors below cover the client-side
    /// frames; server-side frames (acks, task ends) are built from this.
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            client_id: None,
            client_type: None,
            target_id: None,
            session_id: None,
            request_id: None,
            response_id: None,
            task_name: None,
            request: None,
            status: None,
            result: None,
            error: None,
            timestamp: Some(Utc::now()),
            metadata: None,
        }
    }

    /// Build the one-shot REGISTER handshake message.
    ///
    /// Advertises this constellation's capabilities in metadata so the server
    /// can route work appropriately.
    pub fn register(
        constellation_id: &str,
        device_id: &DeviceId,
        capabilities: Vec<String>,
    ) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "capabilities".to_string(),
            Value::Array(capabilities.into_iter().map(Value::String).collect()),
        );

        let mut env = Self::new(MessageType::Register);
        env.client_id = Some(client_id(constellation_id, device_id));
        env.client_type = Some(ClientType::Constellation);
        env.target_id = Some(device_id.to_string());
        env.metadata = Some(metadata);
        env
    }

    /// Build a periodic liveness HEARTBEAT
    pub fn heartbeat(constellation_id: &str, device_id: &DeviceId) -> Self {
        let mut env = Self::new(MessageType::Heartbeat);
        env.client_id = Some(client_id(constellation_id, device_id));
        env.client_type = Some(ClientType::Constellation);
        env.target_id = Some(device_id.to_string());
        env.status = Some(MessageStatus::Ok);
        env
    }

    /// Build a TASK dispatch frame. `correlation_id` becomes the session id
    /// the device echoes back in its TASK_END.
    pub fn task(
        constellation_id: &str,
        device_id: &DeviceId,
        correlation_id: &str,
        task_name: &str,
        request: Value,
        metadata: Option<BTreeMap<String, Value>>,
    ) -> Self {
        let mut env = Self::new(MessageType::Task);
        env.client_id = Some(client_id(constellation_id, device_id));
        env.client_type = Some(ClientType::Constellation);
        env.target_id = Some(device_id.to_string());
        env.session_id = Some(correlation_id.to_string());
        env.task_name = Some(task_name.to_string());
        env.request = Some(request);
        env.metadata = metadata;
        env
    }

    /// Build a DEVICE_INFO_REQUEST keyed by a generated request id
    pub fn device_info_request(
        constellation_id: &str,
        device_id: &DeviceId,
        request_id: &str,
    ) -> Self {
        let mut env = Self::new(MessageType::DeviceInfoRequest);
        env.client_id = Some(client_id(constellation_id, device_id));
        env.client_type = Some(ClientType::Constellation);
        env.target_id = Some(device_id.to_string());
        env.request_id = Some(request_id.to_string());
        env
    }

    /// Encode to a JSON text frame
    pub fn encode(&self) -> Result<String, ConstellationError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from a JSON text frame
    pub fn decode(text: &str) -> Result<Self, ConstellationError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Correlation id of this frame: an explicit response id when present,
    /// otherwise the session id.
    pub fn correlation_id(&self) -> Option<&str> {
        self.response_id
            .as_deref()
            .or(self.session_id.as_deref())
            .or(self.request_id.as_deref())
    }
}

// ----------------------------------------------------------------------------
// Identifier Conventions
// ----------------------------------------------------------------------------

/// Client id convention: `"{constellation_id}@{device_id}"`
pub fn client_id(constellation_id: &str, device_id: &DeviceId) -> String {
    format!("{}@{}", constellation_id, device_id)
}

/// Task correlation id convention: `"{constellation_id}@{task_id}"`.
///
/// Unique across concurrently in-flight requests to a device as long as task
/// ids are unique, which TaskId::generate guarantees.
pub fn task_correlation_id(constellation_id: &str, task_id: &crate::types::TaskId) -> String {
    format!("{}@{}", constellation_id, task_id)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskId;

    #[test]
    fn test_register_envelope_fields() {
        let device = DeviceId::new("phone-1");
        let env = Envelope::register("const-a", &device, vec!["ui".into(), "shell".into()]);

        assert_eq!(env.message_type, MessageType::Register);
        assert_eq!(env.client_id.as_deref(), Some("const-a@phone-1"));
        assert_eq!(env.client_type, Some(ClientType::Constellation));
        assert_eq!(env.target_id.as_deref(), Some("phone-1"));

        let caps = &env.metadata.as_ref().unwrap()["capabilities"];
        assert_eq!(caps.as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_wire_type_names() {
        let env = Envelope::device_info_request("c", &DeviceId::new("d"), "r-1");
        let json = env.encode().unwrap();
        assert!(json.contains("\"type\":\"DEVICE_INFO_REQUEST\""));
        assert!(json.contains("\"client_type\":\"CONSTELLATION\""));
        // Unset fields must not appear on the wire
        assert!(!json.contains("task_name"));
        assert!(!json.contains("session_id"));
    }

    #[test]
    fn test_unknown_type_decodes() {
        let frame = r#"{"type":"FUTURE_THING","status":"OK"}"#;
        let env = Envelope::decode(frame).unwrap();
        assert_eq!(env.message_type, MessageType::Unknown);
        assert_eq!(env.status, Some(MessageStatus::Ok));
    }

    #[test]
    fn test_correlation_id_prefers_response_id() {
        let frame = r#"{"type":"TASK_END","session_id":"s-1","response_id":"r-1"}"#;
        let env = Envelope::decode(frame).unwrap();
        assert_eq!(env.correlation_id(), Some("r-1"));

        let frame = r#"{"type":"TASK_END","session_id":"s-1"}"#;
        let env = Envelope::decode(frame).unwrap();
        assert_eq!(env.correlation_id(), Some("s-1"));
    }

    #[test]
    fn test_task_correlation_convention() {
        let corr = task_correlation_id("const-a", &TaskId::new("t-9"));
        assert_eq!(corr, "const-a@t-9");
    }

    #[test]
    fn test_heartbeat_roundtrip() {
        let env = Envelope::heartbeat("c", &DeviceId::new("d"));
        let back = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(back.message_type, MessageType::Heartbeat);
        assert_eq!(back.status, Some(MessageStatus::Ok));
        assert!(back.timestamp.is_some());
    }

    #[test]
    fn test_malformed_frame_is_error() {
        assert!(Envelope::decode("not json").is_err());
        assert!(Envelope::decode(r#"{"no_type":true}"#).is_err());
    }
}
