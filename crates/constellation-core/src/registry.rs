//! Device registry for the constellation control plane
//!
//! The registry is the single source of truth for device state. It is a pure
//! in-memory map with synchronous transitions and no I/O; the runtime crate
//! wraps it in a lock and is responsible for calling transitions at the right
//! points of the connection lifecycle.
//!
//! No operation here blocks or fails. Lookups on unknown device ids return
//! `None` and callers turn that into a user-facing error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::types::{DeviceId, DeviceStatus, TaskId};

// ----------------------------------------------------------------------------
// Device Info
// ----------------------------------------------------------------------------

/// Capability and metadata payload reported by a device agent.
///
/// Decoded leniently: absent or oddly-typed fields are skipped rather than
/// failing the whole response, since device info is best-effort.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default)]
    pub os: Option<String>,

    #[serde(default, alias = "features")]
    pub capabilities: Vec<String>,

    #[serde(default)]
    pub system_info: BTreeMap<String, Value>,

    #[serde(default)]
    pub custom_metadata: BTreeMap<String, Value>,

    #[serde(default)]
    pub tags: BTreeMap<String, Value>,
}

impl DeviceInfo {
    /// Decode from an opaque JSON result value, tolerating unknown fields
    /// and non-object payloads.
    pub fn from_value(value: &Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }
}

// ----------------------------------------------------------------------------
// Device Record
// ----------------------------------------------------------------------------

/// Authoritative state for one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: DeviceId,
    pub server_url: String,
    pub os: Option<String>,
    /// Union-merged over time; never shrinks implicitly
    pub capabilities: BTreeSet<String>,
    /// Open string-keyed map; nested sub-maps are merged in, not replaced
    pub metadata: BTreeMap<String, Value>,
    pub status: DeviceStatus,
    /// Updated only on a received heartbeat ack
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Incremented by every fresh connect, reset to 0 on any successful
    /// (re)connect; reconnection attempts do not increment it
    pub connection_attempts: u32,
    /// Per-device retry budget
    pub max_retries: u32,
    /// Set exactly while BUSY
    pub current_task_id: Option<TaskId>,
}

impl DeviceRecord {
    /// Create a fresh record in DISCONNECTED state
    pub fn new(
        device_id: DeviceId,
        server_url: impl Into<String>,
        capabilities: Vec<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            device_id,
            server_url: server_url.into(),
            os: None,
            capabilities: capabilities.into_iter().collect(),
            metadata: BTreeMap::new(),
            status: DeviceStatus::Disconnected,
            last_heartbeat: None,
            connection_attempts: 0,
            max_retries,
            current_task_id: None,
        }
    }

    /// Union-merge reported info into this record.
    ///
    /// Capabilities only grow; `system_info`, `custom_metadata`, and `tags`
    /// land as sub-maps whose existing keys survive unless the report
    /// overwrites them individually.
    pub fn merge_device_info(&mut self, info: &DeviceInfo) {
        if let Some(os) = &info.os {
            self.os = Some(os.clone());
        }
        self.capabilities
            .extend(info.capabilities.iter().cloned());

        merge_submap(&mut self.metadata, "system_info", &info.system_info);
        merge_submap(&mut self.metadata, "custom_metadata", &info.custom_metadata);
        merge_submap(&mut self.metadata, "tags", &info.tags);
    }
}

/// Merge `incoming` into `metadata[key]` key-by-key, preserving existing
/// entries that the report does not mention.
fn merge_submap(
    metadata: &mut BTreeMap<String, Value>,
    key: &str,
    incoming: &BTreeMap<String, Value>,
) {
    if incoming.is_empty() {
        return;
    }
    let slot = metadata
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if !slot.is_object() {
        // A scalar landed here earlier; promote to a map so merges keep working
        *slot = Value::Object(serde_json::Map::new());
    }
    if let Some(map) = slot.as_object_mut() {
        for (k, v) in incoming {
            map.insert(k.clone(), v.clone());
        }
    }
}

// ----------------------------------------------------------------------------
// Device Registry
// ----------------------------------------------------------------------------

/// Pure in-memory store of all known devices
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, DeviceRecord>,
}

impl DeviceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new device record. Callers register once; a second call
    /// for the same id replaces the record.
    pub fn register(&mut self, record: DeviceRecord) {
        self.devices.insert(record.device_id.clone(), record);
    }

    /// Look up a device record
    pub fn get(&self, device_id: &DeviceId) -> Option<&DeviceRecord> {
        self.devices.get(device_id)
    }

    /// Look up a device record mutably
    pub fn get_mut(&mut self, device_id: &DeviceId) -> Option<&mut DeviceRecord> {
        self.devices.get_mut(device_id)
    }

    /// Whether a device id is known
    pub fn contains(&self, device_id: &DeviceId) -> bool {
        self.devices.contains_key(device_id)
    }

    /// List device records, optionally only those with a live transport
    pub fn list(&self, connected_only: bool) -> Vec<&DeviceRecord> {
        self.devices
            .values()
            .filter(|d| !connected_only || d.status.is_connected())
            .collect()
    }

    /// Update a device's lifecycle status. Leaving BUSY through any path
    /// clears the current task so the invariant "current_task_id set exactly
    /// while BUSY" holds.
    pub fn update_status(&mut self, device_id: &DeviceId, status: DeviceStatus) -> bool {
        match self.devices.get_mut(device_id) {
            Some(record) => {
                if status != DeviceStatus::Busy {
                    record.current_task_id = None;
                }
                record.status = status;
                true
            }
            None => false,
        }
    }

    /// Mark a device BUSY with the given task
    pub fn set_busy(&mut self, device_id: &DeviceId, task_id: TaskId) -> bool {
        match self.devices.get_mut(device_id) {
            Some(record) => {
                record.status = DeviceStatus::Busy;
                record.current_task_id = Some(task_id);
                true
            }
            None => false,
        }
    }

    /// Return a device to IDLE, clearing its current task
    pub fn set_idle(&mut self, device_id: &DeviceId) -> bool {
        self.update_status(device_id, DeviceStatus::Idle)
    }

    /// Whether a device is currently executing a task
    pub fn is_busy(&self, device_id: &DeviceId) -> bool {
        self.devices
            .get(device_id)
            .map(|d| d.status == DeviceStatus::Busy)
            .unwrap_or(false)
    }

    /// The task a device is currently executing, if any
    pub fn current_task(&self, device_id: &DeviceId) -> Option<TaskId> {
        self.devices
            .get(device_id)
            .and_then(|d| d.current_task_id.clone())
    }

    /// Count one fresh connection attempt and return the new total
    pub fn increment_connection_attempts(&mut self, device_id: &DeviceId) -> Option<u32> {
        self.devices.get_mut(device_id).map(|record| {
            record.connection_attempts += 1;
            record.connection_attempts
        })
    }

    /// Reset the attempt counter after a successful (re)connect
    pub fn reset_connection_attempts(&mut self, device_id: &DeviceId) -> bool {
        match self.devices.get_mut(device_id) {
            Some(record) => {
                record.connection_attempts = 0;
                true
            }
            None => false,
        }
    }

    /// Record a received heartbeat ack
    pub fn update_heartbeat(&mut self, device_id: &DeviceId) -> bool {
        match self.devices.get_mut(device_id) {
            Some(record) => {
                record.last_heartbeat = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    /// Union-merge reported device info into the record
    pub fn merge_device_info(&mut self, device_id: &DeviceId, info: &DeviceInfo) -> bool {
        match self.devices.get_mut(device_id) {
            Some(record) => {
                record.merge_device_info(info);
                true
            }
            None => false,
        }
    }

    /// Explicitly remove a device record (not part of the steady-state
    /// protocol)
    pub fn remove(&mut self, device_id: &DeviceId) -> Option<DeviceRecord> {
        self.devices.remove(device_id)
    }

    /// Number of known devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str) -> DeviceRecord {
        DeviceRecord::new(DeviceId::new(id), "ws://localhost:8765", vec![], 3)
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = DeviceRegistry::new();
        registry.register(record("d1"));

        assert!(registry.contains(&DeviceId::new("d1")));
        assert_eq!(
            registry.get(&DeviceId::new("d1")).unwrap().status,
            DeviceStatus::Disconnected
        );
        assert!(registry.get(&DeviceId::new("missing")).is_none());
    }

    #[test]
    fn test_busy_idle_cycle_tracks_current_task() {
        let mut registry = DeviceRegistry::new();
        registry.register(record("d1"));
        let id = DeviceId::new("d1");

        assert!(!registry.is_busy(&id));
        registry.set_busy(&id, TaskId::new("t1"));
        assert!(registry.is_busy(&id));
        assert_eq!(registry.current_task(&id), Some(TaskId::new("t1")));

        registry.set_idle(&id);
        assert!(!registry.is_busy(&id));
        assert_eq!(registry.current_task(&id), None);
    }

    #[test]
    fn test_status_change_away_from_busy_clears_task() {
        let mut registry = DeviceRegistry::new();
        registry.register(record("d1"));
        let id = DeviceId::new("d1");

        registry.set_busy(&id, TaskId::new("t1"));
        registry.update_status(&id, DeviceStatus::Disconnected);
        assert_eq!(registry.current_task(&id), None);
    }

    #[test]
    fn test_connection_attempt_accounting() {
        let mut registry = DeviceRegistry::new();
        registry.register(record("d1"));
        let id = DeviceId::new("d1");

        assert_eq!(registry.increment_connection_attempts(&id), Some(1));
        assert_eq!(registry.increment_connection_attempts(&id), Some(2));
        registry.reset_connection_attempts(&id);
        assert_eq!(registry.get(&id).unwrap().connection_attempts, 0);
        assert_eq!(registry.increment_connection_attempts(&DeviceId::new("nope")), None);
    }

    #[test]
    fn test_list_connected_only() {
        let mut registry = DeviceRegistry::new();
        registry.register(record("d1"));
        registry.register(record("d2"));
        registry.update_status(&DeviceId::new("d2"), DeviceStatus::Idle);

        assert_eq!(registry.list(false).len(), 2);
        let connected = registry.list(true);
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].device_id, DeviceId::new("d2"));
    }

    #[test]
    fn test_capabilities_union_merge() {
        let mut rec = DeviceRecord::new(
            DeviceId::new("d1"),
            "ws://x",
            vec!["ui".to_string()],
            3,
        );

        let info = DeviceInfo {
            os: Some("android".to_string()),
            capabilities: vec!["shell".to_string(), "ui".to_string()],
            ..Default::default()
        };
        rec.merge_device_info(&info);

        assert_eq!(rec.os.as_deref(), Some("android"));
        assert_eq!(rec.capabilities.len(), 2);

        // A later report with fewer capabilities must not shrink the set
        let smaller = DeviceInfo::default();
        rec.merge_device_info(&smaller);
        assert_eq!(rec.capabilities.len(), 2);
    }

    #[test]
    fn test_metadata_submaps_merge_not_replace() {
        let mut rec = record("d1");

        let mut first = DeviceInfo::default();
        first.system_info.insert("cpu".into(), json!("arm64"));
        first.tags.insert("rack".into(), json!("a"));
        rec.merge_device_info(&first);

        let mut second = DeviceInfo::default();
        second.system_info.insert("ram".into(), json!("8gb"));
        rec.merge_device_info(&second);

        let system = rec.metadata["system_info"].as_object().unwrap();
        assert_eq!(system["cpu"], json!("arm64"));
        assert_eq!(system["ram"], json!("8gb"));
        assert_eq!(rec.metadata["tags"]["rack"], json!("a"));
    }

    #[test]
    fn test_device_info_lenient_decode() {
        let value = json!({
            "os": "linux",
            "features": ["camera"],
            "unexpected": {"x": 1}
        });
        let info = DeviceInfo::from_value(&value).unwrap();
        assert_eq!(info.os.as_deref(), Some("linux"));
        assert_eq!(info.capabilities, vec!["camera".to_string()]);

        assert!(DeviceInfo::from_value(&json!("not an object")).is_none());
    }

    #[test]
    fn test_remove_device() {
        let mut registry = DeviceRegistry::new();
        registry.register(record("d1"));
        assert!(registry.remove(&DeviceId::new("d1")).is_some());
        assert!(registry.is_empty());
        assert!(registry.remove(&DeviceId::new("d1")).is_none());
    }
}
