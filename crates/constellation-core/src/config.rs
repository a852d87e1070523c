//! Configuration for the constellation control plane
//!
//! Serde-derived so the CLI can layer it from a TOML file; `Default` gives
//! sensible values for tests and embedded use.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ----------------------------------------------------------------------------
// Constellation Configuration
// ----------------------------------------------------------------------------

/// Tunable knobs for connection, heartbeat, and dispatch behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstellationConfig {
    /// Identity of this controller, used in `client_id` and correlation ids
    pub constellation_id: String,

    /// Interval between liveness pings per device
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// Fixed delay between automatic reconnection attempts
    #[serde(with = "duration_secs")]
    pub reconnect_delay: Duration,

    /// Default per-device retry budget
    pub max_retries: u32,

    /// Default caller-side wait bound for task responses
    #[serde(with = "duration_secs")]
    pub default_task_timeout: Duration,

    /// Wait bound for the registration ack
    #[serde(with = "duration_secs")]
    pub register_timeout: Duration,

    /// Wait bound for the best-effort device info request
    #[serde(with = "duration_secs")]
    pub device_info_timeout: Duration,
}

impl Default for ConstellationConfig {
    fn default() -> Self {
        Self {
            constellation_id: "constellation".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            max_retries: 3,
            default_task_timeout: Duration::from_secs(300),
            register_timeout: Duration::from_secs(10),
            device_info_timeout: Duration::from_secs(5),
        }
    }
}

impl ConstellationConfig {
    /// Validate configuration values, returning a description of the first
    /// problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.constellation_id.is_empty() {
            return Err("constellation_id must not be empty".to_string());
        }
        if self.constellation_id.contains('@') {
            return Err("constellation_id must not contain '@' (reserved as id separator)"
                .to_string());
        }
        if self.heartbeat_interval.is_zero() {
            return Err("heartbeat_interval must be greater than zero".to_string());
        }
        if self.default_task_timeout.is_zero() {
            return Err("default_task_timeout must be greater than zero".to_string());
        }
        if self.register_timeout.is_zero() {
            return Err("register_timeout must be greater than zero".to_string());
        }
        Ok(())
    }

    /// Configuration tuned for fast tests: short intervals, small budgets
    pub fn testing() -> Self {
        Self {
            constellation_id: "test-constellation".to_string(),
            heartbeat_interval: Duration::from_millis(50),
            reconnect_delay: Duration::from_millis(20),
            max_retries: 3,
            default_task_timeout: Duration::from_secs(5),
            register_timeout: Duration::from_secs(1),
            device_info_timeout: Duration::from_millis(200),
        }
    }
}

// Durations serialize as (possibly fractional) seconds in config files
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        assert!(ConstellationConfig::default().validate().is_ok());
        assert!(ConstellationConfig::testing().validate().is_ok());
    }

    #[test]
    fn test_rejects_reserved_separator() {
        let config = ConstellationConfig {
            constellation_id: "bad@id".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_intervals() {
        let config = ConstellationConfig {
            heartbeat_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip_seconds() {
        let config = ConstellationConfig {
            reconnect_delay: Duration::from_millis(2500),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: ConstellationConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.reconnect_delay, Duration::from_millis(2500));
    }
}
