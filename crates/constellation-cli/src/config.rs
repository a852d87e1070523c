//! CLI configuration loading
//!
//! The config file is TOML: the `[constellation]` table maps onto
//! [`ConstellationConfig`], and each `[[devices]]` entry describes one
//! device to register. Missing sections fall back to defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;

use constellation_core::ConstellationConfig;

use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// App Configuration
// ----------------------------------------------------------------------------

/// One configured device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub device_id: String,
    pub server_url: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Per-device override of the retry budget
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// Complete configuration for the CLI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub constellation: ConstellationConfig,

    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

impl AppConfig {
    /// Load and validate a TOML configuration file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the loaded configuration
    pub fn validate(&self) -> Result<()> {
        self.constellation.validate().map_err(CliError::Config)?;
        for entry in &self.devices {
            if entry.device_id.is_empty() {
                return Err(CliError::Config("device_id must not be empty".to_string()));
            }
            let parsed = url::Url::parse(&entry.server_url).map_err(|e| {
                CliError::Config(format!(
                    "device {} has an invalid server_url: {}",
                    entry.device_id, e
                ))
            })?;
            if !matches!(parsed.scheme(), "ws" | "wss") {
                return Err(CliError::Config(format!(
                    "device {} server_url must be ws:// or wss://",
                    entry.device_id
                )));
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_full_config() {
        let raw = r#"
            [constellation]
            constellation_id = "lab"
            heartbeat_interval = 15
            reconnect_delay = 2.5
            max_retries = 5

            [[devices]]
            device_id = "phone-1"
            server_url = "ws://10.0.0.5:8765"
            capabilities = ["ui", "camera"]

            [[devices]]
            device_id = "tablet-2"
            server_url = "ws://10.0.0.6:8765"
            max_retries = 1
        "#;

        let config: AppConfig = toml::from_str(raw).unwrap();
        config.validate().unwrap();

        assert_eq!(config.constellation.constellation_id, "lab");
        assert_eq!(
            config.constellation.heartbeat_interval,
            Duration::from_secs(15)
        );
        assert_eq!(
            config.constellation.reconnect_delay,
            Duration::from_millis(2500)
        );
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].capabilities, vec!["ui", "camera"]);
        assert_eq!(config.devices[1].max_retries, Some(1));
    }

    #[test]
    fn test_defaults_when_sections_missing() {
        let config: AppConfig = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert!(config.devices.is_empty());
        assert_eq!(config.constellation.max_retries, 3);
    }

    #[test]
    fn test_rejects_empty_server_url() {
        let raw = r#"
            [[devices]]
            device_id = "d1"
            server_url = ""
        "#;
        let config: AppConfig = toml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }
}
