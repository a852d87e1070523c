//! Application orchestration: build the manager, connect the fleet, run
//! commands against it.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{error, info, warn};

use constellation_core::{DeviceId, ExecutionResult, TaskRequest};
use constellation_runtime::{DeviceManager, WsConnector};

use crate::config::AppConfig;
use crate::error::{CliError, Result};

/// CLI-facing wrapper around the device manager
pub struct ConstellationApp {
    config: AppConfig,
    manager: DeviceManager,
}

impl ConstellationApp {
    /// Build the manager over the real WebSocket connector
    pub fn new(config: AppConfig) -> Self {
        let manager = DeviceManager::new(
            config.constellation.clone(),
            Arc::new(WsConnector::new()),
        );
        Self { config, manager }
    }

    pub fn manager(&self) -> &DeviceManager {
        &self.manager
    }

    /// Register every configured device and connect them, reporting how many
    /// came up. Individual failures are logged, not fatal: the rest of the
    /// fleet still connects.
    pub async fn connect_fleet(&self) -> Result<usize> {
        if self.config.devices.is_empty() {
            return Err(CliError::Config(
                "no devices configured; add [[devices]] entries".to_string(),
            ));
        }

        let mut connected = 0;
        for entry in &self.config.devices {
            let device_id = DeviceId::new(entry.device_id.clone());
            self.manager
                .register_device(
                    device_id.clone(),
                    entry.server_url.clone(),
                    entry.capabilities.clone(),
                    entry.max_retries,
                )
                .await;

            match self.manager.connect_device(&device_id, false).await {
                Ok(true) => {
                    connected += 1;
                }
                Ok(false) => {
                    warn!(device = %device_id, "device failed to connect");
                }
                Err(e) => {
                    error!(device = %device_id, error = %e, "connect error");
                }
            }
        }

        info!(
            connected,
            total = self.config.devices.len(),
            "fleet connection complete"
        );
        Ok(connected)
    }

    /// Stay resident until interrupted, then disconnect everything cleanly
    pub async fn run_until_shutdown(&self) -> Result<()> {
        info!("constellation running; press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
        info!("shutting down");

        for record in self.manager.list_devices(true).await {
            if let Err(e) = self.manager.disconnect_device(&record.device_id).await {
                warn!(device = %record.device_id, error = %e, "disconnect failed");
            }
        }
        Ok(())
    }

    /// Dispatch a single task and return its structured result
    pub async fn send_task(
        &self,
        device: &str,
        task_name: &str,
        request: Value,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult> {
        let task = TaskRequest::new(
            DeviceId::new(device),
            task_name,
            request,
            timeout.unwrap_or(self.config.constellation.default_task_timeout),
        );
        Ok(self.manager.submit_task(task).await?)
    }
}
