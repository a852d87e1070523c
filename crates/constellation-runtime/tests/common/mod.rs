//! Shared setup for runtime integration tests

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use constellation_core::{ConstellationConfig, DeviceId};
use constellation_runtime::testing::{spawn_agent, AgentOptions, StubConnector, StubDevice};
use constellation_runtime::DeviceManager;

/// Manager wired to a stub connector, with every accepted endpoint driven by
/// a scripted agent.
pub fn manager_with_agents(
    config: ConstellationConfig,
    opts: AgentOptions,
) -> (DeviceManager, Arc<StubConnector>, JoinHandle<()>) {
    let (connector, endpoints) = StubConnector::new();
    let manager = DeviceManager::new(config, connector.clone());
    let driver = auto_agents(endpoints, opts);
    (manager, connector, driver)
}

/// Manager wired to a stub connector whose endpoints the test drives by hand.
pub fn manager_with_manual_devices(
    config: ConstellationConfig,
) -> (
    DeviceManager,
    Arc<StubConnector>,
    mpsc::UnboundedReceiver<StubDevice>,
) {
    let (connector, endpoints) = StubConnector::new();
    let manager = DeviceManager::new(config, connector.clone());
    (manager, connector, endpoints)
}

/// Attach a scripted agent to every endpoint the connector produces
pub fn auto_agents(
    mut endpoints: mpsc::UnboundedReceiver<StubDevice>,
    opts: AgentOptions,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(device) = endpoints.recv().await {
            spawn_agent(device, opts.clone());
        }
    })
}

pub fn device(id: &str) -> DeviceId {
    DeviceId::new(id)
}
