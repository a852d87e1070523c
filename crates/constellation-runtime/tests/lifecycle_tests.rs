//! Connection lifecycle integration tests: registration handshake ordering,
//! device info merging, heartbeat bookkeeping, and manual disconnect.

mod common;

use std::time::Duration;

use serde_json::json;
use tokio::time::sleep;

use common::{device, manager_with_agents, manager_with_manual_devices};
use constellation_core::{ConstellationConfig, DeviceStatus, Envelope, MessageType};
use constellation_runtime::testing::{AgentOptions, StubPlan};

#[tokio::test]
async fn connect_registers_and_merges_device_info() {
    let opts = AgentOptions {
        device_info: Some(json!({
            "os": "android",
            "capabilities": ["ui", "camera"],
            "system_info": {"model": "pixel-7"}
        })),
        ..Default::default()
    };
    let (manager, connector, _driver) =
        manager_with_agents(ConstellationConfig::testing(), opts);
    connector.queue(StubPlan::Accept);

    let d1 = device("d1");
    manager
        .register_device(d1.clone(), "ws://devices/1", vec!["shell".into()], None)
        .await;
    assert!(manager.connect_device(&d1, false).await.unwrap());

    let record = manager.device_record(&d1).await.unwrap();
    assert_eq!(record.status, DeviceStatus::Idle);
    assert_eq!(record.os.as_deref(), Some("android"));
    // Reported capabilities union-merge with the registered ones
    assert!(record.capabilities.contains("shell"));
    assert!(record.capabilities.contains("ui"));
    assert!(record.capabilities.contains("camera"));
    assert_eq!(record.metadata["system_info"]["model"], json!("pixel-7"));
    // Successful connect resets the attempt counter
    assert_eq!(record.connection_attempts, 0);
}

#[tokio::test]
async fn connect_tolerates_missing_device_info() {
    // Agent that never answers info requests
    let (manager, connector, _driver) =
        manager_with_agents(ConstellationConfig::testing(), AgentOptions::default());
    connector.queue(StubPlan::Accept);

    let d1 = device("d1");
    manager
        .register_device(d1.clone(), "ws://devices/1", vec![], None)
        .await;
    assert!(manager.connect_device(&d1, false).await.unwrap());
    assert_eq!(
        manager.device_status(&d1).await,
        Some(DeviceStatus::Idle)
    );
}

#[tokio::test]
async fn connect_unregistered_device_fails_fast() {
    let (manager, _connector, _driver) =
        manager_with_agents(ConstellationConfig::testing(), AgentOptions::default());
    let err = manager
        .connect_device(&device("ghost"), false)
        .await
        .unwrap_err();
    assert_eq!(err.error_category(), "not_registered");
}

#[tokio::test]
async fn heartbeats_refresh_last_heartbeat() {
    let (manager, connector, _driver) =
        manager_with_agents(ConstellationConfig::testing(), AgentOptions::default());
    connector.queue(StubPlan::Accept);

    let d1 = device("d1");
    manager
        .register_device(d1.clone(), "ws://devices/1", vec![], None)
        .await;
    assert!(manager.connect_device(&d1, false).await.unwrap());

    // testing() heartbeats every 50ms; the agent acks each one
    sleep(Duration::from_millis(150)).await;
    let record = manager.device_record(&d1).await.unwrap();
    let last = record.last_heartbeat.expect("heartbeat ack recorded");
    let age = chrono::Utc::now() - last;
    assert!(age < chrono::Duration::seconds(2));
}

#[tokio::test]
async fn registration_without_ack_fails_the_connect() {
    let config = ConstellationConfig {
        register_timeout: Duration::from_millis(80),
        ..ConstellationConfig::testing()
    };
    let (manager, connector, mut endpoints) = manager_with_manual_devices(config);
    connector.queue(StubPlan::Accept);

    let d1 = device("d1");
    manager
        .register_device(d1.clone(), "ws://devices/1", vec![], None)
        .await;

    let connect = tokio::spawn({
        let manager = manager.clone();
        let d1 = d1.clone();
        async move { manager.connect_device(&d1, false).await }
    });

    // The REGISTER frame arrives but nobody acks it
    let mut raw = endpoints.recv().await.expect("endpoint");
    let frame = raw.recv_type(MessageType::Register).await.expect("register");
    assert_eq!(frame.target_id.as_deref(), Some("d1"));

    assert!(!connect.await.unwrap().unwrap());
    let record = manager.device_record(&d1).await.unwrap();
    assert_eq!(record.status, DeviceStatus::Disconnected);
    assert_eq!(record.connection_attempts, 1);
}

#[tokio::test]
async fn registration_rejection_is_a_negative_ack() {
    let config = ConstellationConfig {
        register_timeout: Duration::from_millis(500),
        ..ConstellationConfig::testing()
    };
    let (manager, connector, mut endpoints) = manager_with_manual_devices(config);
    connector.queue(StubPlan::Accept);

    let d1 = device("d1");
    manager
        .register_device(d1.clone(), "ws://devices/1", vec![], None)
        .await;

    let connect = tokio::spawn({
        let manager = manager.clone();
        let d1 = d1.clone();
        async move { manager.connect_device(&d1, false).await }
    });

    let mut raw = endpoints.recv().await.expect("endpoint");
    raw.recv_type(MessageType::Register).await.expect("register");
    let mut rejection = Envelope::new(MessageType::Error);
    rejection.error = Some("unknown device".to_string());
    raw.send(&rejection);

    assert!(!connect.await.unwrap().unwrap());
    assert_eq!(
        manager.device_status(&d1).await,
        Some(DeviceStatus::Disconnected)
    );
}

#[tokio::test]
async fn fresh_connect_budget_exhaustion_is_terminal() {
    // Empty plan: every dial refused
    let (manager, connector, _endpoints) =
        manager_with_manual_devices(ConstellationConfig::testing());

    let d1 = device("d1");
    manager
        .register_device(d1.clone(), "ws://devices/1", vec![], Some(2))
        .await;

    assert!(!manager.connect_device(&d1, false).await.unwrap());
    assert_eq!(
        manager.device_status(&d1).await,
        Some(DeviceStatus::Disconnected)
    );

    assert!(!manager.connect_device(&d1, false).await.unwrap());
    // Second fresh failure reaches max_retries = 2
    assert_eq!(manager.device_status(&d1).await, Some(DeviceStatus::Failed));
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test]
async fn manual_disconnect_does_not_retry() {
    let (manager, connector, _driver) =
        manager_with_agents(ConstellationConfig::testing(), AgentOptions::default());
    connector.queue(StubPlan::Accept);

    let d1 = device("d1");
    manager
        .register_device(d1.clone(), "ws://devices/1", vec![], None)
        .await;
    assert!(manager.connect_device(&d1, false).await.unwrap());
    let dials_before = connector.attempts();

    manager.disconnect_device(&d1).await.unwrap();
    assert_eq!(
        manager.device_status(&d1).await,
        Some(DeviceStatus::Disconnected)
    );

    // Give a would-be supervisor several reconnect windows to (not) fire
    sleep(Duration::from_millis(150)).await;
    assert_eq!(connector.attempts(), dials_before);
    assert_eq!(
        manager.device_status(&d1).await,
        Some(DeviceStatus::Disconnected)
    );
}

#[tokio::test]
async fn stray_and_duplicate_completions_are_harmless() {
    let (manager, connector, mut endpoints) =
        manager_with_manual_devices(ConstellationConfig::testing());
    connector.queue(StubPlan::Accept);

    let d1 = device("d1");
    manager
        .register_device(d1.clone(), "ws://devices/1", vec![], None)
        .await;

    let connect = tokio::spawn({
        let manager = manager.clone();
        let d1 = d1.clone();
        async move { manager.connect_device(&d1, false).await }
    });
    let mut agent = endpoints.recv().await.expect("endpoint");
    agent.recv_type(MessageType::Register).await.expect("register");
    agent.ack_registration();
    assert!(connect.await.unwrap().unwrap());

    // A completion nobody asked for is logged and dropped
    let mut stray = Envelope::new(MessageType::TaskEnd);
    stray.response_id = Some("no-such-correlation".to_string());
    agent.send(&stray);

    // A real task completed twice resolves its caller exactly once
    let submit = tokio::spawn({
        let manager = manager.clone();
        let request = constellation_core::TaskRequest::new(
            d1.clone(),
            "tap",
            json!({"x": 1}),
            Duration::from_secs(5),
        );
        async move { manager.submit_task(request).await }
    });
    let frame = agent.recv_type(MessageType::Task).await.expect("task");
    agent.finish_task(&frame, Ok(json!({"done": 1})));
    agent.finish_task(&frame, Ok(json!({"done": 2})));

    let result = submit.await.unwrap().unwrap();
    assert!(result.success);
    assert_eq!(result.result, Some(json!({"done": 1})));

    // The router survived both anomalies; the device still serves
    sleep(Duration::from_millis(10)).await;
    assert_eq!(manager.device_status(&d1).await, Some(DeviceStatus::Idle));
}

#[tokio::test]
async fn malformed_frames_do_not_kill_the_receive_loop() {
    let (manager, connector, mut endpoints) =
        manager_with_manual_devices(ConstellationConfig::testing());
    connector.queue(StubPlan::Accept);

    let d1 = device("d1");
    manager
        .register_device(d1.clone(), "ws://devices/1", vec![], None)
        .await;

    let connect = tokio::spawn({
        let manager = manager.clone();
        let d1 = d1.clone();
        async move { manager.connect_device(&d1, false).await }
    });
    let mut agent = endpoints.recv().await.expect("endpoint");
    agent.recv_type(MessageType::Register).await.expect("register");
    agent.ack_registration();
    assert!(connect.await.unwrap().unwrap());

    agent.send_raw("this is not json");
    agent.send_raw(r#"{"type":"SOMETHING_NEW","status":"OK"}"#);

    // The loop is still alive and routing afterwards
    let submit = tokio::spawn({
        let manager = manager.clone();
        let request = constellation_core::TaskRequest::new(
            d1.clone(),
            "ping",
            json!({}),
            Duration::from_secs(5),
        );
        async move { manager.submit_task(request).await }
    });
    let frame = agent.recv_type(MessageType::Task).await.expect("task");
    agent.finish_task(&frame, Ok(json!("pong")));
    assert!(submit.await.unwrap().unwrap().success);
}

#[tokio::test]
async fn remove_device_drops_the_record() {
    let (manager, connector, _driver) =
        manager_with_agents(ConstellationConfig::testing(), AgentOptions::default());
    connector.queue(StubPlan::Accept);

    let d1 = device("d1");
    manager
        .register_device(d1.clone(), "ws://devices/1", vec![], None)
        .await;
    assert!(manager.connect_device(&d1, false).await.unwrap());

    manager.remove_device(&d1).await.unwrap();
    assert!(manager.device_status(&d1).await.is_none());
    assert!(manager.list_devices(false).await.is_empty());
    // Second removal reports the missing registration
    assert!(manager.remove_device(&d1).await.is_err());
}
