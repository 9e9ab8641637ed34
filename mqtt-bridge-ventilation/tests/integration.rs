//! Integration tests for mqtt-bridge-ventilation.

use std::cell::RefCell;
use std::time::Duration;

use mqtt_bridge_ventilation::command::PollingPolicy;
use mqtt_bridge_ventilation::config::{NetworkConfig, RegisterMap, VentilationBridgeConfig};
use mqtt_bridge_ventilation::controller::{Controller, Reply};
use mqtt_bridge_ventilation::error::{LinkError, PublishError};
use mqtt_bridge_ventilation::publisher::{MessageSink, PublishOutcome, Publisher, SkipReason};
use mqtt_bridge_ventilation::reader::{MemoryBus, RegisterReader};
use mqtt_bridge_ventilation::session::SessionEvent;
use mqtt_bridge_ventilation::snapshot::SnapshotBuilder;
use mqtt_bridge_ventilation::supervisor::{Supervisor, UnmanagedLink};
use ventsight_common::TopicBuilder;

/// Sink that keeps every message in memory.
#[derive(Debug, Default)]
struct MemorySink {
    messages: RefCell<Vec<(String, serde_json::Value)>>,
}

impl MessageSink for MemorySink {
    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let value = serde_json::from_slice(&payload).expect("payload is not JSON");
        self.messages.borrow_mut().push((topic.to_string(), value));
        Ok(())
    }
}

fn bridge(bus: MemoryBus, strict: bool) -> Controller<MemoryBus, MemorySink> {
    let map = RegisterMap::default();
    Controller::new(
        RegisterReader::new(bus, map.fan_mode),
        SnapshotBuilder::new(map, strict),
        Publisher::new(
            MemorySink::default(),
            TopicBuilder::new("Ventilation", "OLIMEX_POE", "DV10"),
        ),
        Supervisor::new(Box::new(UnmanagedLink), &NetworkConfig::default()),
        PollingPolicy::default(),
    )
}

fn messages(bridge: &Controller<MemoryBus, MemorySink>) -> Vec<(String, serde_json::Value)> {
    bridge.publisher().sink().messages.borrow().clone()
}

/// Bring link and session up, then drop the birth messages.
async fn online(bridge: &mut Controller<MemoryBus, MemorySink>) {
    bridge.tick().await;
    bridge.on_session_event(SessionEvent::Connected).await;
    bridge.publisher().sink().messages.borrow_mut().clear();
}

/// A full healthy cycle publishes 15 measurements plus identity fields.
#[tokio::test]
async fn test_full_snapshot_published() {
    let map = RegisterMap::default();
    let mut bridge = bridge(MemoryBus::simulated(&map), false);
    online(&mut bridge).await;

    let outcome = bridge.read_and_publish().await.unwrap();
    assert_eq!(outcome, PublishOutcome::Published);

    let sent = messages(&bridge);
    assert_eq!(sent.len(), 1);
    let (topic, body) = &sent[0];
    assert_eq!(topic, "sensors/OLIMEX_POE");

    let object = body.as_object().unwrap();
    assert_eq!(object.len(), 17);
    assert_eq!(body["device_id"], "DV10");

    for integer in ["run_mode", "supply_air_fan_runtime", "extract_air_fan_runtime"] {
        assert!(body[integer].is_u64(), "{} should be an integer", integer);
    }
    for (name, value) in object {
        if !["device_id", "timestamp", "run_mode", "supply_air_fan_runtime", "extract_air_fan_runtime"]
            .contains(&name.as_str())
        {
            assert!(value.is_f64(), "{} should be a float", name);
        }
    }

    assert_eq!(body["run_mode"], 2);
    assert_eq!(body["supply_air_fan_runtime"], 18422);
    assert!((body["outdoor_temp"].as_f64().unwrap() - 5.4).abs() < 1e-4);
}

/// Nine failed registers leave the snapshot invalid; nothing reaches the broker.
#[tokio::test]
async fn test_degraded_bus_publishes_nothing() {
    let map = RegisterMap::default();
    let mut bus = MemoryBus::simulated(&map);
    for address in [0, 6, 7, 8, 19, 12, 13, 3, 4] {
        bus.set_failing(address, true);
    }
    let mut bridge = bridge(bus, false);
    online(&mut bridge).await;

    let outcome = bridge.read_and_publish().await.unwrap();
    assert_eq!(outcome, PublishOutcome::Skipped(SkipReason::InvalidSnapshot));
    assert!(bridge.snapshot().successful_reads <= 10);
    assert!(messages(&bridge).is_empty());
}

/// Runtime counters count as successful unless strict reads are enabled.
#[tokio::test]
async fn test_runtime_counting_modes() {
    let map = RegisterMap::default();
    let failing = [map.supply_fan_runtime, map.extract_fan_runtime, map.outdoor_temp, map.supply_air_temp, map.exhaust_air_temp];

    let mut bus = MemoryBus::simulated(&map);
    for address in failing {
        bus.set_failing(address, true);
    }

    let mut lenient = bridge(bus.clone(), false);
    lenient.read_and_publish().await.unwrap();
    assert_eq!(lenient.snapshot().successful_reads, 12);
    assert!(lenient.snapshot().is_valid());
    assert_eq!(lenient.snapshot().supply_fan_runtime, 0);

    let mut strict = bridge(bus, true);
    strict.read_and_publish().await.unwrap();
    assert_eq!(strict.snapshot().successful_reads, 10);
    assert!(!strict.snapshot().is_valid());
}

/// Broker outage: publishes are no-ops, birth fires once on reconnect, then data flows.
#[tokio::test]
async fn test_session_outage_and_recovery() {
    let map = RegisterMap::default();
    let mut bridge = bridge(MemoryBus::simulated(&map), false);
    online(&mut bridge).await;

    bridge
        .on_session_event(SessionEvent::Disconnected(LinkError::Session(
            "connection reset".to_string(),
        )))
        .await;
    assert!(!bridge.connection().is_online());

    for _ in 0..3 {
        let outcome = bridge.read_and_publish().await.unwrap();
        assert_eq!(outcome, PublishOutcome::Skipped(SkipReason::Offline));
    }
    assert!(messages(&bridge).is_empty());

    bridge.on_session_event(SessionEvent::Reconnecting).await;
    bridge.on_session_event(SessionEvent::Connected).await;
    bridge.on_session_event(SessionEvent::Connected).await;

    bridge.read_and_publish().await.unwrap();

    let topics: Vec<String> = messages(&bridge).into_iter().map(|(topic, _)| topic).collect();
    assert_eq!(
        topics,
        vec![
            "spBv1.0/Ventilation/NBIRTH/OLIMEX_POE",
            "spBv1.0/Ventilation/DBIRTH/OLIMEX_POE/DV10",
            "sensors/OLIMEX_POE",
        ]
    );
}

/// The device birth lists the schema in acquisition order.
#[tokio::test]
async fn test_birth_schema() {
    let mut bridge = bridge(MemoryBus::new(), false);
    bridge.on_session_event(SessionEvent::Connected).await;

    let sent = messages(&bridge);
    let (_, device) = &sent[1];
    assert_eq!(device["seq"], 1);

    let names: Vec<&str> = device["metrics"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["name"].as_str().unwrap())
        .collect();
    assert_eq!(names.first(), Some(&"HeatExchangerEfficiency"));
    assert_eq!(names.last(), Some(&"ExtractFanRuntime"));
    assert_eq!(names.len(), 15);
}

/// Console session: change the interval, switch fan mode, reject bad input.
#[tokio::test(start_paused = true)]
async fn test_console_session() {
    let map = RegisterMap::default();
    let mut bridge = bridge(MemoryBus::simulated(&map), false);
    online(&mut bridge).await;

    assert_eq!(
        bridge.handle_line("i").await,
        Some(Reply::Prompt("Seconds (5-300): "))
    );
    bridge.handle_line("5").await;
    assert_eq!(bridge.policy().interval_ms, 5_000);

    bridge.handle_line("i").await;
    assert_eq!(bridge.handle_line("abc").await, None);
    assert_eq!(bridge.policy().interval_ms, 5_000);

    bridge.handle_line("0").await;
    assert_eq!(bridge.reader().bus().register(map.fan_mode), Some(0));

    tokio::time::advance(Duration::from_secs(5)).await;
    bridge.tick().await;
    assert_eq!(messages(&bridge).len(), 1);
}

#[test]
fn test_sample_config_parses() {
    let content = include_str!("../../configs/ventilation.json5");
    let config = VentilationBridgeConfig::from_json5(content).expect("sample config invalid");

    assert_eq!(config.sparkplug.node_id, "OLIMEX_POE");
    assert_eq!(config.modbus.registers.fan_mode, 367);
}
