//! Integration tests for ventsight-common library.

use ventsight_common::{
    DeviceBirth, MetricDescriptor, MetricType, NodeBirth, TopicBuilder, parse_config,
};

#[test]
fn test_birth_workflow() {
    let topics = TopicBuilder::new("Ventilation", "OLIMEX_POE", "DV10");

    // A bridge announces the node first, then the device schema
    let node = NodeBirth::new(1000);
    let device = DeviceBirth::new(
        1000,
        vec![
            MetricDescriptor::new("HeatExchangerEfficiency", MetricType::Float),
            MetricDescriptor::new("RunMode", MetricType::Int16),
        ],
    );

    let node_bytes = serde_json::to_vec(&node).expect("NBIRTH encode failed");
    let device_bytes = serde_json::to_vec(&device).expect("DBIRTH encode failed");

    // A consumer decodes them back
    let decoded_node: NodeBirth = serde_json::from_slice(&node_bytes).expect("decode failed");
    assert_eq!(decoded_node.seq, 0);
    assert_eq!(decoded_node.metrics[0].name, NodeBirth::REBIRTH_METRIC);
    assert!(!decoded_node.metrics[0].value);

    let decoded_device: DeviceBirth =
        serde_json::from_slice(&device_bytes).expect("decode failed");
    assert_eq!(decoded_device.seq, 1);
    assert_eq!(decoded_device.metrics.len(), 2);
    assert_eq!(decoded_device.metrics[1].metric_type, MetricType::Int16);

    assert!(topics.node_birth().starts_with("spBv1.0/Ventilation/"));
    assert!(topics.device_birth().ends_with("/OLIMEX_POE/DV10"));
}

#[test]
fn test_parse_config_error() {
    let result: ventsight_common::Result<serde_json::Value> = parse_config("{ not json5");
    assert!(result.is_err());
}
