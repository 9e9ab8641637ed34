//! Metric schema and birth announcement payloads.
//!
//! Birth messages describe the metrics a device will report so that consumers
//! learn the schema once per session instead of once per reading.

use serde::{Deserialize, Serialize};

/// Declared type of a metric in a device birth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricType {
    Float,
    Int16,
}

impl MetricType {
    /// Get the string representation used in birth payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Float => "Float",
            MetricType::Int16 => "Int16",
        }
    }
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Name and declared type of a single metric (no value).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
}

impl MetricDescriptor {
    pub fn new(name: impl Into<String>, metric_type: MetricType) -> Self {
        Self {
            name: name.into(),
            metric_type,
        }
    }
}

/// Node-level metric carried in a node birth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetric {
    pub name: String,
    pub value: bool,
}

/// Node birth announcement (`NBIRTH`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeBirth {
    /// Bridge-monotonic milliseconds at announcement time.
    pub timestamp: u64,
    pub seq: u64,
    pub metrics: Vec<NodeMetric>,
}

impl NodeBirth {
    /// Name of the rebirth control metric every node announces.
    pub const REBIRTH_METRIC: &'static str = "NodeControl/Rebirth";

    /// Create the node birth for a new session.
    pub fn new(timestamp: u64) -> Self {
        Self {
            timestamp,
            seq: 0,
            metrics: vec![NodeMetric {
                name: Self::REBIRTH_METRIC.to_string(),
                value: false,
            }],
        }
    }
}

/// Device birth announcement (`DBIRTH`), the metric schema of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceBirth {
    pub timestamp: u64,
    pub seq: u64,
    pub metrics: Vec<MetricDescriptor>,
}

impl DeviceBirth {
    /// Create a device birth; it always follows the node birth, hence `seq` 1.
    pub fn new(timestamp: u64, metrics: Vec<MetricDescriptor>) -> Self {
        Self {
            timestamp,
            seq: 1,
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_birth_serialization() {
        let birth = NodeBirth::new(1234);
        let json = serde_json::to_string(&birth).unwrap();

        assert_eq!(
            json,
            r#"{"timestamp":1234,"seq":0,"metrics":[{"name":"NodeControl/Rebirth","value":false}]}"#
        );
    }

    #[test]
    fn test_device_birth_serialization() {
        let birth = DeviceBirth::new(
            42,
            vec![
                MetricDescriptor::new("OutdoorTemp", MetricType::Float),
                MetricDescriptor::new("RunMode", MetricType::Int16),
            ],
        );
        let value = serde_json::to_value(&birth).unwrap();

        assert_eq!(value["seq"], 1);
        assert_eq!(value["metrics"][0]["name"], "OutdoorTemp");
        assert_eq!(value["metrics"][0]["type"], "Float");
        assert_eq!(value["metrics"][1]["type"], "Int16");
        assert!(value["metrics"][1].get("value").is_none());
    }

    #[test]
    fn test_metric_type_display() {
        assert_eq!(MetricType::Float.to_string(), "Float");
        assert_eq!(MetricType::Int16.as_str(), "Int16");
    }
}
