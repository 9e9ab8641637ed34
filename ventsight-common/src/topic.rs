/// Namespace prefix for Sparkplug B birth topics.
pub const SPARKPLUG_NAMESPACE: &str = "spBv1.0";

/// Prefix of the plain JSON data topics.
pub const DATA_PREFIX: &str = "sensors";

/// Builder for the fixed set of MQTT topics a bridge publishes on.
///
/// Topics follow the patterns:
/// - `spBv1.0/<group>/NBIRTH/<node>`
/// - `spBv1.0/<group>/DBIRTH/<node>/<device>`
/// - `sensors/<node>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    group: String,
    node: String,
    device: String,
}

impl TopicBuilder {
    /// Create a new topic builder for a group, edge node and device.
    pub fn new(
        group: impl Into<String>,
        node: impl Into<String>,
        device: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            node: node.into(),
            device: device.into(),
        }
    }

    /// Sparkplug group identifier.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Edge node identifier.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Device identifier.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Build the node birth topic.
    ///
    /// # Example
    /// ```
    /// use ventsight_common::topic::TopicBuilder;
    ///
    /// let topics = TopicBuilder::new("Ventilation", "OLIMEX_POE", "DV10");
    /// assert_eq!(topics.node_birth(), "spBv1.0/Ventilation/NBIRTH/OLIMEX_POE");
    /// ```
    pub fn node_birth(&self) -> String {
        format!("{}/{}/NBIRTH/{}", SPARKPLUG_NAMESPACE, self.group, self.node)
    }

    /// Build the device birth topic.
    ///
    /// # Example
    /// ```
    /// use ventsight_common::topic::TopicBuilder;
    ///
    /// let topics = TopicBuilder::new("Ventilation", "OLIMEX_POE", "DV10");
    /// assert_eq!(topics.device_birth(), "spBv1.0/Ventilation/DBIRTH/OLIMEX_POE/DV10");
    /// ```
    pub fn device_birth(&self) -> String {
        format!(
            "{}/{}/DBIRTH/{}/{}",
            SPARKPLUG_NAMESPACE, self.group, self.node, self.device
        )
    }

    /// Build the data topic readings are published on.
    ///
    /// # Example
    /// ```
    /// use ventsight_common::topic::TopicBuilder;
    ///
    /// let topics = TopicBuilder::new("Ventilation", "OLIMEX_POE", "DV10");
    /// assert_eq!(topics.data(), "sensors/OLIMEX_POE");
    /// ```
    pub fn data(&self) -> String {
        format!("{}/{}", DATA_PREFIX, self.node)
    }
}
