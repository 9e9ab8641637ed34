//! Snapshot and birth publishing over MQTT.

use std::future::Future;

use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use tracing::{debug, info, warn};
use ventsight_common::{DeviceBirth, NodeBirth, TopicBuilder};

use crate::error::PublishError;
use crate::snapshot::{SensorSnapshot, metric_schema};

/// Destination for outgoing MQTT messages.
pub trait MessageSink {
    /// Hand one message to the broker connection.
    fn send(&self, topic: &str, payload: Vec<u8>) -> impl Future<Output = Result<(), PublishError>>;
}

impl MessageSink for AsyncClient {
    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        self.publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| PublishError::Transport {
                topic: topic.to_string(),
                message: e.to_string(),
            })
    }
}

/// JSON data message published for every valid snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SensorMessage<'a> {
    pub device_id: &'a str,
    pub timestamp: u64,
    pub heat_exchanger_efficiency: f32,
    pub run_mode: u16,
    pub outdoor_temp: f32,
    pub supply_air_temp: f32,
    pub supply_air_setpoint_temp: f32,
    pub exhaust_air_temp: f32,
    pub extract_air_temp: f32,
    pub supply_air_pressure: f32,
    pub extract_air_pressure: f32,
    pub supply_air_flow: f32,
    pub extract_air_flow: f32,
    pub extra_supply_air_flow: f32,
    pub extra_extract_air_flow: f32,
    pub supply_air_fan_runtime: u16,
    pub extract_air_fan_runtime: u16,
}

impl<'a> SensorMessage<'a> {
    pub fn new(device_id: &'a str, snapshot: &SensorSnapshot) -> Self {
        Self {
            device_id,
            timestamp: snapshot.timestamp,
            heat_exchanger_efficiency: snapshot.heat_exchanger_efficiency,
            run_mode: snapshot.run_mode,
            outdoor_temp: snapshot.outdoor_temp,
            supply_air_temp: snapshot.supply_air_temp,
            supply_air_setpoint_temp: snapshot.supply_air_setpoint_temp,
            exhaust_air_temp: snapshot.exhaust_air_temp,
            extract_air_temp: snapshot.extract_air_temp,
            supply_air_pressure: snapshot.supply_air_pressure,
            extract_air_pressure: snapshot.extract_air_pressure,
            supply_air_flow: snapshot.supply_air_flow,
            extract_air_flow: snapshot.extract_air_flow,
            extra_supply_air_flow: snapshot.extra_supply_air_flow,
            extra_extract_air_flow: snapshot.extra_extract_air_flow,
            supply_air_fan_runtime: snapshot.supply_fan_runtime,
            extract_air_fan_runtime: snapshot.extract_fan_runtime,
        }
    }
}

/// Why a snapshot was not transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Too few registers were read
    InvalidSnapshot,
    /// Link or broker session is down
    Offline,
}

/// Result of a publish request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    Skipped(SkipReason),
}

/// Publishes snapshots and birth announcements on the bridge's fixed topics.
#[derive(Debug)]
pub struct Publisher<S> {
    sink: S,
    topics: TopicBuilder,
}

impl<S: MessageSink> Publisher<S> {
    pub fn new(sink: S, topics: TopicBuilder) -> Self {
        Self { sink, topics }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Publish a snapshot.
    ///
    /// Invalid snapshots and offline sessions are skipped without touching the
    /// sink. A failed send is logged and returned; it is not retried.
    pub async fn publish(
        &self,
        snapshot: &SensorSnapshot,
        online: bool,
    ) -> Result<PublishOutcome, PublishError> {
        if !snapshot.is_valid() {
            debug!(
                successful = snapshot.successful_reads,
                "Snapshot invalid, not publishing"
            );
            return Ok(PublishOutcome::Skipped(SkipReason::InvalidSnapshot));
        }
        if !online {
            debug!("Offline, not publishing");
            return Ok(PublishOutcome::Skipped(SkipReason::Offline));
        }

        let topic = self.topics.data();
        let payload = serde_json::to_vec(&SensorMessage::new(self.topics.device(), snapshot))?;

        match self.sink.send(&topic, payload).await {
            Ok(()) => {
                info!(topic = %topic, timestamp = snapshot.timestamp, "Data sent");
                Ok(PublishOutcome::Published)
            }
            Err(e) => {
                warn!(error = %e, "Publish failed");
                Err(e)
            }
        }
    }

    /// Announce the node and the device metric schema for a new session.
    pub async fn announce_birth(&self, timestamp: u64) -> Result<(), PublishError> {
        let node = serde_json::to_vec(&NodeBirth::new(timestamp))?;
        let device = serde_json::to_vec(&DeviceBirth::new(timestamp, metric_schema()))?;

        let mut first_error = None;
        for (topic, payload) in [
            (self.topics.node_birth(), node),
            (self.topics.device_birth(), device),
        ] {
            match self.sink.send(&topic, payload).await {
                Ok(()) => debug!(topic = %topic, "Birth announced"),
                Err(e) => {
                    warn!(error = %e, "Birth announcement failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(
                    node = %self.topics.node(),
                    device = %self.topics.device(),
                    "Birth certificates published"
                );
                Ok(())
            }
        }
    }
}
