//! Sensor snapshot acquisition.
//!
//! A snapshot is built from a fixed, ordered sequence of 15 single-register
//! reads. The sequence always runs to the end; failed reads only lower the
//! success count, and a snapshot is usable when more than
//! [`VALIDITY_THRESHOLD`] registers succeeded.

use tokio::time::Instant;
use tracing::{debug, info};
use ventsight_common::{MetricDescriptor, MetricType};

use crate::config::RegisterMap;
use crate::reader::{RegisterBus, RegisterReader};

/// Number of registers read per snapshot.
pub const REGISTER_COUNT: u8 = 15;

/// A snapshot is valid when strictly more reads than this succeeded.
pub const VALIDITY_THRESHOLD: u8 = 10;

/// Milliseconds elapsed since the bridge started.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// One complete set of readings.
///
/// Scaled quantities that could not be read are `NaN`; raw counters that could
/// not be read are `0`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorSnapshot {
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
    pub supply_fan_runtime: u16,
    pub extract_fan_runtime: u16,
    /// Monotonic milliseconds at acquisition start
    pub timestamp: u64,
    /// Registers that returned a usable value (0-15)
    pub successful_reads: u8,
}

impl SensorSnapshot {
    pub fn is_valid(&self) -> bool {
        self.successful_reads > VALIDITY_THRESHOLD
    }
}

/// Metric schema announced in the device birth, in acquisition order.
pub fn metric_schema() -> Vec<MetricDescriptor> {
    [
        ("HeatExchangerEfficiency", MetricType::Float),
        ("RunMode", MetricType::Int16),
        ("OutdoorTemp", MetricType::Float),
        ("SupplyAirTemp", MetricType::Float),
        ("SupplyAirSetpointTemp", MetricType::Float),
        ("ExhaustAirTemp", MetricType::Float),
        ("ExtractAirTemp", MetricType::Float),
        ("SupplyAirPressure", MetricType::Float),
        ("ExtractAirPressure", MetricType::Float),
        ("SupplyAirFlow", MetricType::Float),
        ("ExtractAirFlow", MetricType::Float),
        ("ExtraSupplyAirFlow", MetricType::Float),
        ("ExtraExtractAirFlow", MetricType::Float),
        ("SupplyFanRuntime", MetricType::Int16),
        ("ExtractFanRuntime", MetricType::Int16),
    ]
    .into_iter()
    .map(|(name, metric_type)| MetricDescriptor::new(name, metric_type))
    .collect()
}

/// Runs the acquisition sequence.
#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    registers: RegisterMap,
    strict_runtime_reads: bool,
}

impl SnapshotBuilder {
    /// With `strict_runtime_reads` off, the two fan runtime reads count as
    /// successful whatever the transaction outcome, matching the deployed
    /// firmware that downstream consumers were built against.
    pub fn new(registers: RegisterMap, strict_runtime_reads: bool) -> Self {
        Self {
            registers,
            strict_runtime_reads,
        }
    }

    /// Read every register and return the finished snapshot.
    pub async fn build<B: RegisterBus>(
        &self,
        reader: &mut RegisterReader<B>,
        timestamp: u64,
    ) -> SensorSnapshot {
        let map = &self.registers;
        let mut snapshot = SensorSnapshot {
            timestamp,
            ..SensorSnapshot::default()
        };
        let mut success = 0u8;

        debug!(timestamp, "Reading sensors");

        // Efficiency and run mode count on transaction success
        match reader.read_scaled(map.heat_exchanger_efficiency).await {
            Ok(value) => {
                snapshot.heat_exchanger_efficiency = value;
                success += 1;
            }
            Err(_) => snapshot.heat_exchanger_efficiency = f32::NAN,
        }

        if let Ok(value) = reader.read_raw(map.run_mode).await {
            snapshot.run_mode = value;
            success += 1;
        }

        // Scaled quantities count when the decoded value is a number
        let scaled = [
            (map.outdoor_temp, &mut snapshot.outdoor_temp),
            (map.supply_air_temp, &mut snapshot.supply_air_temp),
            (map.supply_air_setpoint_temp, &mut snapshot.supply_air_setpoint_temp),
            (map.exhaust_air_temp, &mut snapshot.exhaust_air_temp),
            (map.extract_air_temp, &mut snapshot.extract_air_temp),
            (map.supply_air_pressure, &mut snapshot.supply_air_pressure),
            (map.extract_air_pressure, &mut snapshot.extract_air_pressure),
            (map.supply_air_flow, &mut snapshot.supply_air_flow),
            (map.extract_air_flow, &mut snapshot.extract_air_flow),
            (map.extra_supply_air_flow, &mut snapshot.extra_supply_air_flow),
            (map.extra_extract_air_flow, &mut snapshot.extra_extract_air_flow),
        ];
        for (address, slot) in scaled {
            *slot = reader.read_scaled(address).await.unwrap_or(f32::NAN);
            if !slot.is_nan() {
                success += 1;
            }
        }

        let runtimes = [
            (map.supply_fan_runtime, &mut snapshot.supply_fan_runtime),
            (map.extract_fan_runtime, &mut snapshot.extract_fan_runtime),
        ];
        for (address, slot) in runtimes {
            let result = reader.read_raw(address).await;
            let ok = result.is_ok();
            *slot = result.unwrap_or(0);
            if ok || !self.strict_runtime_reads {
                success += 1;
            }
        }

        snapshot.successful_reads = success;
        info!(
            successful = success,
            valid = snapshot.is_valid(),
            "{}/{} registers OK",
            success,
            REGISTER_COUNT
        );

        snapshot
    }
}
