//! Configuration for the ventilation bridge.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use ventsight_common::{LoggingConfig, MqttConfig};

/// Polling interval bounds, in seconds.
pub const MIN_INTERVAL_SECS: u64 = 5;
pub const MAX_INTERVAL_SECS: u64 = 300;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] ventsight_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VentilationBridgeConfig {
    /// MQTT broker settings
    pub mqtt: MqttConfig,

    /// Group, edge node and device identifiers
    pub sparkplug: SparkplugConfig,

    /// Modbus RTU settings
    pub modbus: ModbusConfig,

    /// Network link supervision
    #[serde(default)]
    pub network: NetworkConfig,

    /// Automatic polling
    #[serde(default)]
    pub polling: PollingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Identifiers used to build topics and the `device_id` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparkplugConfig {
    pub group_id: String,
    pub node_id: String,
    pub device_id: String,
}

/// Modbus RTU configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0" or "COM1")
    pub port: String,

    /// Baud rate (default: 9600)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Data bits (default: 8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,

    /// Parity: "none", "even", or "odd" (default: "none")
    #[serde(default = "default_parity")]
    pub parity: String,

    /// Stop bits: 1 or 2 (default: 1)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,

    /// Modbus unit/slave ID (1-247)
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// RS-485 driver-enable control
    #[serde(default)]
    pub direction: DirectionConfig,

    /// Register addresses of the controller
    #[serde(default)]
    pub registers: RegisterMap,

    /// Count fan runtime reads only when the transaction succeeded
    #[serde(default)]
    pub strict_runtime_reads: bool,

    /// Quiet period after a timed-out or failed transaction before the next
    /// request, in milliseconds (default: `timeout_ms`)
    #[serde(default)]
    pub resync_delay_ms: Option<u64>,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

fn default_unit_id() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    1000
}

/// How the RS-485 transceiver direction is switched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DirectionConfig {
    /// Adapter switches direction by itself
    #[default]
    Auto,
    /// DE and /RE tied to the adapter's RTS line
    Rts {
        /// Drive RTS low while transmitting
        #[serde(default)]
        invert: bool,
    },
    /// DE and /RE on GPIO lines (requires the `gpio` feature)
    Gpio {
        /// Driver-enable pin (BCM numbering)
        de_pin: u8,
        /// Receiver-enable (active low) pin, if wired separately
        #[serde(default)]
        re_pin: Option<u8>,
    },
}

/// Input register addresses of each measurement plus the fan-mode holding register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterMap {
    pub heat_exchanger_efficiency: u16,
    pub run_mode: u16,
    pub outdoor_temp: u16,
    pub supply_air_temp: u16,
    pub supply_air_setpoint_temp: u16,
    pub exhaust_air_temp: u16,
    pub extract_air_temp: u16,
    pub supply_air_pressure: u16,
    pub extract_air_pressure: u16,
    pub supply_air_flow: u16,
    pub extract_air_flow: u16,
    pub extra_supply_air_flow: u16,
    pub extra_extract_air_flow: u16,
    pub supply_fan_runtime: u16,
    pub extract_fan_runtime: u16,
    /// Holding register
    pub fan_mode: u16,
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self {
            heat_exchanger_efficiency: 1,
            run_mode: 2,
            outdoor_temp: 0,
            supply_air_temp: 6,
            supply_air_setpoint_temp: 7,
            exhaust_air_temp: 8,
            extract_air_temp: 19,
            supply_air_pressure: 12,
            extract_air_pressure: 13,
            supply_air_flow: 14,
            extract_air_flow: 15,
            extra_supply_air_flow: 292,
            extra_extract_air_flow: 293,
            supply_fan_runtime: 3,
            extract_fan_runtime: 4,
            fan_mode: 367,
        }
    }
}

impl RegisterMap {
    /// Input register addresses in acquisition order.
    pub fn input_addresses(&self) -> [u16; 15] {
        [
            self.heat_exchanger_efficiency,
            self.run_mode,
            self.outdoor_temp,
            self.supply_air_temp,
            self.supply_air_setpoint_temp,
            self.exhaust_air_temp,
            self.extract_air_temp,
            self.supply_air_pressure,
            self.extract_air_pressure,
            self.supply_air_flow,
            self.extract_air_flow,
            self.extra_supply_air_flow,
            self.extra_extract_air_flow,
            self.supply_fan_runtime,
            self.extract_fan_runtime,
        ]
    }
}

/// Network link supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Link to supervise
    #[serde(default)]
    pub link: LinkConfig,

    /// Status checks per connect attempt (default: 20)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay between status checks in milliseconds (default: 1000)
    #[serde(default = "default_attempt_interval_ms")]
    pub attempt_interval_ms: u64,
}

fn default_max_attempts() -> u32 {
    20
}

fn default_attempt_interval_ms() -> u64 {
    1000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            link: LinkConfig::default(),
            max_attempts: default_max_attempts(),
            attempt_interval_ms: default_attempt_interval_ms(),
        }
    }
}

/// Kind of network link carrying the MQTT session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LinkConfig {
    /// Link is managed by the host; always reported up
    #[default]
    Unmanaged,
    /// Wired interface, status from its operstate
    Wired { interface: String },
    /// WiFi interface joined through NetworkManager
    Wifi {
        interface: String,
        ssid: String,
        #[serde(default)]
        password: Option<String>,
    },
}

/// Automatic polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Start with automatic polling on (default: true)
    #[serde(default = "default_polling_enabled")]
    pub enabled: bool,

    /// Poll interval in seconds, 5-300 (default: 10)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Control loop tick in milliseconds (default: 100)
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

fn default_polling_enabled() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    10
}

fn default_tick_ms() -> u64 {
    100
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: default_polling_enabled(),
            interval_secs: default_interval_secs(),
            tick_ms: default_tick_ms(),
        }
    }
}

impl VentilationBridgeConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: VentilationBridgeConfig = ventsight_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a JSON5 string.
    pub fn from_json5(content: &str) -> Result<Self, ConfigError> {
        let config: VentilationBridgeConfig = ventsight_common::parse_config(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.host.is_empty() {
            return Err(ConfigError::Validation(
                "MQTT host cannot be empty".to_string(),
            ));
        }

        if self.mqtt.password.is_some() && self.mqtt.username.is_none() {
            return Err(ConfigError::Validation(
                "mqtt.password requires mqtt.username".to_string(),
            ));
        }

        for (field, value) in [
            ("group_id", &self.sparkplug.group_id),
            ("node_id", &self.sparkplug.node_id),
            ("device_id", &self.sparkplug.device_id),
        ] {
            if value.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "sparkplug.{} cannot be empty",
                    field
                )));
            }
            if value.contains(['/', '+', '#']) {
                return Err(ConfigError::Validation(format!(
                    "sparkplug.{} '{}' contains a topic separator or wildcard",
                    field, value
                )));
            }
        }

        self.modbus.validate()?;

        if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&self.polling.interval_secs) {
            return Err(ConfigError::Validation(format!(
                "polling.interval_secs must be {}-{}, got {}",
                MIN_INTERVAL_SECS, MAX_INTERVAL_SECS, self.polling.interval_secs
            )));
        }

        if self.polling.tick_ms == 0 {
            return Err(ConfigError::Validation(
                "polling.tick_ms must be greater than 0".to_string(),
            ));
        }

        if self.network.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "network.max_attempts must be greater than 0".to_string(),
            ));
        }

        if let LinkConfig::Wifi { ssid, .. } = &self.network.link {
            if ssid.is_empty() {
                return Err(ConfigError::Validation(
                    "network.link.ssid cannot be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}

impl ModbusConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn resync_delay(&self) -> Duration {
        Duration::from_millis(self.resync_delay_ms.unwrap_or(self.timeout_ms))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port.is_empty() {
            return Err(ConfigError::Validation(
                "modbus.port cannot be empty".to_string(),
            ));
        }

        if self.unit_id == 0 || self.unit_id > 247 {
            return Err(ConfigError::Validation(format!(
                "modbus.unit_id must be 1-247, got {}",
                self.unit_id
            )));
        }

        if self.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "modbus.timeout_ms must be greater than 0".to_string(),
            ));
        }

        match self.parity.to_lowercase().as_str() {
            "none" | "even" | "odd" => {}
            _ => {
                return Err(ConfigError::Validation(format!(
                    "invalid parity '{}' (use none, even, or odd)",
                    self.parity
                )));
            }
        }

        if !matches!(self.stop_bits, 1 | 2) {
            return Err(ConfigError::Validation(format!(
                "modbus.stop_bits must be 1 or 2, got {}",
                self.stop_bits
            )));
        }

        if !(5..=8).contains(&self.data_bits) {
            return Err(ConfigError::Validation(format!(
                "modbus.data_bits must be 5-8, got {}",
                self.data_bits
            )));
        }

        if let DirectionConfig::Gpio {
            de_pin,
            re_pin: Some(re_pin),
            ..
        } = &self.direction
        {
            if de_pin == re_pin {
                return Err(ConfigError::Validation(format!(
                    "modbus.direction: de_pin and re_pin are both {}",
                    de_pin
                )));
            }
        }

        let addresses = self.registers.input_addresses();
        let unique: HashSet<u16> = addresses.iter().copied().collect();
        if unique.len() != addresses.len() {
            return Err(ConfigError::Validation(
                "modbus.registers: input register addresses must be distinct".to_string(),
            ));
        }

        Ok(())
    }
}
