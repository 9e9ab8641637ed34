//! Single-register Modbus transactions against the ventilation controller.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use tokio_modbus::client::{self, Reader, Writer};
use tracing::{debug, info, warn};

use crate::config::{ModbusConfig, RegisterMap};
use crate::error::{CommandError, TransportError, ValidationError};
use crate::transport;

/// Fixed-point divisor of scaled registers (one decimal place).
pub const SCALE_DIVISOR: f32 = 10.0;

/// Register-level access to a Modbus slave.
pub trait RegisterBus {
    /// Read one input register.
    fn read_input_register(
        &mut self,
        address: u16,
    ) -> impl Future<Output = Result<u16, TransportError>>;

    /// Write one holding register.
    fn write_holding_register(
        &mut self,
        address: u16,
        value: u16,
    ) -> impl Future<Output = Result<(), TransportError>>;
}

/// Opens a fresh RTU client context.
pub type Connector = Box<dyn FnMut() -> Result<client::Context, TransportError> + Send>;

/// Modbus RTU client bound to one slave.
///
/// The transport is opened on first use and dropped after a timeout or I/O
/// failure. The next transaction then waits out a quiet period, so a late
/// reply has arrived and can be discarded, and reopens the transport.
pub struct ModbusBus {
    connector: Connector,
    ctx: Option<client::Context>,
    timeout: Duration,
    resync_delay: Duration,
    resync_pending: bool,
}

impl ModbusBus {
    /// Bus over the configured serial port. Nothing is opened yet.
    pub fn new(config: &ModbusConfig) -> Self {
        let (timeout, resync_delay) = (config.timeout(), config.resync_delay());
        let config = config.clone();
        Self::with_connector(
            Box::new(move || transport::connect(&config)),
            timeout,
            resync_delay,
        )
    }

    pub fn with_connector(connector: Connector, timeout: Duration, resync_delay: Duration) -> Self {
        Self {
            connector,
            ctx: None,
            timeout,
            resync_delay,
            resync_pending: false,
        }
    }

    /// Open the transport now instead of on the first transaction.
    pub fn open(&mut self) -> Result<(), TransportError> {
        self.context().map(|_| ())
    }

    pub fn is_open(&self) -> bool {
        self.ctx.is_some()
    }

    async fn prepare(&mut self) -> Result<&mut client::Context, TransportError> {
        if self.resync_pending {
            tokio::time::sleep(self.resync_delay).await;
            self.resync_pending = false;
        }
        self.context()
    }

    fn context(&mut self) -> Result<&mut client::Context, TransportError> {
        let ctx = match self.ctx.take() {
            Some(ctx) => ctx,
            None => (self.connector)().inspect_err(|e| {
                warn!(error = %e, "Failed to open Modbus transport");
            })?,
        };
        Ok(self.ctx.insert(ctx))
    }

    /// Track the outcome of a transaction; a stalled or broken link is dropped.
    fn settle<T>(&mut self, result: Result<T, TransportError>) -> Result<T, TransportError> {
        if let Err(e @ (TransportError::Timeout | TransportError::Io(_))) = &result {
            debug!(error = %e, "Dropping Modbus transport for resync");
            self.ctx = None;
            self.resync_pending = true;
        }
        result
    }
}

impl std::fmt::Debug for ModbusBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusBus")
            .field("open", &self.ctx.is_some())
            .field("timeout", &self.timeout)
            .field("resync_delay", &self.resync_delay)
            .field("resync_pending", &self.resync_pending)
            .finish()
    }
}

impl RegisterBus for ModbusBus {
    async fn read_input_register(&mut self, address: u16) -> Result<u16, TransportError> {
        let timeout = self.timeout;
        let ctx = self.prepare().await?;
        let result = tokio::time::timeout(timeout, ctx.read_input_registers(address, 1))
            .await
            .map_err(|_| TransportError::Timeout)
            .and_then(|r| r.map_err(|e| TransportError::Io(e.to_string())))
            .and_then(|r| r.map_err(|e| TransportError::Exception(format!("{:?}", e))))
            .and_then(|values| values.first().copied().ok_or(TransportError::EmptyResponse));
        self.settle(result)
    }

    async fn write_holding_register(&mut self, address: u16, value: u16) -> Result<(), TransportError> {
        let timeout = self.timeout;
        let ctx = self.prepare().await?;
        let result = tokio::time::timeout(timeout, ctx.write_single_register(address, value))
            .await
            .map_err(|_| TransportError::Timeout)
            .and_then(|r| r.map_err(|e| TransportError::Io(e.to_string())))
            .and_then(|r| r.map_err(|e| TransportError::Exception(format!("{:?}", e))));
        self.settle(result)
    }
}

/// In-memory register bank.
///
/// Backs `--simulate` runs and tests; addresses marked failing return
/// [`TransportError::Timeout`], unknown addresses an exception response.
#[derive(Debug, Default, Clone)]
pub struct MemoryBus {
    registers: HashMap<u16, u16>,
    failing: HashSet<u16>,
    reads: Vec<u16>,
    writes: Vec<(u16, u16)>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bank holding plausible readings for every mapped register.
    pub fn simulated(map: &RegisterMap) -> Self {
        Self::new()
            .with_register(map.heat_exchanger_efficiency, 823)
            .with_register(map.run_mode, 2)
            .with_register(map.outdoor_temp, 54)
            .with_register(map.supply_air_temp, 195)
            .with_register(map.supply_air_setpoint_temp, 200)
            .with_register(map.exhaust_air_temp, 98)
            .with_register(map.extract_air_temp, 221)
            .with_register(map.supply_air_pressure, 1205)
            .with_register(map.extract_air_pressure, 1180)
            .with_register(map.supply_air_flow, 3400)
            .with_register(map.extract_air_flow, 3350)
            .with_register(map.extra_supply_air_flow, 120)
            .with_register(map.extra_extract_air_flow, 115)
            .with_register(map.supply_fan_runtime, 18422)
            .with_register(map.extract_fan_runtime, 18419)
            .with_register(map.fan_mode, 2)
    }

    pub fn with_register(mut self, address: u16, value: u16) -> Self {
        self.registers.insert(address, value);
        self
    }

    /// Make every transaction on `address` fail.
    pub fn with_failure(mut self, address: u16) -> Self {
        self.failing.insert(address);
        self
    }

    pub fn set_failing(&mut self, address: u16, failing: bool) {
        if failing {
            self.failing.insert(address);
        } else {
            self.failing.remove(&address);
        }
    }

    /// Addresses read so far, in order.
    pub fn reads(&self) -> &[u16] {
        &self.reads
    }

    /// Successful writes so far, as `(address, value)`.
    pub fn writes(&self) -> &[(u16, u16)] {
        &self.writes
    }

    pub fn register(&self, address: u16) -> Option<u16> {
        self.registers.get(&address).copied()
    }
}

impl RegisterBus for MemoryBus {
    async fn read_input_register(&mut self, address: u16) -> Result<u16, TransportError> {
        self.reads.push(address);
        if self.failing.contains(&address) {
            return Err(TransportError::Timeout);
        }
        self.registers
            .get(&address)
            .copied()
            .ok_or_else(|| TransportError::Exception("IllegalDataAddress".to_string()))
    }

    async fn write_holding_register(&mut self, address: u16, value: u16) -> Result<(), TransportError> {
        if self.failing.contains(&address) {
            return Err(TransportError::Timeout);
        }
        self.registers.insert(address, value);
        self.writes.push((address, value));
        Ok(())
    }
}

/// Operating mode written to the fan-mode holding register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanMode {
    Off = 0,
    Reduced = 1,
    Normal = 2,
    Auto = 3,
}

impl FanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FanMode::Off => "Off",
            FanMode::Reduced => "Reduced",
            FanMode::Normal => "Normal",
            FanMode::Auto => "Auto",
        }
    }
}

impl TryFrom<u16> for FanMode {
    type Error = ValidationError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FanMode::Off),
            1 => Ok(FanMode::Reduced),
            2 => Ok(FanMode::Normal),
            3 => Ok(FanMode::Auto),
            other => Err(ValidationError::FanMode(other)),
        }
    }
}

impl std::fmt::Display for FanMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", *self as u16, self.as_str())
    }
}

/// Decodes single registers and reports per-register failures.
#[derive(Debug)]
pub struct RegisterReader<B> {
    bus: B,
    fan_mode_register: u16,
}

impl<B: RegisterBus> RegisterReader<B> {
    pub fn new(bus: B, fan_mode_register: u16) -> Self {
        Self {
            bus,
            fan_mode_register,
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Read a register holding a value with one implied decimal place.
    pub async fn read_scaled(&mut self, address: u16) -> Result<f32, TransportError> {
        self.read_raw(address)
            .await
            .map(|raw| raw as f32 / SCALE_DIVISOR)
    }

    /// Read a register as-is.
    pub async fn read_raw(&mut self, address: u16) -> Result<u16, TransportError> {
        self.bus
            .read_input_register(address)
            .await
            .inspect_err(|e| warn!(register = address, error = %e, "Reg {} error: {}", address, e))
    }

    /// Write the fan operating mode.
    ///
    /// Modes outside 0-3 are rejected before anything is sent.
    pub async fn write_fan_mode(&mut self, mode: u16) -> Result<FanMode, CommandError> {
        let mode = FanMode::try_from(mode).inspect_err(|e| warn!("{}", e))?;

        match self
            .bus
            .write_holding_register(self.fan_mode_register, mode as u16)
            .await
        {
            Ok(()) => {
                info!("Fan mode {} OK", mode);
                Ok(mode)
            }
            Err(e) => {
                warn!(register = self.fan_mode_register, error = %e, "Fan mode write failed");
                Err(e.into())
            }
        }
    }
}
