//! Half-duplex RS-485 transport.
//!
//! An RS-485 transceiver must be switched to transmit before a frame goes out
//! and back to receive as soon as it has left the UART, otherwise the slave's
//! reply collides with our own driver. [`HalfDuplexStream`] wraps the serial
//! stream so that every Modbus frame is bracketed by
//! [`DirectionControl::before_send`] and [`DirectionControl::after_send`].

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_modbus::client;
use tokio_modbus::prelude::*;
use tokio_serial::{SerialPort, SerialStream};
use tracing::{debug, warn};

use crate::config::{DirectionConfig, ModbusConfig};
use crate::error::TransportError;

/// Upper bound on reads spent discarding stale input at the start of a frame.
const MAX_DISCARD_READS: usize = 16;

/// Switches the bus driver around outgoing frames.
///
/// Implementations only produce electrical side effects; failures are logged
/// and never surface to the caller.
pub trait DirectionControl<P> {
    /// Assert transmit-enable.
    fn before_send(&mut self, port: &mut P);

    /// Return to receive-enable.
    fn after_send(&mut self, port: &mut P);
}

/// Adapter with automatic direction switching; nothing to do.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoDirection;

impl<P> DirectionControl<P> for AutoDirection {
    fn before_send(&mut self, _port: &mut P) {}

    fn after_send(&mut self, _port: &mut P) {}
}

/// DE and /RE driven by the adapter's RTS modem line.
#[derive(Debug, Default, Clone, Copy)]
pub struct RtsDirection {
    invert: bool,
}

impl RtsDirection {
    pub fn new(invert: bool) -> Self {
        Self { invert }
    }

    fn set<P: SerialPort>(&self, port: &mut P, transmit: bool) {
        if let Err(e) = port.write_request_to_send(transmit != self.invert) {
            warn!(error = %e, transmit, "Failed to switch RTS");
        }
    }
}

impl<P: SerialPort> DirectionControl<P> for RtsDirection {
    fn before_send(&mut self, port: &mut P) {
        self.set(port, true);
    }

    fn after_send(&mut self, port: &mut P) {
        self.set(port, false);
    }
}

/// One output line of a GPIO controller.
pub trait OutputLine {
    fn set_level(&mut self, high: bool);
}

#[cfg(feature = "gpio")]
impl OutputLine for rppal::gpio::OutputPin {
    fn set_level(&mut self, high: bool) {
        if high {
            self.set_high();
        } else {
            self.set_low();
        }
    }
}

/// Stand-in line type for builds without GPIO support; never constructed.
#[cfg(not(feature = "gpio"))]
impl OutputLine for std::convert::Infallible {
    fn set_level(&mut self, _high: bool) {
        match *self {}
    }
}

#[cfg(feature = "gpio")]
pub type GpioLine = rppal::gpio::OutputPin;

#[cfg(not(feature = "gpio"))]
pub type GpioLine = std::convert::Infallible;

/// DE and /RE on separate GPIO lines.
///
/// Both lines go high for transmit and low for receive, so a single pin works
/// when DE and /RE are bridged on the board.
#[derive(Debug)]
pub struct GpioDirection<L> {
    lines: Vec<L>,
}

impl<L: OutputLine> GpioDirection<L> {
    pub fn new(lines: Vec<L>) -> Self {
        Self { lines }
    }

    fn set(&mut self, transmit: bool) {
        for line in &mut self.lines {
            line.set_level(transmit);
        }
    }
}

impl<L: OutputLine, P> DirectionControl<P> for GpioDirection<L> {
    fn before_send(&mut self, _port: &mut P) {
        self.set(true);
    }

    fn after_send(&mut self, _port: &mut P) {
        self.set(false);
    }
}

/// Claim the direction pins (BCM numbering) as outputs, driven low.
#[cfg(feature = "gpio")]
pub fn gpio_direction(de_pin: u8, re_pin: Option<u8>) -> Result<GpioDirection<GpioLine>, TransportError> {
    let gpio = rppal::gpio::Gpio::new()
        .map_err(|e| TransportError::Io(format!("GPIO controller unavailable: {}", e)))?;

    let mut lines = Vec::with_capacity(2);
    for pin in std::iter::once(de_pin).chain(re_pin) {
        let line = gpio
            .get(pin)
            .map_err(|e| TransportError::Io(format!("GPIO {} unavailable: {}", pin, e)))?
            .into_output_low();
        lines.push(line);
    }
    debug!(de_pin, ?re_pin, "Direction pins claimed");

    Ok(GpioDirection::new(lines))
}

#[cfg(not(feature = "gpio"))]
pub fn gpio_direction(_de_pin: u8, _re_pin: Option<u8>) -> Result<GpioDirection<GpioLine>, TransportError> {
    Err(TransportError::Io(
        "GPIO direction control requires the `gpio` feature".to_string(),
    ))
}

/// Serial stream that switches the transceiver around each written frame.
///
/// The first write of a frame asserts transmit; the flush that completes the
/// frame returns the bus to receive. Reads never touch the direction.
///
/// Input still pending when a frame starts belongs to an earlier transaction
/// (a reply that arrived after its timeout) and is discarded, so it cannot be
/// taken for the answer to the new request.
#[derive(Debug)]
pub struct HalfDuplexStream<S, D> {
    inner: S,
    direction: D,
    transmitting: bool,
}

impl<S, D: DirectionControl<S>> HalfDuplexStream<S, D> {
    /// Wrap a stream, forcing the bus into receive state.
    pub fn new(mut inner: S, mut direction: D) -> Self {
        direction.after_send(&mut inner);
        Self {
            inner,
            direction,
            transmitting: false,
        }
    }

    fn release(&mut self) {
        if self.transmitting {
            self.direction.after_send(&mut self.inner);
            self.transmitting = false;
        }
    }
}

impl<S: AsyncRead + Unpin, D: Unpin> AsyncRead for HalfDuplexStream<S, D> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncRead + Unpin, D> HalfDuplexStream<S, D> {
    fn discard_input(&mut self, cx: &mut Context<'_>) {
        let mut scratch = [0u8; 64];
        let mut discarded = 0;
        for _ in 0..MAX_DISCARD_READS {
            let mut buf = ReadBuf::new(&mut scratch);
            match Pin::new(&mut self.inner).poll_read(cx, &mut buf) {
                Poll::Ready(Ok(())) if !buf.filled().is_empty() => discarded += buf.filled().len(),
                _ => break,
            }
        }
        if discarded > 0 {
            debug!(bytes = discarded, "Discarded stale input before request");
        }
    }
}

impl<S, D> AsyncWrite for HalfDuplexStream<S, D>
where
    S: AsyncRead + AsyncWrite + Unpin,
    D: DirectionControl<S> + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if !this.transmitting {
            this.discard_input(cx);
            this.direction.before_send(&mut this.inner);
            this.transmitting = true;
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = ready!(Pin::new(&mut this.inner).poll_flush(cx));
        this.release();
        Poll::Ready(result)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = ready!(Pin::new(&mut this.inner).poll_shutdown(cx));
        this.release();
        Poll::Ready(result)
    }
}

/// Open the serial port described by the configuration.
pub fn open_serial(config: &ModbusConfig) -> Result<SerialStream, TransportError> {
    let parity = match config.parity.to_lowercase().as_str() {
        "even" => tokio_serial::Parity::Even,
        "odd" => tokio_serial::Parity::Odd,
        _ => tokio_serial::Parity::None,
    };

    let stop_bits = match config.stop_bits {
        2 => tokio_serial::StopBits::Two,
        _ => tokio_serial::StopBits::One,
    };

    let data_bits = match config.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        _ => tokio_serial::DataBits::Eight,
    };

    let builder = tokio_serial::new(&config.port, config.baud_rate)
        .parity(parity)
        .stop_bits(stop_bits)
        .data_bits(data_bits);

    SerialStream::open(&builder)
        .map_err(|e| TransportError::Io(format!("Serial open failed: {}", e)))
}

/// Open the serial port and attach a Modbus RTU client behind the configured
/// direction control.
pub fn connect(config: &ModbusConfig) -> Result<client::Context, TransportError> {
    let serial = open_serial(config)?;
    let slave = Slave(config.unit_id);

    let ctx = match &config.direction {
        DirectionConfig::Auto => rtu::attach_slave(HalfDuplexStream::new(serial, AutoDirection), slave),
        DirectionConfig::Rts { invert } => rtu::attach_slave(
            HalfDuplexStream::new(serial, RtsDirection::new(*invert)),
            slave,
        ),
        DirectionConfig::Gpio { de_pin, re_pin } => {
            let gpio = gpio_direction(*de_pin, *re_pin)?;
            rtu::attach_slave(HalfDuplexStream::new(serial, gpio), slave)
        }
    };

    debug!(
        port = %config.port,
        baud = config.baud_rate,
        unit_id = config.unit_id,
        "Modbus RTU transport attached"
    );

    Ok(ctx)
}
