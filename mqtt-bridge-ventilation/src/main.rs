//! MQTT bridge for a Modbus RTU ventilation controller.
//!
//! Polls the controller over RS-485 and publishes snapshots to an MQTT broker.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use mqtt_bridge_ventilation::command::PollingPolicy;
use mqtt_bridge_ventilation::config::VentilationBridgeConfig;
use mqtt_bridge_ventilation::controller::Controller;
use mqtt_bridge_ventilation::publisher::Publisher;
use mqtt_bridge_ventilation::reader::{MemoryBus, ModbusBus, RegisterReader};
use mqtt_bridge_ventilation::session::{self, SessionEvent, SessionPump};
use mqtt_bridge_ventilation::snapshot::SnapshotBuilder;
use mqtt_bridge_ventilation::supervisor::{self, Supervisor};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use ventsight_common::{LoggingConfig, TopicBuilder};

/// Channel capacity for console lines and session events.
const CHANNEL_CAPACITY: usize = 32;

/// How long to wait for the broker disconnect on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// MQTT bridge for Modbus RTU ventilation controllers.
#[derive(Parser, Debug)]
#[command(name = "mqtt-bridge-ventilation")]
#[command(about = "Polls a ventilation controller over Modbus RTU and publishes to MQTT")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "ventilation.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Serve readings from an in-memory register bank instead of the serial port.
    #[arg(long)]
    simulate: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = VentilationBridgeConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging
    let log_config = LoggingConfig {
        level: args
            .log_level
            .clone()
            .unwrap_or_else(|| config.logging.level.clone()),
        format: config.logging.format,
    };
    ventsight_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    println!("\n=== DV10 VENTILATION -> MQTT ===");
    info!("Starting mqtt-bridge-ventilation");
    info!("Loaded configuration from {:?}", args.config);

    // Broker session runs in its own task
    let (client, eventloop) = session::connect(&config.mqtt, &config.sparkplug.node_id);
    let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(CHANNEL_CAPACITY);
    let backoff = Duration::from_millis(config.mqtt.reconnect_backoff_ms);
    let pump = tokio::spawn(SessionPump::new(eventloop, event_tx, backoff).run());

    let (line_tx, line_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
    tokio::spawn(read_console(line_tx));

    let publisher = Publisher::new(
        client.clone(),
        TopicBuilder::new(
            &config.sparkplug.group_id,
            &config.sparkplug.node_id,
            &config.sparkplug.device_id,
        ),
    );
    let supervisor = Supervisor::new(
        supervisor::link_from_config(&config.network.link),
        &config.network,
    );
    let builder = SnapshotBuilder::new(
        config.modbus.registers.clone(),
        config.modbus.strict_runtime_reads,
    );
    let policy = PollingPolicy::from_config(&config.polling);
    let tick = Duration::from_millis(config.polling.tick_ms);
    let fan_mode_register = config.modbus.registers.fan_mode;

    if args.simulate {
        info!("Simulation mode, serial port not opened");
        let bus = MemoryBus::simulated(&config.modbus.registers);
        let reader = RegisterReader::new(bus, fan_mode_register);
        let mut controller = Controller::new(reader, builder, publisher, supervisor, policy);
        controller.run(line_rx, event_rx, tick).await;
    } else {
        let mut bus = ModbusBus::new(&config.modbus);
        match bus.open() {
            Ok(()) => info!(
                port = %config.modbus.port,
                baud = config.modbus.baud_rate,
                unit_id = config.modbus.unit_id,
                "Modbus RTU ready"
            ),
            Err(e) => warn!(
                port = %config.modbus.port,
                error = %e,
                "Serial port unavailable, retrying on next poll"
            ),
        }
        let reader = RegisterReader::new(bus, fan_mode_register);
        let mut controller = Controller::new(reader, builder, publisher, supervisor, policy);
        controller.run(line_rx, event_rx, tick).await;
    }

    if let Err(e) = client.disconnect().await {
        debug!(error = %e, "MQTT disconnect request failed");
    }
    // The pump stops once the disconnect closes the connection
    if tokio::time::timeout(SHUTDOWN_GRACE, pump).await.is_err() {
        debug!("MQTT event loop did not stop in time");
    }
    info!("Ventilation bridge stopped");

    Ok(())
}

/// Forward stdin lines to the control loop.
async fn read_console(tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Failed to read console input");
                return;
            }
        }
    }
}
