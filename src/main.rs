//! CLI entry point for echem-daq
//!
//! - `simulate`: run a demonstration program on a simulated instrument and
//!   print every event as a JSON line
//! - `ports`: list USB serial ports (requires the `serial` feature)
//! - `connect`: connect a serial instrument and print its identity and
//!   channel status (requires the `serial` feature)
//!
//! # Usage
//!
//! ```bash
//! echem-daq simulate --channels 2
//! echem-daq --config config/echem_daq.toml connect /dev/ttyACM0
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use echem_daq::config::{AppConfig, DEFAULT_CONFIG_PATH};
use echem_daq::elements::{
    CyclicVoltammetry, EisPotentiostatic, Element, OpenCircuit, Potential,
};
use echem_daq::events::EventKind;
use echem_daq::experiment::Experiment;
use echem_daq::logging::{self, LoggingConfig};
use echem_daq::registry::DeviceRegistry;
use echem_daq::sim::{SimBench, SimSpec};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "echem-daq")]
#[command(about = "Potentiostat control and telemetry", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a demonstration experiment on a simulated instrument
    Simulate {
        /// Number of simulated channels
        #[arg(long, default_value = "4")]
        channels: u8,

        /// Channel to run on
        #[arg(long, default_value = "0")]
        channel: u8,

        /// Give up after this many seconds
        #[arg(long, default_value = "600")]
        timeout: u64,
    },

    /// List USB serial ports
    Ports,

    /// Connect a serial instrument and print its status
    Connect {
        /// Serial port, e.g. /dev/ttyACM0 or COM3
        port: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;
    logging::init(&LoggingConfig::from_app_config(&config)?)?;
    info!(name = %config.application.name, "Starting");

    match cli.command {
        Commands::Simulate {
            channels,
            channel,
            timeout,
        } => simulate(config, channels, channel, Duration::from_secs(timeout)).await,
        Commands::Ports => list_ports(config).await,
        Commands::Connect { port } => connect(config, port).await,
    }
}

fn demonstration() -> Experiment {
    let mut experiment = Experiment::named("Demonstration");
    experiment.set_description("OCP rest, two CV cycles, then EIS");

    let rest = Element::from(OpenCircuit::new(5.0, 1.0));
    let mut cv = CyclicVoltammetry::new(
        Potential::vs_ocp(0.0),
        Potential::new(0.8),
        Potential::new(-0.2),
        Potential::vs_ocp(0.0),
        0.1,
        0.05,
    );
    cv.cycles = 2;
    let eis = EisPotentiostatic::new(1e5, 1.0, 5, Potential::vs_ocp(0.0), 0.01);

    experiment.append_element(&rest, 1);
    experiment.append_element(&Element::from(cv), 1);
    experiment.append_element(&Element::from(eis), 1);
    experiment
}

async fn simulate(config: AppConfig, channels: u8, channel: u8, timeout: Duration) -> Result<()> {
    let bench = SimBench::with_capacity(config.transport.notification_capacity);
    bench.plug(
        "sim0",
        SimSpec::new("SIM-1")
            .with_channels(channels)
            .with_firmware(config.firmware.bundled_version),
    );
    let registry = DeviceRegistry::new(Arc::new(bench), config);
    registry.connect("sim0").await?;
    let handle = registry.handler("SIM-1")?;

    let mut events = handle.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{line}");
            }
            if event.kind == EventKind::DeviceDisconnected {
                break;
            }
        }
    });

    let reason = handle
        .run_to_completion(channel, &demonstration(), timeout)
        .await?;
    info!(%reason, "Demonstration finished");

    registry.shutdown().await;
    let _ = printer.await;
    Ok(())
}

#[cfg(feature = "serial")]
fn serial_registry(config: AppConfig) -> DeviceRegistry {
    let connector = echem_daq::transport::SerialConnector::new(
        config.transport.baud_rate,
        config.transport.notification_capacity,
    );
    DeviceRegistry::new(Arc::new(connector), config)
}

#[cfg(feature = "serial")]
async fn list_ports(config: AppConfig) -> Result<()> {
    use echem_daq::transport::Connector;

    let connector = echem_daq::transport::SerialConnector::new(
        config.transport.baud_rate,
        config.transport.notification_capacity,
    );
    for port in connector.available_ports().await? {
        println!("{port}");
    }
    Ok(())
}

#[cfg(feature = "serial")]
async fn connect(config: AppConfig, port: String) -> Result<()> {
    let registry = serial_registry(config);
    let handle = registry.connect(&port).await?;
    println!("{}", serde_json::to_string_pretty(handle.info())?);
    for channel in 0..handle.channel_count() {
        println!("{}", serde_json::to_string(&handle.channel_status(channel)?)?);
    }
    registry.shutdown().await;
    Ok(())
}

#[cfg(not(feature = "serial"))]
async fn list_ports(_config: AppConfig) -> Result<()> {
    anyhow::bail!("serial support is not compiled in; rebuild with --features serial")
}

#[cfg(not(feature = "serial"))]
async fn connect(_config: AppConfig, _port: String) -> Result<()> {
    anyhow::bail!("serial support is not compiled in; rebuild with --features serial")
}
