//! Command-line entry point for the SSR device core.
//!
//! Runs the device against simulated hardware (or the serial MCU and scale when
//! built with `tokio_serial`):
//!
//! ```bash
//! ssr_daq cycle --count 3
//! ssr_daq record --camera 1 --duration 5s
//! ssr_daq --config config/ssr.toml config
//! ```

// Use mimalloc for improved allocation performance with many frame buffers in flight
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ssr_daq::config::Settings;
use ssr_daq::core::{CameraId, DeviceState};
use ssr_daq::storage::records::SampleRecordStore;
use ssr_daq::{logging, DeviceContext};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "ssr_daq")]
#[command(about = "Seed-setting-rate phenotyping device core", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Defaults and SSR_ environment overrides still apply.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override application.data_dir
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run measurement cycles and print the resulting records
    Cycle {
        /// Number of batches to process
        #[arg(long, default_value = "1")]
        count: u32,

        /// Drive the MCU and scale over serial instead of mock hardware
        #[cfg(feature = "tokio_serial")]
        #[arg(long)]
        serial: bool,
    },

    /// Record one camera for a fixed time
    Record {
        /// Camera id
        #[arg(long, default_value = "1")]
        camera: u8,

        /// Recording length, e.g. "5s" or "1m 30s"
        #[arg(long, default_value = "5s", value_parser = parse_duration)]
        duration: Duration,
    },

    /// Print the effective configuration
    Config,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(dir) = cli.data_dir {
        settings.application.data_dir = dir;
    }
    logging::init(&settings.application);

    match cli.command {
        #[cfg(feature = "tokio_serial")]
        Commands::Cycle { count, serial } => {
            let device = if serial {
                start_serial(settings).await?
            } else {
                DeviceContext::simulated(settings).await?
            };
            run_cycles(device, count).await
        }
        #[cfg(not(feature = "tokio_serial"))]
        Commands::Cycle { count } => {
            let device = DeviceContext::simulated(settings)
                .await
                .context("starting simulated device")?;
            run_cycles(device, count).await
        }
        Commands::Record { camera, duration } => {
            let device = DeviceContext::simulated(settings)
                .await
                .context("starting simulated device")?;
            record(device, CameraId(camera), duration).await
        }
        Commands::Config => {
            let text = toml::to_string_pretty(&settings).context("serializing configuration")?;
            println!("{text}");
            Ok(())
        }
    }
}

#[cfg(feature = "tokio_serial")]
async fn start_serial(settings: Settings) -> Result<DeviceContext> {
    use ssr_daq::hardware::mcu::McuActuator;
    use ssr_daq::hardware::mock::MockCamera;
    use ssr_daq::hardware::scale::SerialScale;
    use std::sync::Arc;

    let actuator = McuActuator::open(&settings.hardware).context("opening MCU port")?;
    let scale = SerialScale::open(&settings.hardware).context("opening scale port")?;
    let cameras: Vec<CameraId> = settings.cameras.iter().map(|c| c.id).collect();

    let mut builder = DeviceContext::builder(settings)
        .actuator(Arc::new(actuator))
        .sensor(Arc::new(scale));
    for id in cameras {
        builder = builder.camera(id, Arc::new(MockCamera::new(320, 240)));
    }
    builder.start().await.context("starting device")
}

async fn run_cycles(device: DeviceContext, count: u32) -> Result<()> {
    let sequencer = device.sequencer().clone();
    let mut states = sequencer.watch_state();

    for n in 1..=count {
        let batch = sequencer.start_cycle().await.context("starting cycle")?;
        info!(%batch, n, count, "Cycle started");

        // Wait for the cycle to leave Idle and come back, or fault.
        loop {
            states
                .changed()
                .await
                .context("sequencer stopped during cycle")?;
            let state = *states.borrow_and_update();
            if state == DeviceState::Idle {
                break;
            }
            if state == DeviceState::Fault {
                warn!(%batch, "Cycle faulted, resetting");
                sequencer.reset().await.context("resetting after fault")?;
                break;
            }
        }
    }

    let records = device.store().load_all().await.context("loading records")?;
    for record in records.iter().rev().take(count as usize).rev() {
        println!("{}", serde_json::to_string_pretty(record)?);
    }

    device.shutdown().await.context("shutting down")?;
    Ok(())
}

async fn record(device: DeviceContext, camera: CameraId, duration: Duration) -> Result<()> {
    if device.capture().hub(camera).is_err() {
        device.shutdown().await.context("shutting down")?;
        bail!("camera {camera} is not configured");
    }

    let session = device
        .recording()
        .start_recording(camera)
        .await
        .context("starting recording")?;
    info!(%session, %camera, ?duration, "Recording");
    tokio::time::sleep(duration).await;

    let summary = device
        .recording()
        .stop_recording(session)
        .await
        .context("stopping recording")?;
    println!(
        "session {} camera {}: {} frames written, {} dropped -> {}",
        summary.session_id,
        summary.camera,
        summary.frames_written,
        summary.frames_dropped,
        summary.output.display()
    );

    device.shutdown().await.context("shutting down")?;
    Ok(())
}
