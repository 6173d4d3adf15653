//! CLI entry point for level-daq
//!
//! Provides command-line access to:
//! - Recording runs to a measurement file
//! - Idle live monitoring of both sensors
//! - Calibration management (set, capture, reset, show)
//! - Inspecting a recorded file
//! - Listing visible devices
//! - Printing the effective configuration
//!
//! # Usage
//!
//! ```bash
//! level_daq record --period 0.1 --output mesura.xlsx --rows 600
//! level_daq monitor --interval-ms 500
//! level_daq calibrate --sensor 0 --v1 -2.0 --h1 0 --v2 2.0 --h2 5
//! level_daq show mesura.xlsx
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use level_daq::calibration::{self, CalibrationManager, SENSOR_COUNT};
use level_daq::config::{BackendKind, Settings};
use level_daq::device::{self, DaqBackend};
use level_daq::orchestrator::{pipeline_from_settings, Monitor, RecordingRun};
use level_daq::pipeline::{statistics, ProcessedReading};
use level_daq::runner;
use level_daq::session::{ChannelSession, SessionConfig};
use level_daq::{logging, storage};

#[derive(Parser)]
#[command(name = "level_daq")]
#[command(about = "Two-sensor water-level acquisition", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use the simulated backend regardless of configuration
    #[arg(long, global = true)]
    simulate: bool,

    /// Seed for the simulated signal noise
    #[arg(long, global = true)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record both sensors to a measurement file
    Record {
        /// Sampling period in seconds
        #[arg(long)]
        period: Option<f64>,

        /// Measurement file (defaults to a timestamped name)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Stop after this many rows (Ctrl+C otherwise)
        #[arg(long)]
        rows: Option<u64>,
    },

    /// Show live readings without recording
    Monitor {
        /// Polling interval
        #[arg(long, default_value = "500")]
        interval_ms: u64,

        /// Stop after this many readings (Ctrl+C otherwise)
        #[arg(long)]
        count: Option<u64>,
    },

    /// Set, capture, reset or show sensor calibration
    Calibrate {
        /// Sensor id (0 or 1)
        #[arg(long)]
        sensor: Option<usize>,

        /// First anchor voltage
        #[arg(long, allow_negative_numbers = true, requires_all = ["sensor", "h1", "v2", "h2"])]
        v1: Option<f64>,

        /// First anchor height (cm)
        #[arg(long, allow_negative_numbers = true)]
        h1: Option<f64>,

        /// Second anchor voltage
        #[arg(long, allow_negative_numbers = true)]
        v2: Option<f64>,

        /// Second anchor height (cm)
        #[arg(long, allow_negative_numbers = true)]
        h2: Option<f64>,

        /// Read the present voltage of --sensor
        #[arg(long, requires = "sensor", conflicts_with_all = ["v1", "reset"])]
        capture: bool,

        /// Clear all calibration and delete the record
        #[arg(long, conflicts_with = "v1")]
        reset: bool,

        /// Print the current calibration
        #[arg(long)]
        show: bool,
    },

    /// Print a measurement file with per-column statistics
    Show {
        /// File to load (.xlsx or .csv)
        file: PathBuf,
    },

    /// List devices visible to the backend
    Devices,

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if cli.simulate {
        settings.device.backend = BackendKind::Simulated;
    }
    logging::init_from_settings(&settings.logging).map_err(|e| anyhow!(e))?;

    match cli.command {
        Commands::Record {
            period,
            output,
            rows,
        } => record(&settings, cli.seed, period, output, rows).await,
        Commands::Monitor { interval_ms, count } => {
            monitor(&settings, cli.seed, Duration::from_millis(interval_ms), count).await
        }
        Commands::Calibrate {
            sensor,
            v1,
            h1,
            v2,
            h2,
            capture,
            reset,
            show,
        } => {
            let calibration = CalibrationManager::open(&settings.calibration.path);
            if reset {
                calibration.reset()?;
                println!("Calibration reset");
            }
            if capture {
                let sensor = sensor.ok_or_else(|| anyhow!("--capture needs --sensor"))?;
                let mut session = open_session(&settings, cli.seed)?;
                let voltage = calibration::capture_point(&mut session, sensor)?;
                println!("Sensor {sensor}: {voltage:.4} V");
            }
            if let (Some(sensor), Some(v1), Some(h1), Some(v2), Some(h2)) = (sensor, v1, h1, v2, h2) {
                calibration.set_calibration(sensor, v1, h1, v2, h2)?;
                println!("Sensor {sensor} calibrated: {v1} V -> {h1} cm, {v2} V -> {h2} cm");
            }
            if show || !(reset || capture || v1.is_some()) {
                print_calibration(&calibration);
            }
            Ok(())
        }
        Commands::Show { file } => show(&file),
        Commands::Devices => {
            let backend = device::probe_backend(settings.device.backend, cli.seed)?;
            list_devices(backend.as_ref(), &settings.device.name)
        }
        Commands::Config => {
            print!("{}", settings.to_toml()?);
            Ok(())
        }
    }
}

fn open_session(settings: &Settings, seed: Option<u64>) -> Result<ChannelSession> {
    let backend = device::probe_backend(settings.device.backend, seed)
        .context("No acquisition backend available (use --simulate)")?;
    let session = ChannelSession::new(backend, SessionConfig::from_settings(settings));
    let message = session.check_device_available()?;
    tracing::info!("{message}");
    Ok(session)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Ctrl+C handler unavailable");
        std::future::pending::<()>().await;
    }
}

fn format_reading(names: &[String; 2], reading: &ProcessedReading) -> String {
    names
        .iter()
        .zip(&reading.sensors)
        .map(|(name, s)| format!("{name}: {:8.3} {}", s.display_value(), s.display_unit()))
        .collect::<Vec<_>>()
        .join("   ")
}

async fn record(
    settings: &Settings,
    seed: Option<u64>,
    period: Option<f64>,
    output: Option<PathBuf>,
    rows: Option<u64>,
) -> Result<()> {
    let period = period.unwrap_or(settings.recording.default_period_s);
    let path = match output {
        Some(path) => path,
        None => PathBuf::from(
            settings
                .default_filename(&chrono::Local::now())
                .map_err(|e| anyhow!(e))?,
        ),
    };
    if path.exists() {
        tracing::warn!(path = %path.display(), "Overwriting existing measurement file");
    }

    let calibration = CalibrationManager::open(&settings.calibration.path);
    if !calibration.are_all_calibrated() {
        println!("Note: uncalibrated sensors are logged in volts only");
    }
    let mut session = open_session(settings, seed)?;
    let names = pipeline_from_settings(settings).names().clone();

    let mut run = RecordingRun::start(settings, &mut session, &calibration, period, &path)?;
    println!(
        "Recording to {} every {period} s ({} samples/channel). Ctrl+C to stop.",
        path.display(),
        run.block_size()
    );

    let outcome = runner::run_recording(&mut run, rows, shutdown_signal(), |tick| {
        if tick.refresh_display {
            println!("t = {:8.2} s   {}", tick.row.elapsed_s, format_reading(&names, &tick.reading));
        }
        if let Some(warnings) = &tick.warnings {
            eprintln!("Warning: {warnings}");
        }
    })
    .await;

    let summary = run.stop();
    println!(
        "Recorded {} rows ({:.2} s) to {}",
        summary.rows,
        summary.duration_s,
        summary.path.display()
    );
    if !summary.teardown.is_clean() {
        eprintln!("Release problems: {}", summary.teardown);
    }
    summary.final_flush.context("Final flush failed")?;
    let reason = outcome?;
    tracing::debug!(?reason, "Recording loop ended");
    Ok(())
}

async fn monitor(
    settings: &Settings,
    seed: Option<u64>,
    interval: Duration,
    count: Option<u64>,
) -> Result<()> {
    let calibration = CalibrationManager::open(&settings.calibration.path);
    let mut session = open_session(settings, seed)?;
    session.setup()?;
    session.begin_monitoring()?;

    let pipeline = pipeline_from_settings(settings);
    let names = pipeline.names().clone();
    let mut monitor = Monitor::new(pipeline, interval);

    let outcome = runner::run_monitor(
        &mut monitor,
        &mut session,
        &calibration,
        count,
        shutdown_signal(),
        |reading| {
            println!("{}", format_reading(&names, reading));
            if let Some(warnings) = &reading.warnings {
                eprintln!("Warning: {warnings}");
            }
        },
    )
    .await;

    session.end_monitoring();
    let report = session.teardown();
    if !report.is_clean() {
        eprintln!("Release problems: {report}");
    }
    outcome?;
    Ok(())
}

fn print_calibration(calibration: &CalibrationManager) {
    println!("Calibration record: {}", calibration.path().display());
    for id in 0..SENSOR_COUNT {
        match calibration.calibration(id) {
            Some(cal) => match (cal.point1, cal.point2) {
                (Some(p1), Some(p2)) => println!(
                    "  Sensor {id}: {:.4} V -> {:.2} cm, {:.4} V -> {:.2} cm{}",
                    p1.voltage,
                    p1.height,
                    p2.voltage,
                    p2.height,
                    if cal.is_degenerate() { " (degenerate)" } else { "" }
                ),
                _ => println!("  Sensor {id}: not calibrated"),
            },
            None => println!("  Sensor {id}: not calibrated"),
        }
    }
}

fn show(file: &Path) -> Result<()> {
    let rows = storage::load_measurements(file)?;
    if rows.is_empty() {
        bail!("{} contains no measurements", file.display());
    }

    println!("{}", storage::COLUMNS.join("\t"));
    for row in &rows {
        let cells: Vec<String> = row
            .to_array()
            .iter()
            .map(|v| if v.is_nan() { "-".to_string() } else { format!("{v:.4}") })
            .collect();
        println!("{}", cells.join("\t"));
    }

    println!();
    println!("{} rows", rows.len());
    for (col, name) in storage::COLUMNS.iter().enumerate().skip(1) {
        let values: Vec<f64> = rows.iter().map(|r| r.to_array()[col]).collect();
        let stats = statistics(&values);
        println!(
            "{name:>16}: mean {:.4}  min {:.4}  max {:.4}  std {:.4}",
            stats.mean, stats.min, stats.max, stats.std
        );
    }
    Ok(())
}

fn list_devices(backend: &dyn DaqBackend, configured: &str) -> Result<()> {
    let devices = backend.devices()?;
    println!("Backend: {}", backend.kind());
    for d in &devices {
        let marker = if d.name == configured { " *" } else { "" };
        println!("  {:<12} {}{marker}", d.name, d.product_type);
    }
    match device::check_device_available(backend, configured) {
        Ok(message) => println!("{message}"),
        Err(e) => println!("{e}"),
    }
    Ok(())
}
