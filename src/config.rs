//! Configuration management for the level acquisition system.
//!
//! Settings are layered with Figment:
//! 1. Library defaults ([`Settings::default`])
//! 2. An optional TOML file (default `config/level_daq.toml`)
//! 3. Environment variables prefixed with `LEVEL_DAQ_`, nested with `__`
//!    (e.g. `LEVEL_DAQ_RECORDING__DEFAULT_PERIOD_S=0.5`)
//!
//! The configuration surface is fixed at process start: nothing in the
//! acquisition core reads the environment after [`Settings::load`] returns.
//!
//! # Example
//! ```no_run
//! use level_daq::config::Settings;
//!
//! # fn example() -> anyhow::Result<()> {
//! let settings = Settings::load(None)?;
//! println!("Device: {}", settings.device.name);
//! # Ok(())
//! # }
//! ```

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Default location of the optional configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/level_daq.toml";

/// Which channel-I/O implementation the session is built on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Deterministic in-process simulation
    #[default]
    Simulated,
    /// Vendor hardware driver
    Hardware,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simulated => write!(f, "simulation"),
            Self::Hardware => write!(f, "hardware"),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Device and channel identifiers
    pub device: DeviceSettings,
    /// Analog input timing and envelope
    pub acquisition: AcquisitionSettings,
    /// Recording period bounds, cadences and file naming
    pub recording: RecordingSettings,
    /// Calibration record location
    pub calibration: CalibrationSettings,
    /// Log verbosity and format
    pub logging: LoggingSettings,
}

/// Device and channel identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Device name used for the availability check
    pub name: String,
    /// Physical analog input channels (both sensors)
    pub input_channels: String,
    /// Display names for the two sensors, in channel order
    pub channel_names: Vec<String>,
    /// Digital output lines powering the sensors
    pub output_lines: Vec<String>,
    /// Channel-I/O implementation
    pub backend: BackendKind,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            name: "cDAQ1".to_string(),
            input_channels: "cDAQ1Mod2/ai0:1".to_string(),
            channel_names: vec!["Sensor #1".to_string(), "Sensor #2".to_string()],
            output_lines: vec![
                "cDAQ1Mod1/port0/line0".to_string(),
                "cDAQ1Mod1/port0/line1".to_string(),
            ],
            backend: BackendKind::Simulated,
        }
    }
}

/// Analog input timing and voltage envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Lower bound of the input range and validity envelope (V)
    pub voltage_min: f64,
    /// Upper bound of the input range and validity envelope (V)
    pub voltage_max: f64,
    /// Hardware sample rate per channel (Hz)
    pub sample_rate_hz: f64,
    /// Continuous-mode buffer size in samples per channel
    pub buffer_size: usize,
    /// Settling time after powering the sensors
    pub stabilization_delay_ms: u64,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            voltage_min: -10.0,
            voltage_max: 10.0,
            sample_rate_hz: 1000.0,
            buffer_size: 100_000,
            stabilization_delay_ms: 100,
        }
    }
}

impl AcquisitionSettings {
    /// Settling time as a `Duration`.
    pub fn stabilization_delay(&self) -> Duration {
        Duration::from_millis(self.stabilization_delay_ms)
    }
}

/// Recording period bounds, write-out cadence and file naming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingSettings {
    /// Period used when none is given (s)
    pub default_period_s: f64,
    /// Shortest accepted period (s)
    pub min_period_s: f64,
    /// Longest accepted period (s)
    pub max_period_s: f64,
    /// Flush the measurement table every K rows
    pub flush_every_rows: u64,
    /// Refresh the live display every M rows
    pub display_every_rows: u64,
    /// Required extension for measurement files
    pub file_extension: String,
    /// chrono pattern for generated measurement file names
    pub filename_pattern: String,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            default_period_s: 0.1,
            min_period_s: 0.001,
            max_period_s: 10.0,
            flush_every_rows: 10,
            display_every_rows: 10,
            file_extension: ".xlsx".to_string(),
            filename_pattern: "mesura_%Y%m%d_%H%M%S.xlsx".to_string(),
        }
    }
}

/// Calibration record location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSettings {
    /// Path of the JSON calibration record
    pub path: PathBuf,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("sensor_calibration.json"),
        }
    }
}

/// Log verbosity and output format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (pretty or compact)
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from defaults, an optional TOML file and the environment.
    ///
    /// A missing file is not an error; the defaults apply.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed, a value has the wrong
    /// type, or the merged settings fail [`Settings::validate`].
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let path = config_path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("LEVEL_DAQ_").split("__"));

        let settings: Settings = figment
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

        settings
            .validate()
            .map_err(|msg| anyhow!(msg))
            .context("Configuration validation failed")?;

        Ok(settings)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let acq = &self.acquisition;
        if acq.voltage_min >= acq.voltage_max {
            return Err(format!(
                "voltage_min ({}) must be below voltage_max ({})",
                acq.voltage_min, acq.voltage_max
            ));
        }
        if acq.sample_rate_hz <= 0.0 || !acq.sample_rate_hz.is_finite() {
            return Err(format!("Invalid sample rate: {}", acq.sample_rate_hz));
        }
        if acq.buffer_size == 0 {
            return Err("buffer_size must be greater than 0".to_string());
        }

        let rec = &self.recording;
        if rec.min_period_s <= 0.0 {
            return Err(format!("min_period_s must be positive, got {}", rec.min_period_s));
        }
        if !(rec.min_period_s..=rec.max_period_s).contains(&rec.default_period_s) {
            return Err(format!(
                "default_period_s ({}) must lie within [{}, {}]",
                rec.default_period_s, rec.min_period_s, rec.max_period_s
            ));
        }
        if rec.flush_every_rows == 0 || rec.display_every_rows == 0 {
            return Err("flush_every_rows and display_every_rows must be non-zero".to_string());
        }
        if !rec.file_extension.starts_with('.') {
            return Err(format!(
                "file_extension '{}' must start with '.'",
                rec.file_extension
            ));
        }
        let mut probe = String::new();
        if write!(probe, "{}", chrono::Local::now().format(&rec.filename_pattern)).is_err() {
            return Err(format!(
                "filename_pattern '{}' is not a valid date pattern",
                rec.filename_pattern
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        if self.device.channel_names.len() != 2 {
            return Err(format!(
                "Exactly two channel names are required, got {}",
                self.device.channel_names.len()
            ));
        }
        if self.device.output_lines.is_empty() {
            return Err("At least one digital output line is required".to_string());
        }

        Ok(())
    }

    /// Render the default measurement file name for `now`.
    ///
    /// # Errors
    ///
    /// Returns a message if the configured pattern is not a valid date format.
    pub fn default_filename<Tz>(&self, now: &DateTime<Tz>) -> std::result::Result<String, String>
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        let mut name = String::new();
        write!(name, "{}", now.format(&self.recording.filename_pattern)).map_err(|_| {
            format!(
                "filename_pattern '{}' is not a valid date pattern",
                self.recording.filename_pattern
            )
        })?;
        Ok(name)
    }

    /// Serialize the effective settings as TOML, in the layout
    /// [`Settings::load`] reads.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize settings")
    }
}
