//! Channel I/O capability.
//!
//! The acquisition core never talks to a vendor driver directly. It is handed
//! a [`DaqBackend`] at construction and opens channels through it:
//!
//! - [`InputChannel`]: analog input, either hardware-clocked continuous
//!   sampling into a buffer or on-demand single reads
//! - [`OutputChannel`]: digital output lines powering the sensors
//!
//! [`probe_backend`] is the one place where the backend is chosen. It runs
//! once at startup and the result is passed down; nothing in the hot path
//! branches on which backend is in use.

pub mod simulated;

use crate::config::BackendKind;
use crate::error::{DaqError, Result};
use crate::pipeline::SampleBlock;

pub use simulated::{SignalProfile, SimOperation, SimulatedBackend};

/// A device reported by the backend's enumeration query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device identifier (e.g. `cDAQ1Mod1`)
    pub name: String,
    /// Product type (e.g. `NI 9201`)
    pub product_type: String,
}

impl DeviceInfo {
    /// Create a device entry.
    pub fn new(name: impl Into<String>, product_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            product_type: product_type.into(),
        }
    }
}

/// Input voltage range, also used as the validity envelope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageRange {
    /// Lower bound (V)
    pub min: f64,
    /// Upper bound (V)
    pub max: f64,
}

impl VoltageRange {
    /// ±10 V, the hardware input range.
    pub const BIPOLAR_10V: Self = Self {
        min: -10.0,
        max: 10.0,
    };

    /// Create a range.
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// True if `voltage` lies within the range (inclusive). NaN is never
    /// contained.
    pub fn contains(&self, voltage: f64) -> bool {
        (self.min..=self.max).contains(&voltage)
    }

    /// Clamp `voltage` into the range.
    pub fn clip(&self, voltage: f64) -> f64 {
        voltage.clamp(self.min, self.max)
    }
}

impl Default for VoltageRange {
    fn default() -> Self {
        Self::BIPOLAR_10V
    }
}

/// Analog input terminal configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminalConfig {
    /// Referenced single-ended
    #[default]
    Rse,
    /// Differential
    Differential,
}

/// Sample clock configuration of an input channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleTiming {
    /// Hardware-clocked buffered sampling
    Continuous {
        /// Sample rate per channel (Hz)
        rate_hz: f64,
        /// Buffer size in samples per channel
        buffer_size: usize,
    },
    /// Software-timed single reads
    OnDemand,
}

/// Configuration of an analog input channel.
#[derive(Debug, Clone, PartialEq)]
pub struct InputConfig {
    /// Physical channel string (e.g. `cDAQ1Mod2/ai0:1`)
    pub physical_channels: String,
    /// Number of channels the string expands to
    pub channel_count: usize,
    /// Input range
    pub range: VoltageRange,
    /// Terminal configuration
    pub terminal: TerminalConfig,
    /// Sample clock
    pub timing: SampleTiming,
}

impl InputConfig {
    /// Continuous single-ended input.
    pub fn continuous(
        physical_channels: impl Into<String>,
        channel_count: usize,
        range: VoltageRange,
        rate_hz: f64,
        buffer_size: usize,
    ) -> Self {
        Self {
            physical_channels: physical_channels.into(),
            channel_count,
            range,
            terminal: TerminalConfig::Rse,
            timing: SampleTiming::Continuous {
                rate_hz,
                buffer_size,
            },
        }
    }

    /// On-demand single-ended input.
    pub fn on_demand(
        physical_channels: impl Into<String>,
        channel_count: usize,
        range: VoltageRange,
    ) -> Self {
        Self {
            physical_channels: physical_channels.into(),
            channel_count,
            range,
            terminal: TerminalConfig::Rse,
            timing: SampleTiming::OnDemand,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.physical_channels.trim().is_empty() {
            return Err(DaqError::Configuration(
                "Physical channel string cannot be empty".to_string(),
            ));
        }
        if self.channel_count == 0 {
            return Err(DaqError::Configuration(
                "At least one channel is required".to_string(),
            ));
        }
        if self.range.min >= self.range.max {
            return Err(DaqError::Configuration(format!(
                "Invalid voltage range [{}, {}]",
                self.range.min, self.range.max
            )));
        }
        if let SampleTiming::Continuous {
            rate_hz,
            buffer_size,
        } = self.timing
        {
            if rate_hz <= 0.0 || !rate_hz.is_finite() {
                return Err(DaqError::Configuration(format!(
                    "Invalid sample rate: {rate_hz}"
                )));
            }
            if buffer_size == 0 {
                return Err(DaqError::Configuration(
                    "Buffer size must be greater than 0".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Configuration of a digital output channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    /// Physical lines, one level per line on write
    pub lines: Vec<String>,
}

impl OutputConfig {
    /// Create an output configuration.
    pub fn new(lines: Vec<String>) -> Self {
        Self { lines }
    }
}

/// An open analog input channel.
pub trait InputChannel: Send {
    /// Start the sample clock. On-demand channels accept this as a no-op.
    fn start(&mut self) -> Result<()>;

    /// Stop the sample clock. Stopping a stopped channel is not an error.
    fn stop(&mut self) -> Result<()>;

    /// Read `samples_per_channel` samples from every channel.
    ///
    /// Blocks until the samples are available or the device fails.
    fn read(&mut self, samples_per_channel: usize) -> Result<SampleBlock>;

    /// Release the channel. Further calls fail.
    fn close(&mut self) -> Result<()>;

    /// True between `start` and `stop`.
    fn is_running(&self) -> bool;
}

/// An open digital output channel.
pub trait OutputChannel: Send {
    /// Drive every line; `levels` has one entry per configured line.
    fn write(&mut self, levels: &[bool]) -> Result<()>;

    /// Number of configured lines.
    fn line_count(&self) -> usize;

    /// Release the channel. Further calls fail.
    fn close(&mut self) -> Result<()>;
}

/// A provider of channel I/O for one acquisition device.
pub trait DaqBackend: Send + Sync {
    /// Which implementation this is.
    fn kind(&self) -> BackendKind;

    /// Enumerate the devices visible to this backend.
    fn devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Allocate and configure an analog input channel.
    fn open_input(&self, config: &InputConfig) -> Result<Box<dyn InputChannel>>;

    /// Allocate and configure a digital output channel.
    fn open_output(&self, config: &OutputConfig) -> Result<Box<dyn OutputChannel>>;
}

/// Check whether `name` is among the devices `backend` can see.
///
/// Stateless: no session or channel is needed.
///
/// # Returns
///
/// * `Ok(message)` naming the device and the backend mode.
/// * `Err(DaqError::Configuration)` listing the available identifiers when the
///   device is missing.
/// * `Err(DaqError::Hardware)` when enumeration itself fails.
pub fn check_device_available(backend: &dyn DaqBackend, name: &str) -> Result<String> {
    let devices = backend
        .devices()
        .map_err(|e| DaqError::Hardware(format!("Device enumeration failed: {e}")))?;

    if devices.iter().any(|d| d.name == name) {
        return Ok(format!(
            "Device '{name}' available (mode: {})",
            backend.kind()
        ));
    }

    let available = if devices.is_empty() {
        "none".to_string()
    } else {
        devices
            .iter()
            .map(|d| d.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    Err(DaqError::Configuration(format!(
        "Device '{name}' not found. Available: {available}"
    )))
}

/// Select the channel I/O implementation for `kind`.
///
/// Evaluated once at startup. Builds without a vendor driver report the
/// hardware backend as unavailable instead of silently substituting the
/// simulation.
pub fn probe_backend(kind: BackendKind, seed: Option<u64>) -> Result<Box<dyn DaqBackend>> {
    match kind {
        BackendKind::Simulated => {
            let backend = match seed {
                Some(seed) => SimulatedBackend::with_seed(seed),
                None => SimulatedBackend::new(),
            };
            tracing::info!(?seed, "Using simulated acquisition backend");
            Ok(Box::new(backend))
        }
        BackendKind::Hardware => Err(DaqError::Configuration(
            "Hardware backend unavailable: this build has no vendor driver; \
             use the simulated backend"
                .to_string(),
        )),
    }
}
