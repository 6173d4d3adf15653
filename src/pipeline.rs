//! Reading pipeline: raw sample blocks to per-sensor readings.
//!
//! Each block is reduced to one mean voltage per channel, checked against the
//! expected voltage envelope and converted to height through the calibration
//! store. Out-of-envelope readings are flagged, never discarded or clamped.

use ndarray::{Array2, Axis};

use crate::calibration::CalibrationManager;
use crate::device::VoltageRange;
use crate::error::{DaqError, Result};

/// Channels every block must carry, one per sensor.
pub const EXPECTED_CHANNELS: usize = 2;

/// Raw volts, shape `(channels, samples)`.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBlock {
    data: Array2<f64>,
}

impl SampleBlock {
    /// Wrap a `(channels, samples)` array.
    pub fn new(data: Array2<f64>) -> Self {
        Self { data }
    }

    /// A block where every sample equals `value`.
    pub fn filled(channels: usize, samples: usize, value: f64) -> Self {
        Self::new(Array2::from_elem((channels, samples), value))
    }

    /// Number of channels (rows).
    pub fn channels(&self) -> usize {
        self.data.nrows()
    }

    /// Samples per channel (columns).
    pub fn samples(&self) -> usize {
        self.data.ncols()
    }

    /// Underlying array.
    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    /// Mean of each channel over the sample axis, `None` for an empty block.
    pub fn channel_means(&self) -> Option<Vec<f64>> {
        self.data.mean_axis(Axis(1)).map(|m| m.to_vec())
    }
}

/// Reduce a two-channel block to one mean voltage per sensor.
///
/// A block with no samples reduces to `(0.0, 0.0)`.
pub fn reduce_block(block: &SampleBlock) -> Result<(f64, f64)> {
    if block.channels() != EXPECTED_CHANNELS {
        return Err(DaqError::DataShape {
            expected: EXPECTED_CHANNELS,
            actual: block.channels(),
        });
    }
    match block.channel_means() {
        Some(means) => Ok((means[0], means[1])),
        None => Ok((0.0, 0.0)),
    }
}

/// Check one reading against the envelope.
///
/// Returns `(ok, warning)`; the warning names the sensor and the offending
/// voltage.
pub fn validate(name: &str, voltage: f64, envelope: VoltageRange) -> (bool, Option<String>) {
    if envelope.contains(voltage) {
        (true, None)
    } else {
        (
            false,
            Some(format!("{name}: voltage out of range ({voltage:.3} V)")),
        )
    }
}

/// Check both sensors; warnings are joined with `"; "`.
pub fn validate_readings(
    names: &[String; EXPECTED_CHANNELS],
    voltages: (f64, f64),
    envelope: VoltageRange,
) -> (bool, String) {
    let warnings: Vec<String> = [voltages.0, voltages.1]
        .iter()
        .zip(names)
        .filter_map(|(&v, name)| validate(name, v, envelope).1)
        .collect();
    (warnings.is_empty(), warnings.join("; "))
}

/// Height for one sensor, `None` when it is not calibrated.
pub fn to_height(calibration: &CalibrationManager, sensor_id: usize, voltage: f64) -> Option<f64> {
    calibration.voltage_to_height(sensor_id, voltage)
}

/// One sensor's processed value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    /// Mean voltage over the block (V)
    pub voltage: f64,
    /// Calibrated height (cm)
    pub height: Option<f64>,
}

impl SensorReading {
    /// Height when calibrated, otherwise the raw voltage.
    pub fn display_value(&self) -> f64 {
        self.height.unwrap_or(self.voltage)
    }

    /// Unit of [`display_value`](Self::display_value).
    pub fn display_unit(&self) -> &'static str {
        if self.height.is_some() {
            "cm"
        } else {
            "V"
        }
    }
}

/// Both sensors' readings from one block, plus envelope warnings.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedReading {
    /// Readings in sensor order
    pub sensors: [SensorReading; EXPECTED_CHANNELS],
    /// Joined envelope warnings, `None` when all readings are in range
    pub warnings: Option<String>,
}

/// Reduce, validate and convert in one step.
#[derive(Debug, Clone)]
pub struct ReadingPipeline {
    names: [String; EXPECTED_CHANNELS],
    envelope: VoltageRange,
}

impl ReadingPipeline {
    /// Create a pipeline with sensor display names and the validity envelope.
    pub fn new(names: [String; EXPECTED_CHANNELS], envelope: VoltageRange) -> Self {
        Self { names, envelope }
    }

    /// Sensor display names.
    pub fn names(&self) -> &[String; EXPECTED_CHANNELS] {
        &self.names
    }

    /// Process a raw block.
    pub fn process(
        &self,
        block: &SampleBlock,
        calibration: &CalibrationManager,
    ) -> Result<ProcessedReading> {
        let voltages = reduce_block(block)?;
        Ok(self.convert(voltages, calibration))
    }

    /// Validate and convert already-reduced voltages.
    pub fn convert(&self, voltages: (f64, f64), calibration: &CalibrationManager) -> ProcessedReading {
        let (all_ok, warnings) = validate_readings(&self.names, voltages, self.envelope);
        let reading = |id, voltage| SensorReading {
            voltage,
            height: to_height(calibration, id, voltage),
        };
        ProcessedReading {
            sensors: [reading(0, voltages.0), reading(1, voltages.1)],
            warnings: (!all_ok).then_some(warnings),
        }
    }
}

impl Default for ReadingPipeline {
    fn default() -> Self {
        Self::new(
            ["Sensor #1".to_string(), "Sensor #2".to_string()],
            VoltageRange::BIPOLAR_10V,
        )
    }
}

/// Summary statistics of a series.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Statistics {
    /// Arithmetic mean
    pub mean: f64,
    /// Smallest value
    pub min: f64,
    /// Largest value
    pub max: f64,
    /// Population standard deviation
    pub std: f64,
}

/// Statistics over the non-NaN values; all zeros when there are none.
pub fn statistics(values: &[f64]) -> Statistics {
    let finite: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if finite.is_empty() {
        return Statistics::default();
    }

    let n = finite.len() as f64;
    let mean = finite.iter().sum::<f64>() / n;
    let variance = finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Statistics {
        mean,
        min: finite.iter().copied().fold(f64::INFINITY, f64::min),
        max: finite.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        std: variance.sqrt(),
    }
}
