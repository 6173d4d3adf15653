//! Voltage to water-height calibration for the two level sensors.
//!
//! Each sensor is calibrated with two anchor points `(voltage, height)`. The
//! height for any voltage is found by linear interpolation through the two
//! points; voltages outside the anchors extrapolate along the same line and
//! are never clamped.
//!
//! ```text
//! h = h1 + (h2 - h1) * (v - v1) / (v2 - v1)
//! ```
//!
//! When the anchors are closer than 1 mV apart the line is undefined and the
//! height of the first point is returned for every voltage.
//!
//! # Persistence
//!
//! The [`CalibrationManager`] is backed by a small JSON record:
//!
//! ```json
//! {"calibrations": [{"sensor_id": 0, "point1": [-2.0, 0.0], "point2": [2.0, 5.0]}, ...]}
//! ```
//!
//! The record is loaded when the manager is opened and rewritten on every
//! mutation. A missing or corrupt record never fails the process; sensors that
//! end up uncalibrated receive the default calibration (-2 V → 0 cm,
//! +2 V → 5 cm) and that default is persisted.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{DaqError, Result};
use crate::session::ChannelSession;

/// Number of level sensors.
pub const SENSOR_COUNT: usize = 2;

/// Anchor voltage spans below this are treated as degenerate (V).
pub const DEGENERATE_SPAN_V: f64 = 0.001;

/// Default calibration applied to uncalibrated sensors: -2 V → 0 cm.
pub const DEFAULT_POINT1: CalibrationPoint = CalibrationPoint::new(-2.0, 0.0);

/// Default calibration applied to uncalibrated sensors: +2 V → 5 cm.
pub const DEFAULT_POINT2: CalibrationPoint = CalibrationPoint::new(2.0, 5.0);

/// One anchor of the voltage → height line.
///
/// Serialized as a `[voltage, height]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, f64)", into = "(f64, f64)")]
pub struct CalibrationPoint {
    /// Sensor output (V)
    pub voltage: f64,
    /// Water height at that output (cm)
    pub height: f64,
}

impl CalibrationPoint {
    /// Create a calibration point.
    pub const fn new(voltage: f64, height: f64) -> Self {
        Self { voltage, height }
    }
}

impl From<(f64, f64)> for CalibrationPoint {
    fn from((voltage, height): (f64, f64)) -> Self {
        Self { voltage, height }
    }
}

impl From<CalibrationPoint> for (f64, f64) {
    fn from(point: CalibrationPoint) -> Self {
        (point.voltage, point.height)
    }
}

/// Two-point calibration of a single sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorCalibration {
    /// Sensor index (0 or 1)
    pub sensor_id: usize,
    /// First anchor
    pub point1: Option<CalibrationPoint>,
    /// Second anchor
    pub point2: Option<CalibrationPoint>,
}

impl SensorCalibration {
    /// Create an uncalibrated sensor entry.
    pub fn uncalibrated(sensor_id: usize) -> Self {
        Self {
            sensor_id,
            point1: None,
            point2: None,
        }
    }

    /// Create a sensor entry with both anchors set.
    pub fn from_two_points(
        sensor_id: usize,
        point1: CalibrationPoint,
        point2: CalibrationPoint,
    ) -> Self {
        Self {
            sensor_id,
            point1: Some(point1),
            point2: Some(point2),
        }
    }

    /// True when both anchors are set.
    pub fn is_calibrated(&self) -> bool {
        self.point1.is_some() && self.point2.is_some()
    }

    /// True when the anchors are too close in voltage to define a line.
    pub fn is_degenerate(&self) -> bool {
        match (self.point1, self.point2) {
            (Some(p1), Some(p2)) => (p2.voltage - p1.voltage).abs() < DEGENERATE_SPAN_V,
            _ => false,
        }
    }

    /// Convert a voltage to height, `None` when uncalibrated.
    pub fn voltage_to_height(&self, voltage: f64) -> Option<f64> {
        let (p1, p2) = (self.point1?, self.point2?);
        let span = p2.voltage - p1.voltage;
        if span.abs() < DEGENERATE_SPAN_V {
            return Some(p1.height);
        }
        Some(p1.height + (p2.height - p1.height) * (voltage - p1.voltage) / span)
    }
}

/// On-disk layout of the calibration record.
#[derive(Debug, Serialize)]
struct CalibrationRecord {
    calibrations: Vec<SensorCalibration>,
}

/// Record as read back; entries are decoded one by one so a single bad
/// entry does not discard the others.
#[derive(Debug, Deserialize)]
struct StoredRecord {
    calibrations: Vec<serde_json::Value>,
}

/// Owns the calibration of every sensor and its persisted record.
///
/// Reads take a shared lock; [`set_calibration`](Self::set_calibration) and
/// [`reset`](Self::reset) replace the in-memory entries and write the record
/// before returning.
#[derive(Debug)]
pub struct CalibrationManager {
    path: PathBuf,
    sensors: RwLock<[SensorCalibration; SENSOR_COUNT]>,
}

impl CalibrationManager {
    /// Open the calibration record at `path`.
    ///
    /// Never fails: a missing or unreadable record leaves the affected sensors
    /// on the default calibration, which is then persisted.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let manager = Self {
            path: path.into(),
            sensors: RwLock::new([
                SensorCalibration::uncalibrated(0),
                SensorCalibration::uncalibrated(1),
            ]),
        };

        if let Err(e) = manager.load() {
            warn!(path = %manager.path.display(), error = %e, "Calibration record unusable, falling back to defaults");
        }

        let mut defaulted = Vec::new();
        {
            let mut sensors = manager.sensors.write();
            for sensor in sensors.iter_mut().filter(|s| !s.is_calibrated()) {
                *sensor =
                    SensorCalibration::from_two_points(sensor.sensor_id, DEFAULT_POINT1, DEFAULT_POINT2);
                defaulted.push(sensor.sensor_id);
            }
        }

        if !defaulted.is_empty() {
            info!(sensors = ?defaulted, "Applied default calibration (-2 V -> 0 cm, +2 V -> 5 cm)");
            manager.persist_logged();
        }

        manager
    }

    /// Path of the backing record.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the calibration of one sensor and persist it.
    ///
    /// A failed write is logged and the new calibration stays active in
    /// memory; only an invalid `sensor_id` or a non-finite anchor is
    /// reported as an error.
    pub fn set_calibration(&self, sensor_id: usize, v1: f64, h1: f64, v2: f64, h2: f64) -> Result<()> {
        check_sensor_id(sensor_id)?;
        if ![v1, h1, v2, h2].iter().all(|x| x.is_finite()) {
            return Err(DaqError::Validation(format!(
                "Calibration anchors must be finite (got {v1} V -> {h1} cm, {v2} V -> {h2} cm)"
            )));
        }

        let calibration = SensorCalibration::from_two_points(
            sensor_id,
            CalibrationPoint::new(v1, h1),
            CalibrationPoint::new(v2, h2),
        );
        if calibration.is_degenerate() {
            warn!(sensor_id, v1, v2, "Calibration points closer than 1 mV; height will be constant");
        }
        self.sensors.write()[sensor_id] = calibration;

        info!(sensor_id, v1, h1, v2, h2, "Calibration updated");
        self.persist_logged();
        Ok(())
    }

    /// Snapshot of one sensor's calibration.
    pub fn calibration(&self, sensor_id: usize) -> Option<SensorCalibration> {
        self.sensors.read().get(sensor_id).cloned()
    }

    /// Snapshot of every sensor's calibration.
    pub fn calibrations(&self) -> Vec<SensorCalibration> {
        self.sensors.read().to_vec()
    }

    /// Convert a voltage to height for one sensor.
    ///
    /// `None` when the sensor is not calibrated or the id is unknown; callers
    /// fall back to showing the raw voltage.
    pub fn voltage_to_height(&self, sensor_id: usize, voltage: f64) -> Option<f64> {
        self.sensors.read().get(sensor_id)?.voltage_to_height(voltage)
    }

    /// Check if one sensor has both anchors set.
    pub fn is_sensor_calibrated(&self, sensor_id: usize) -> bool {
        self.sensors
            .read()
            .get(sensor_id)
            .is_some_and(SensorCalibration::is_calibrated)
    }

    /// Check if every sensor has both anchors set.
    pub fn are_all_calibrated(&self) -> bool {
        self.sensors.read().iter().all(SensorCalibration::is_calibrated)
    }

    /// Clear every calibration and delete the record file.
    ///
    /// The defaults are not re-applied until the manager is opened again.
    pub fn reset(&self) -> Result<()> {
        *self.sensors.write() = [
            SensorCalibration::uncalibrated(0),
            SensorCalibration::uncalibrated(1),
        ];
        info!(path = %self.path.display(), "Calibration reset");

        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DaqError::persistence(&self.path, e)),
        }
    }

    /// Write the current calibrations to the record file.
    pub fn save(&self) -> Result<()> {
        let record = CalibrationRecord {
            calibrations: self.calibrations(),
        };
        let contents = serde_json::to_string_pretty(&record)
            .map_err(|e| DaqError::persistence(&self.path, e))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| DaqError::persistence(&self.path, e))?;
        }
        std::fs::write(&self.path, contents).map_err(|e| DaqError::persistence(&self.path, e))?;

        info!(path = %self.path.display(), "Saved calibration");
        Ok(())
    }

    fn persist_logged(&self) {
        if let Err(e) = self.save() {
            warn!(error = %e, "Calibration kept in memory only");
        }
    }

    fn load(&self) -> Result<()> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "Calibration file not found");
            return Ok(());
        }

        let contents =
            std::fs::read_to_string(&self.path).map_err(|e| DaqError::persistence(&self.path, e))?;
        let record: StoredRecord =
            serde_json::from_str(&contents).map_err(|e| DaqError::persistence(&self.path, e))?;

        let mut sensors = self.sensors.write();
        for (index, raw) in record.calibrations.into_iter().enumerate() {
            let entry: SensorCalibration = match serde_json::from_value(raw) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(index, error = %e, "Skipping unreadable calibration entry");
                    continue;
                }
            };
            match sensors.get_mut(entry.sensor_id) {
                Some(slot) => *slot = entry,
                None => warn!(sensor_id = entry.sensor_id, "Ignoring calibration for unknown sensor"),
            }
        }

        info!(
            path = %self.path.display(),
            calibrated = sensors.iter().filter(|s| s.is_calibrated()).count(),
            "Loaded calibration"
        );
        Ok(())
    }
}

/// Read the present voltage of one sensor, for use as a calibration anchor.
///
/// Goes through the session's point channel, so it is rejected with
/// [`DaqError::Busy`] while a recording is active.
pub fn capture_point(session: &mut ChannelSession, sensor_id: usize) -> Result<f64> {
    check_sensor_id(sensor_id)?;
    let (v1, v2) = session.read_point()?;
    let voltage = if sensor_id == 0 { v1 } else { v2 };
    info!(sensor_id, voltage, "Captured calibration voltage");
    Ok(voltage)
}

fn check_sensor_id(sensor_id: usize) -> Result<()> {
    if sensor_id < SENSOR_COUNT {
        Ok(())
    } else {
        Err(DaqError::Validation(format!(
            "Sensor id {sensor_id} out of range (expected 0..{SENSOR_COUNT})"
        )))
    }
}
