//! Calibration record round trips and capture through a session.

use std::time::Duration;

use level_daq::calibration::{capture_point, CalibrationManager, DEFAULT_POINT1, DEFAULT_POINT2};
use level_daq::device::{SignalProfile, SimulatedBackend};
use level_daq::session::{ChannelSession, SessionConfig};
use level_daq::DaqError;

#[test]
fn saved_calibration_reloads_identically() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sensor_calibration.json");

    let first = CalibrationManager::open(&path);
    first.set_calibration(0, 0.512, 1.0, 3.875, 42.5).unwrap();
    first.set_calibration(1, -1.25, 0.0, 1.75, 12.0).unwrap();

    let second = CalibrationManager::open(&path);
    assert!(second.are_all_calibrated());
    for sensor in 0..2 {
        for v in [-10.0, -1.25, 0.0, 0.512, 2.2, 3.875, 9.99] {
            let a = first.voltage_to_height(sensor, v).unwrap();
            let b = second.voltage_to_height(sensor, v).unwrap();
            assert!((a - b).abs() < 1e-12, "sensor {sensor} at {v} V: {a} vs {b}");
        }
    }
}

#[test]
fn conversion_is_affine_through_both_anchors() {
    let dir = tempfile::tempdir().unwrap();
    let manager = CalibrationManager::open(dir.path().join("cal.json"));
    manager.set_calibration(0, 1.0, 10.0, 3.0, 30.0).unwrap();

    assert_eq!(manager.voltage_to_height(0, 1.0), Some(10.0));
    assert_eq!(manager.voltage_to_height(0, 3.0), Some(30.0));
    // equal steps in voltage give equal steps in height, also outside the anchors
    let h = |v| manager.voltage_to_height(0, v).unwrap();
    let step = h(0.5) - h(0.0);
    for v in [-2.0, 1.5, 4.0, 8.0] {
        assert!((h(v + 0.5) - h(v) - step).abs() < 1e-9);
    }
}

#[test]
fn degenerate_anchors_return_first_height() {
    let dir = tempfile::tempdir().unwrap();
    let manager = CalibrationManager::open(dir.path().join("cal.json"));
    manager.set_calibration(1, 2.0, 7.5, 2.0005, 9.0).unwrap();

    for v in [-10.0, 0.0, 2.0, 2.0005, 10.0] {
        assert_eq!(manager.voltage_to_height(1, v), Some(7.5));
    }
    assert!(manager.is_sensor_calibrated(1));
}

#[test]
fn missing_record_gets_defaults_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cal.json");

    let manager = CalibrationManager::open(&path);
    assert!(manager.are_all_calibrated());
    assert!(path.exists());

    let text = std::fs::read_to_string(&path).unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    let entries = value["calibrations"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["sensor_id"], 0);
    assert_eq!(
        entries[0]["point1"],
        serde_json::json!([DEFAULT_POINT1.voltage, DEFAULT_POINT1.height])
    );
    assert_eq!(
        entries[1]["point2"],
        serde_json::json!([DEFAULT_POINT2.voltage, DEFAULT_POINT2.height])
    );
}

#[test]
fn partial_record_keeps_stored_sensor() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cal.json");
    std::fs::write(
        &path,
        r#"{"calibrations":[{"sensor_id":0,"point1":[0.0,0.0],"point2":[1.0,100.0]},
                            {"sensor_id":1,"point1":[0.0,0.0],"point2":null}]}"#,
    )
    .unwrap();

    let manager = CalibrationManager::open(&path);
    assert_eq!(manager.voltage_to_height(0, 0.5), Some(50.0));
    // sensor 1 had one anchor only and fell back to the default line
    assert_eq!(manager.voltage_to_height(1, 2.0), Some(5.0));
}

#[test]
fn capture_reads_the_requested_sensor() {
    let backend = SimulatedBackend::with_seed(8).with_profile(SignalProfile::constant(vec![0.4, 2.6]));
    let config = SessionConfig {
        stabilization_delay: Duration::ZERO,
        ..SessionConfig::default()
    };
    let mut session = ChannelSession::new(Box::new(backend.clone()), config);

    assert_eq!(capture_point(&mut session, 0).unwrap(), 0.4);
    assert_eq!(capture_point(&mut session, 1).unwrap(), 2.6);
    assert!(matches!(capture_point(&mut session, 2), Err(DaqError::Validation(_))));

    session.setup().unwrap();
    session.start_recording().unwrap();
    assert!(capture_point(&mut session, 0).unwrap_err().is_busy());
    session.teardown();
    assert_eq!(backend.open_channels(), 0);
}
