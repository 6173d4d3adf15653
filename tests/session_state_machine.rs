//! Channel session state machine against the simulated backend.

use std::time::{Duration, Instant};

use level_daq::device::{SignalProfile, SimOperation, SimulatedBackend};
use level_daq::session::{ChannelSession, SessionConfig, SessionState};
use level_daq::DaqError;

fn fixture() -> (ChannelSession, SimulatedBackend) {
    let backend = SimulatedBackend::with_seed(2024).with_profile(SignalProfile::constant(vec![0.75, 1.25]));
    let config = SessionConfig {
        stabilization_delay: Duration::ZERO,
        ..SessionConfig::default()
    };
    (ChannelSession::new(Box::new(backend.clone()), config), backend)
}

/// Drive a fresh session into `state`.
fn session_in(state: SessionState) -> (ChannelSession, SimulatedBackend) {
    let (mut session, backend) = fixture();
    match state {
        SessionState::Idle => {}
        SessionState::Configured => session.setup().unwrap(),
        SessionState::Monitoring => {
            session.setup().unwrap();
            session.begin_monitoring().unwrap();
        }
        SessionState::Recording => {
            session.setup().unwrap();
            session.activate_sensors().unwrap();
            session.start_recording().unwrap();
        }
        SessionState::Error => {
            session.setup().unwrap();
            session.start_recording().unwrap();
            backend.fail_on(SimOperation::Read);
            assert!(session.read_block(10).is_err());
            backend.clear_faults();
        }
    }
    assert_eq!(session.state(), state);
    (session, backend)
}

const ALL_STATES: [SessionState; 5] = [
    SessionState::Idle,
    SessionState::Configured,
    SessionState::Monitoring,
    SessionState::Recording,
    SessionState::Error,
];

#[test]
fn point_read_is_busy_only_while_recording() {
    for state in ALL_STATES {
        let (mut session, _backend) = session_in(state);
        let result = session.read_point();
        match state {
            SessionState::Recording => {
                assert!(result.unwrap_err().is_busy(), "state {state}");
            }
            SessionState::Error => {
                assert!(result.unwrap_err().is_not_ready(), "state {state}");
            }
            _ => assert_eq!(result.unwrap(), (0.75, 1.25), "state {state}"),
        }
    }
}

#[test]
fn teardown_from_every_state_ends_idle() {
    for state in ALL_STATES {
        let (mut session, backend) = session_in(state);
        let report = session.teardown();
        assert!(report.is_clean(), "state {state}: {report}");
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(backend.open_channels(), 0, "state {state}");
        assert!(!session.sensors_powered());

        // a second teardown is harmless
        assert!(session.teardown().is_clean());
    }
}

#[test]
fn teardown_after_partial_setup_failure() {
    let (mut session, backend) = fixture();
    backend.fail_on(SimOperation::OpenOutput);
    assert!(matches!(session.setup(), Err(DaqError::Configuration(_))));
    assert_eq!(backend.open_channels(), 0);

    let report = session.teardown();
    assert!(report.is_clean());
    assert_eq!(session.state(), SessionState::Idle);
}

#[test]
fn teardown_reports_every_failed_step() {
    let (mut session, backend) = session_in(SessionState::Recording);
    backend.fail_on(SimOperation::Write);
    backend.fail_on(SimOperation::Close);

    let report = session.teardown();
    // deactivate write plus three channel closes
    assert_eq!(report.failures.len(), 4, "{report}");
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(backend.open_channels(), 0);

    let err = report.into_result().unwrap_err();
    assert!(err.to_string().starts_with("Teardown completed with errors"));
}

#[test]
fn recording_cycle_can_repeat() {
    let (mut session, _backend) = session_in(SessionState::Configured);
    for _ in 0..3 {
        session.start_recording().unwrap();
        let block = session.read_block(50).unwrap();
        assert_eq!(block.samples(), 50);
        session.stop_recording().unwrap();
        session.stop_recording().unwrap();
        assert_eq!(session.state(), SessionState::Configured);
    }
}

#[test]
fn recording_from_monitoring_keeps_point_channel() {
    let (mut session, backend) = session_in(SessionState::Monitoring);
    session.read_point().unwrap();
    session.start_recording().unwrap();
    assert_eq!(session.state(), SessionState::Recording);
    assert_eq!(backend.open_inputs(), 2);

    session.stop_recording().unwrap();
    assert_eq!(session.state(), SessionState::Configured);
    assert_eq!(session.read_point().unwrap(), (0.75, 1.25));
}

#[test]
fn read_block_outside_recording_is_not_ready() {
    for state in [SessionState::Idle, SessionState::Configured, SessionState::Monitoring, SessionState::Error] {
        let (mut session, _backend) = session_in(state);
        assert!(session.read_block(10).unwrap_err().is_not_ready(), "state {state}");
    }
}

#[test]
fn device_check_lists_alternatives() {
    let backend = SimulatedBackend::with_seed(1);
    let config = SessionConfig {
        device_name: "Dev1".to_string(),
        ..SessionConfig::default()
    };
    let session = ChannelSession::new(Box::new(backend), config);
    let err = session.check_device_available().unwrap_err();
    assert_eq!(
        err.to_string(),
        "Channel configuration failed: Device 'Dev1' not found. Available: cDAQ1, cDAQ1Mod1, cDAQ1Mod2"
    );
}

fn settling_session(delay: Duration) -> (ChannelSession, SimulatedBackend) {
    let backend = SimulatedBackend::with_seed(5).with_profile(SignalProfile::constant(vec![0.75, 1.25]));
    let config = SessionConfig {
        stabilization_delay: delay,
        ..SessionConfig::default()
    };
    (ChannelSession::new(Box::new(backend.clone()), config), backend)
}

#[test]
fn activation_waits_for_sensors_to_settle() {
    let delay = Duration::from_millis(60);
    let (mut session, backend) = settling_session(delay);
    session.setup().unwrap();

    let started = Instant::now();
    session.activate_sensors().unwrap();
    assert!(started.elapsed() >= delay, "returned after {:?}", started.elapsed());
    assert_eq!(backend.output_levels(), vec![true, true]);

    // already powered: no second wait
    let started = Instant::now();
    session.activate_sensors().unwrap();
    assert!(started.elapsed() < delay, "second call took {:?}", started.elapsed());
    assert_eq!(backend.write_history().len(), 1);
}

#[test]
fn idle_point_read_waits_for_sensors_to_settle() {
    let delay = Duration::from_millis(60);
    let (mut session, backend) = settling_session(delay);

    let started = Instant::now();
    assert_eq!(session.read_point().unwrap(), (0.75, 1.25));
    assert!(started.elapsed() >= delay, "returned after {:?}", started.elapsed());
    assert_eq!(backend.open_channels(), 0);
}
