//! Channel session: lifecycle of the acquisition and output channels.
//!
//! The session exclusively owns up to three channels:
//!
//! - a **continuous** input channel, hardware-clocked, used while recording
//! - a **point** input channel, on-demand, used for idle monitoring reads
//! - a **digital output** channel powering the sensors
//!
//! # State machine
//!
//! ```text
//!            setup()                start_recording()
//!   Idle ──────────────► Configured ───────────────────► Recording
//!    ▲                    │  ▲   ▲                          │
//!    │      begin_monitoring │   └──── stop_recording() ────┘
//!    │                    ▼  │ end_monitoring()             │ start/read/stop fault
//!    │                 Monitoring ── start_recording() ──►  ▼
//!    │                                                    Error
//!    └──────────────── teardown() (from any state) ─────────┘
//! ```
//!
//! Recording and monitoring never overlap: a point read while recording is
//! rejected with [`DaqError::Busy`] rather than interleaved with the
//! continuous buffer. Every operation except [`ChannelSession::teardown`]
//! reports failure through [`Result`]; teardown always completes and returns
//! a [`TeardownReport`].

use std::fmt;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::{BackendKind, Settings};
use crate::device::{
    self, DaqBackend, InputChannel, InputConfig, OutputChannel, OutputConfig, VoltageRange,
};
use crate::error::{DaqError, Result, TeardownReport};
use crate::pipeline::{reduce_block, SampleBlock, EXPECTED_CHANNELS};

/// Lifecycle state of a [`ChannelSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No channels allocated
    Idle,
    /// Channels allocated, continuous sampling stopped
    Configured,
    /// Continuous sampling running
    Recording,
    /// Idle live display through the point channel
    Monitoring,
    /// A hardware fault interrupted recording; only teardown recovers
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Configured => write!(f, "Configured"),
            Self::Recording => write!(f, "Recording"),
            Self::Monitoring => write!(f, "Monitoring"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Channel identifiers and timing for a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Device name for the availability check
    pub device_name: String,
    /// Physical analog input channels covering both sensors
    pub input_channels: String,
    /// Digital output lines powering the sensors
    pub output_lines: Vec<String>,
    /// Input range
    pub range: VoltageRange,
    /// Continuous sample rate per channel (Hz)
    pub sample_rate_hz: f64,
    /// Continuous buffer size per channel
    pub buffer_size: usize,
    /// Settling time after powering the sensors
    pub stabilization_delay: Duration,
}

impl SessionConfig {
    /// Build from application settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            device_name: settings.device.name.clone(),
            input_channels: settings.device.input_channels.clone(),
            output_lines: settings.device.output_lines.clone(),
            range: VoltageRange::new(
                settings.acquisition.voltage_min,
                settings.acquisition.voltage_max,
            ),
            sample_rate_hz: settings.acquisition.sample_rate_hz,
            buffer_size: settings.acquisition.buffer_size,
            stabilization_delay: settings.acquisition.stabilization_delay(),
        }
    }

    fn continuous_input(&self) -> InputConfig {
        InputConfig::continuous(
            self.input_channels.clone(),
            EXPECTED_CHANNELS,
            self.range,
            self.sample_rate_hz,
            self.buffer_size,
        )
    }

    fn point_input(&self) -> InputConfig {
        InputConfig::on_demand(self.input_channels.clone(), EXPECTED_CHANNELS, self.range)
    }

    fn output(&self) -> OutputConfig {
        OutputConfig::new(self.output_lines.clone())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Owner of the acquisition channels and their state machine.
pub struct ChannelSession {
    backend: Box<dyn DaqBackend>,
    config: SessionConfig,
    state: SessionState,
    continuous: Option<Box<dyn InputChannel>>,
    point: Option<Box<dyn InputChannel>>,
    output: Option<Box<dyn OutputChannel>>,
    sensors_powered: bool,
}

impl ChannelSession {
    /// Create an idle session on `backend`. No channel is allocated yet.
    pub fn new(backend: Box<dyn DaqBackend>, config: SessionConfig) -> Self {
        Self {
            backend,
            config,
            state: SessionState::Idle,
            continuous: None,
            point: None,
            output: None,
            sensors_powered: false,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True while continuous sampling runs.
    pub fn is_recording(&self) -> bool {
        self.state == SessionState::Recording
    }

    /// True after a successful `activate_sensors` and before deactivation.
    pub fn sensors_powered(&self) -> bool {
        self.sensors_powered
    }

    /// Channel identifiers and timing.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Which backend the session runs on.
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Check that the configured device is visible to the backend.
    pub fn check_device_available(&self) -> Result<String> {
        device::check_device_available(self.backend.as_ref(), &self.config.device_name)
    }

    /// Allocate the continuous, output and point channels.
    ///
    /// On any allocation failure everything already opened is released and
    /// the session stays `Idle`.
    pub fn setup(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(DaqError::NotReady(format!(
                "setup requires Idle, session is {}",
                self.state
            )));
        }

        let continuous = self
            .backend
            .open_input(&self.config.continuous_input())
            .map_err(|e| allocation_failed("continuous input", e))?;

        let mut output = match self.backend.open_output(&self.config.output()) {
            Ok(output) => output,
            Err(e) => {
                let mut report = TeardownReport::new();
                close_input(&mut report, "close continuous input", continuous);
                return Err(allocation_failed("digital output", e));
            }
        };

        let point = match self.backend.open_input(&self.config.point_input()) {
            Ok(point) => point,
            Err(e) => {
                let mut report = TeardownReport::new();
                close_input(&mut report, "close continuous input", continuous);
                report.record("close digital output", output.close());
                return Err(allocation_failed("point input", e));
            }
        };

        self.continuous = Some(continuous);
        self.output = Some(output);
        self.point = Some(point);
        self.state = SessionState::Configured;

        info!(
            mode = %self.backend.kind(),
            channels = %self.config.input_channels,
            sample_rate = self.config.sample_rate_hz,
            buffer_size = self.config.buffer_size,
            "Channels configured"
        );
        Ok(())
    }

    /// Power the sensors and wait for them to settle.
    ///
    /// Idempotent: a second call while powered returns immediately.
    pub fn activate_sensors(&mut self) -> Result<()> {
        self.require_usable("activate_sensors")?;
        if self.sensors_powered {
            return Ok(());
        }
        let output = self.output.as_mut().ok_or_else(|| {
            DaqError::NotReady("digital output channel not initialised".to_string())
        })?;

        let levels = vec![true; output.line_count()];
        output
            .write(&levels)
            .map_err(|e| DaqError::Hardware(format!("activating sensors: {e}")))?;
        self.sensors_powered = true;

        std::thread::sleep(self.config.stabilization_delay);
        info!(
            delay_ms = self.config.stabilization_delay.as_millis() as u64,
            "Sensors powered"
        );
        Ok(())
    }

    /// Switch the sensor supply off.
    pub fn deactivate_sensors(&mut self) -> Result<()> {
        let output = self.output.as_mut().ok_or_else(|| {
            DaqError::NotReady("digital output channel not initialised".to_string())
        })?;
        let levels = vec![false; output.line_count()];
        output
            .write(&levels)
            .map_err(|e| DaqError::Hardware(format!("deactivating sensors: {e}")))?;
        self.sensors_powered = false;
        debug!("Sensors unpowered");
        Ok(())
    }

    /// Enter idle monitoring.
    pub fn begin_monitoring(&mut self) -> Result<()> {
        match self.state {
            SessionState::Configured => {
                self.state = SessionState::Monitoring;
                debug!("Monitoring started");
                Ok(())
            }
            SessionState::Monitoring => Ok(()),
            SessionState::Recording => Err(DaqError::Busy(
                "cannot monitor while recording".to_string(),
            )),
            SessionState::Idle | SessionState::Error => Err(DaqError::NotReady(format!(
                "begin_monitoring requires Configured, session is {}",
                self.state
            ))),
        }
    }

    /// Leave idle monitoring. A no-op in any other state.
    pub fn end_monitoring(&mut self) {
        if self.state == SessionState::Monitoring {
            self.state = SessionState::Configured;
            debug!("Monitoring stopped");
        }
    }

    /// Start continuous sampling.
    ///
    /// Allowed from `Configured` or `Monitoring`; leaving `Monitoring` keeps
    /// the point channel allocated. A start failure puts the session in
    /// `Error`.
    pub fn start_recording(&mut self) -> Result<()> {
        match self.state {
            SessionState::Configured | SessionState::Monitoring => {}
            SessionState::Recording => {
                return Err(DaqError::NotReady("recording already started".to_string()))
            }
            SessionState::Idle | SessionState::Error => {
                return Err(DaqError::NotReady(format!(
                    "start_recording requires Configured or Monitoring, session is {}",
                    self.state
                )))
            }
        }
        let continuous = self.continuous.as_mut().ok_or_else(|| {
            DaqError::NotReady("continuous input channel not initialised".to_string())
        })?;
        if !self.sensors_powered {
            warn!("Recording started with sensors unpowered");
        }

        if let Err(e) = continuous.start() {
            error!(error = %e, "Failed to start continuous sampling");
            self.state = SessionState::Error;
            return Err(DaqError::Hardware(format!("starting acquisition: {e}")));
        }

        self.state = SessionState::Recording;
        info!(sample_rate = self.config.sample_rate_hz, "Recording started");
        Ok(())
    }

    /// Read `samples_per_channel` samples from the continuous channel.
    ///
    /// Blocks until the samples are available. A device fault puts the
    /// session in `Error`.
    pub fn read_block(&mut self, samples_per_channel: usize) -> Result<SampleBlock> {
        if self.state != SessionState::Recording {
            return Err(DaqError::NotReady(format!(
                "not recording (session is {})",
                self.state
            )));
        }
        if samples_per_channel == 0 {
            return Err(DaqError::Validation(
                "block size must be at least one sample".to_string(),
            ));
        }
        let continuous = self.continuous.as_mut().ok_or_else(|| {
            DaqError::NotReady("continuous input channel not initialised".to_string())
        })?;

        match continuous.read(samples_per_channel) {
            Ok(block) => Ok(block),
            Err(e) => {
                error!(error = %e, samples_per_channel, "Block read failed");
                self.state = SessionState::Error;
                Err(DaqError::Hardware(format!("reading samples: {e}")))
            }
        }
    }

    /// Stop continuous sampling and return to `Configured`.
    ///
    /// Idempotent: outside `Recording` this does nothing (in `Error` the
    /// channel is stopped best-effort but the state is kept). A stop failure
    /// leaves the channel sampling, so the session enters `Error`.
    pub fn stop_recording(&mut self) -> Result<()> {
        match self.state {
            SessionState::Recording => {
                match self.continuous.as_mut().map_or(Ok(()), |c| c.stop()) {
                    Ok(()) => {
                        self.state = SessionState::Configured;
                        info!("Recording stopped");
                        Ok(())
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to stop continuous sampling");
                        self.state = SessionState::Error;
                        Err(DaqError::Hardware(format!("stopping acquisition: {e}")))
                    }
                }
            }
            SessionState::Error => {
                if let Some(continuous) = self.continuous.as_mut() {
                    if let Err(e) = continuous.stop() {
                        warn!(error = %e, "Stop after fault failed");
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Read one value per sensor without disturbing the continuous buffer.
    ///
    /// - `Recording`: rejected with [`DaqError::Busy`].
    /// - `Configured`/`Monitoring`: uses the point channel, powering the
    ///   sensors first if needed.
    /// - `Idle`: opens temporary output and point channels, powers the
    ///   sensors, reads, powers them off and releases both channels.
    pub fn read_point(&mut self) -> Result<(f64, f64)> {
        match self.state {
            SessionState::Recording => Err(DaqError::Busy(
                "point read rejected while recording".to_string(),
            )),
            SessionState::Error => Err(DaqError::NotReady(
                "session faulted; teardown required".to_string(),
            )),
            SessionState::Idle => self.read_point_transient(),
            SessionState::Configured | SessionState::Monitoring => {
                self.activate_sensors()?;
                let point = self.point.as_mut().ok_or_else(|| {
                    DaqError::NotReady("point input channel not initialised".to_string())
                })?;
                let block = point
                    .read(1)
                    .map_err(|e| DaqError::Hardware(format!("point read: {e}")))?;
                reduce_block(&block)
            }
        }
    }

    fn read_point_transient(&mut self) -> Result<(f64, f64)> {
        let mut output = self
            .backend
            .open_output(&self.config.output())
            .map_err(|e| allocation_failed("temporary digital output", e))?;
        let lines = output.line_count();
        let mut report = TeardownReport::new();

        let outcome = (|| -> Result<(f64, f64)> {
            output
                .write(&vec![true; lines])
                .map_err(|e| DaqError::Hardware(format!("activating sensors: {e}")))?;
            std::thread::sleep(self.config.stabilization_delay);

            let mut point = self
                .backend
                .open_input(&self.config.point_input())
                .map_err(|e| allocation_failed("temporary point input", e))?;
            let read = point
                .read(1)
                .map_err(|e| DaqError::Hardware(format!("point read: {e}")));
            report.record("close temporary point input", point.close());
            reduce_block(&read?)
        })();

        report.record("deactivate sensors", output.write(&vec![false; lines]));
        report.record("close temporary digital output", output.close());
        if !report.is_clean() {
            warn!(failures = %report.diagnostic(), "Transient point read left release failures");
        }
        outcome
    }

    /// Release everything and return to `Idle`.
    ///
    /// Safe from any state, including after a partial setup failure. Every
    /// release step runs even if earlier ones fail; failures are collected
    /// in the returned report.
    pub fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::new();
        let from = self.state;

        if let Some(continuous) = self.continuous.as_mut() {
            if continuous.is_running() {
                report.record("stop continuous input", continuous.stop());
            }
        }
        if let Some(output) = self.output.as_mut() {
            let levels = vec![false; output.line_count()];
            report.record("deactivate sensors", output.write(&levels));
        }
        if let Some(continuous) = self.continuous.take() {
            close_input(&mut report, "close continuous input", continuous);
        }
        if let Some(point) = self.point.take() {
            close_input(&mut report, "close point input", point);
        }
        if let Some(mut output) = self.output.take() {
            report.record("close digital output", output.close());
        }

        self.sensors_powered = false;
        self.state = SessionState::Idle;

        if report.is_clean() {
            info!(from = %from, "Session torn down");
        } else {
            warn!(from = %from, failures = report.failures.len(), "Session torn down with errors");
        }
        report
    }

    fn require_usable(&self, op: &str) -> Result<()> {
        match self.state {
            SessionState::Idle | SessionState::Error => Err(DaqError::NotReady(format!(
                "{op} not allowed while {}",
                self.state
            ))),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSession")
            .field("backend", &self.backend.kind())
            .field("state", &self.state)
            .field("sensors_powered", &self.sensors_powered)
            .finish_non_exhaustive()
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        if self.state != SessionState::Idle
            || self.continuous.is_some()
            || self.point.is_some()
            || self.output.is_some()
        {
            let report = self.teardown();
            if !report.is_clean() {
                warn!(failures = %report.diagnostic(), "Errors releasing channels on drop");
            }
        }
    }
}

fn allocation_failed(what: &str, err: DaqError) -> DaqError {
    error!(channel = what, error = %err, "Channel allocation failed");
    DaqError::Configuration(format!("{what}: {err}"))
}

fn close_input(report: &mut TeardownReport, step: &str, mut channel: Box<dyn InputChannel>) {
    report.record(step, channel.close());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{SignalProfile, SimOperation, SimulatedBackend};

    fn fast_config() -> SessionConfig {
        SessionConfig {
            stabilization_delay: Duration::ZERO,
            ..SessionConfig::default()
        }
    }

    fn session() -> (ChannelSession, SimulatedBackend) {
        let backend = SimulatedBackend::with_seed(11)
            .with_profile(SignalProfile::constant(vec![1.5, -0.5]));
        (
            ChannelSession::new(Box::new(backend.clone()), fast_config()),
            backend,
        )
    }

    #[test]
    fn test_setup_allocates_three_channels() {
        let (mut session, backend) = session();
        session.setup().unwrap();
        assert_eq!(session.state(), SessionState::Configured);
        assert_eq!(backend.open_channels(), 3);
        assert!(session.setup().unwrap_err().is_not_ready());
    }

    #[test]
    fn test_setup_rolls_back_on_output_failure() {
        let (mut session, backend) = session();
        backend.fail_on(SimOperation::OpenOutput);

        let err = session.setup().unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(backend.open_channels(), 0);
    }

    #[test]
    fn test_setup_rolls_back_on_point_failure() {
        let (mut session, backend) = session();
        // the continuous input is the first open, the point input the second
        backend.fail_after(SimOperation::OpenInput, 1);

        assert!(matches!(session.setup(), Err(DaqError::Configuration(_))));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(backend.open_channels(), 0);
    }

    #[test]
    fn test_activate_is_idempotent() {
        let (mut session, backend) = session();
        assert!(session.activate_sensors().unwrap_err().is_not_ready());

        session.setup().unwrap();
        session.activate_sensors().unwrap();
        session.activate_sensors().unwrap();
        assert!(session.sensors_powered());
        assert_eq!(backend.output_levels(), vec![true, true]);
        assert_eq!(backend.write_history().len(), 1);
    }

    #[test]
    fn test_deactivate_sensors() {
        let (mut session, backend) = session();
        assert!(session.deactivate_sensors().unwrap_err().is_not_ready());

        session.setup().unwrap();
        session.activate_sensors().unwrap();
        session.deactivate_sensors().unwrap();
        assert!(!session.sensors_powered());
        assert_eq!(backend.output_levels(), vec![false, false]);
    }

    #[test]
    fn test_read_block_requires_recording() {
        let (mut session, _backend) = session();
        session.setup().unwrap();
        assert!(session.read_block(10).unwrap_err().is_not_ready());

        session.start_recording().unwrap();
        let block = session.read_block(10).unwrap();
        assert_eq!((block.channels(), block.samples()), (2, 10));
        assert!(matches!(session.read_block(0), Err(DaqError::Validation(_))));
    }

    #[test]
    fn test_monitoring_transitions() {
        let (mut session, _backend) = session();
        assert!(session.begin_monitoring().unwrap_err().is_not_ready());

        session.setup().unwrap();
        session.begin_monitoring().unwrap();
        assert_eq!(session.state(), SessionState::Monitoring);
        assert_eq!(session.read_point().unwrap(), (1.5, -0.5));

        session.start_recording().unwrap();
        assert!(session.begin_monitoring().unwrap_err().is_busy());
        session.stop_recording().unwrap();
        assert_eq!(session.state(), SessionState::Configured);

        session.begin_monitoring().unwrap();
        session.end_monitoring();
        assert_eq!(session.state(), SessionState::Configured);
    }

    #[test]
    fn test_start_failure_enters_error_state() {
        let (mut session, backend) = session();
        session.setup().unwrap();
        backend.fail_on(SimOperation::Start);

        assert!(matches!(session.start_recording(), Err(DaqError::Hardware(_))));
        assert_eq!(session.state(), SessionState::Error);
        assert!(session.read_point().unwrap_err().is_not_ready());
        assert!(session.start_recording().unwrap_err().is_not_ready());
        assert!(session.stop_recording().is_ok());

        let report = session.teardown();
        assert!(report.is_clean());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(backend.open_channels(), 0);
    }

    #[test]
    fn test_stop_failure_enters_error_state() {
        let (mut session, backend) = session();
        session.setup().unwrap();
        session.start_recording().unwrap();
        backend.fail_on(SimOperation::Stop);

        assert!(matches!(session.stop_recording(), Err(DaqError::Hardware(_))));
        assert_eq!(session.state(), SessionState::Error);
        // the continuous channel still samples, so point reads stay rejected
        assert!(session.read_point().unwrap_err().is_not_ready());
        assert!(session.start_recording().unwrap_err().is_not_ready());

        backend.clear_faults();
        let report = session.teardown();
        assert!(report.is_clean(), "{report}");
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(backend.open_channels(), 0);
    }

    #[test]
    fn test_point_read_in_configured_powers_sensors() {
        let (mut session, backend) = session();
        session.setup().unwrap();
        assert_eq!(session.read_point().unwrap(), (1.5, -0.5));
        assert!(session.sensors_powered());
        assert_eq!(backend.output_levels(), vec![true, true]);
    }

    #[test]
    fn test_transient_point_read_from_idle() {
        let (mut session, backend) = session();
        assert_eq!(session.read_point().unwrap(), (1.5, -0.5));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(backend.open_channels(), 0);
        assert_eq!(
            backend.write_history(),
            vec![vec![true, true], vec![false, false]]
        );
    }

    #[test]
    fn test_transient_point_read_failure_releases_everything() {
        let (mut session, backend) = session();
        backend.fail_on(SimOperation::Read);

        assert!(matches!(session.read_point(), Err(DaqError::Hardware(_))));
        assert_eq!(backend.open_channels(), 0);
        assert_eq!(backend.output_levels(), vec![false, false]);
    }

    #[test]
    fn test_teardown_collects_failures_and_releases() {
        let (mut session, backend) = session();
        session.setup().unwrap();
        session.activate_sensors().unwrap();
        session.start_recording().unwrap();

        backend.fail_on(SimOperation::Stop);
        backend.fail_on(SimOperation::Close);
        let report = session.teardown();

        // stop + three closes
        assert_eq!(report.failures.len(), 4);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.sensors_powered());
        assert_eq!(backend.open_channels(), 0);
        assert_eq!(backend.output_levels(), vec![false, false]);
    }

    #[test]
    fn test_drop_releases_channels() {
        let (mut session, backend) = session();
        session.setup().unwrap();
        session.start_recording().unwrap();
        drop(session);
        assert_eq!(backend.open_channels(), 0);
    }

    #[test]
    fn test_device_check_uses_configured_name() {
        let (session, _backend) = session();
        assert!(session.check_device_available().is_ok());
        assert_eq!(session.backend_kind(), BackendKind::Simulated);
    }
}
