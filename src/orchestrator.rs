//! Session orchestration: recording runs and idle monitoring.
//!
//! A [`RecordingRun`] ties the user-chosen sampling period `T` to the
//! hardware sample rate `R`. Every tick reads one block of
//! `N = max(1, round(R * T))` samples per channel, reduces it to one row and
//! appends the row to the measurement sink. Row `k` is stamped `k * T`, never
//! the wall clock, so rows are evenly spaced however late a tick fires.
//!
//! The orchestrator owns no timer. A host loop (see [`crate::runner`]) calls
//! [`RecordingRun::tick`] or [`Monitor::tick`] at fixed intervals.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::calibration::CalibrationManager;
use crate::config::Settings;
use crate::device::VoltageRange;
use crate::error::{DaqError, Result, TeardownReport};
use crate::pipeline::{ProcessedReading, ReadingPipeline};
use crate::session::{ChannelSession, SessionState};
use crate::storage::{self, MeasurementRow, TabularSink};
use crate::validation;

/// Points kept by a [`PlotTrace`] unless told otherwise.
pub const DEFAULT_TRACE_CAPACITY: usize = 10_000;

/// Samples per channel read for one period: `max(1, round(rate * period))`.
pub fn block_size(period_s: f64, sample_rate_hz: f64) -> usize {
    let n = (sample_rate_hz * period_s).round();
    if n.is_finite() && n >= 1.0 {
        n as usize
    } else {
        1
    }
}

/// Build the reading pipeline described by `settings`.
pub fn pipeline_from_settings(settings: &Settings) -> ReadingPipeline {
    let name = |i: usize| {
        settings
            .device
            .channel_names
            .get(i)
            .cloned()
            .unwrap_or_else(|| format!("Sensor #{}", i + 1))
    };
    ReadingPipeline::new(
        [name(0), name(1)],
        VoltageRange::new(
            settings.acquisition.voltage_min,
            settings.acquisition.voltage_max,
        ),
    )
}

/// Bounded display history of `(time, value1, value2)`.
///
/// Values are heights for calibrated sensors and raw voltages otherwise.
#[derive(Debug, Clone)]
pub struct PlotTrace {
    points: VecDeque<(f64, f64, f64)>,
    capacity: usize,
}

impl PlotTrace {
    /// Create an empty trace holding at most `capacity` points.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity.min(DEFAULT_TRACE_CAPACITY)),
            capacity,
        }
    }

    /// Append a point, evicting the oldest when full.
    pub fn push(&mut self, time: f64, reading: &ProcessedReading) {
        if self.points.len() == self.capacity {
            self.points.pop_front();
        }
        self.points.push_back((
            time,
            reading.sensors[0].display_value(),
            reading.sensors[1].display_value(),
        ));
    }

    /// Points, oldest first.
    pub fn points(&self) -> impl Iterator<Item = &(f64, f64, f64)> {
        self.points.iter()
    }

    /// Most recent point.
    pub fn last(&self) -> Option<(f64, f64, f64)> {
        self.points.back().copied()
    }

    /// Number of points held.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True before the first push or after [`clear`](Self::clear).
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Drop every point, keeping the capacity.
    pub fn clear(&mut self) {
        self.points.clear();
    }
}

impl Default for PlotTrace {
    fn default() -> Self {
        Self::new(DEFAULT_TRACE_CAPACITY)
    }
}

/// What one recording tick produced.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    /// Row appended to the sink
    pub row: MeasurementRow,
    /// Full reading, including display values
    pub reading: ProcessedReading,
    /// Envelope warnings for this row
    pub warnings: Option<String>,
    /// True every M rows; the display should redraw
    pub refresh_display: bool,
    /// True if the sink was flushed successfully during this tick
    pub flushed: bool,
    /// Sink failure during this tick; the run continues and the next flush
    /// retries
    pub storage_error: Option<String>,
}

/// Result of a finished run.
#[derive(Debug)]
pub struct RunSummary {
    /// Measurement file
    pub path: PathBuf,
    /// Rows produced
    pub rows: u64,
    /// Samples read per channel
    pub samples: u64,
    /// Recorded span, `rows * T` (s)
    pub duration_s: f64,
    /// Outcome of the final flush and close
    pub final_flush: Result<()>,
    /// Release failures while stopping
    pub teardown: TeardownReport,
}

/// One recording run from start to stop.
///
/// Borrows the session for its whole lifetime, so nothing else can read
/// points or reconfigure channels while it is active. Dropping a run without
/// calling [`stop`](Self::stop) still stops, flushes and tears down.
pub struct RecordingRun<'a> {
    session: &'a mut ChannelSession,
    calibration: &'a CalibrationManager,
    pipeline: ReadingPipeline,
    sink: Box<dyn TabularSink>,
    period_s: f64,
    block_size: usize,
    flush_every: u64,
    display_every: u64,
    rows: u64,
    samples: u64,
    trace: PlotTrace,
    finished: Option<(Result<()>, TeardownReport)>,
}

impl<'a> RecordingRun<'a> {
    /// Validate the request and bring the session into `Recording`.
    ///
    /// Sequence: validate period and file name, `setup` (when the session
    /// is still idle), `activate_sensors`, create the sink,
    /// `start_recording`. Any failure after validation tears the session
    /// down before the error is returned.
    pub fn start(
        settings: &Settings,
        session: &'a mut ChannelSession,
        calibration: &'a CalibrationManager,
        period_s: f64,
        path: &Path,
    ) -> Result<Self> {
        let rec = &settings.recording;
        validation::validate_period_within(period_s, rec.min_period_s, rec.max_period_s)?;
        validation::validate_filename_with_extension(&path.to_string_lossy(), &rec.file_extension)?;

        let sink = match prepare(session, path) {
            Ok(sink) => sink,
            Err(e) => {
                error!(error = %e, "Recording run failed to start");
                let report = session.teardown();
                if !report.is_clean() {
                    warn!(failures = %report.diagnostic(), "Teardown after failed start");
                }
                return Err(e);
            }
        };

        let block_size = block_size(period_s, session.config().sample_rate_hz);
        info!(
            path = %path.display(),
            period_s,
            block_size,
            "Recording run started"
        );

        Ok(Self {
            session,
            calibration,
            pipeline: pipeline_from_settings(settings),
            sink,
            period_s,
            block_size,
            flush_every: rec.flush_every_rows.max(1),
            display_every: rec.display_every_rows.max(1),
            rows: 0,
            samples: 0,
            trace: PlotTrace::default(),
            finished: None,
        })
    }

    /// Samples per channel read each tick.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Sampling period (s).
    pub fn period_s(&self) -> f64 {
        self.period_s
    }

    /// Rows produced so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Samples read per channel since the run started.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Display history of this run.
    pub fn trace(&self) -> &PlotTrace {
        &self.trace
    }

    /// Measurement file.
    pub fn path(&self) -> &Path {
        self.sink.path()
    }

    /// True once the run was aborted or stopped.
    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    /// Read one block, log one row.
    ///
    /// A read or reduction failure aborts the run: recording stops, rows
    /// accepted so far are flushed, the session is torn down and the error
    /// is returned. Sink failures are reported in the outcome and do not
    /// abort.
    pub fn tick(&mut self) -> Result<TickOutcome> {
        if self.finished.is_some() {
            return Err(DaqError::NotReady("recording run has finished".to_string()));
        }

        let reading = match self
            .session
            .read_block(self.block_size)
            .and_then(|block| self.pipeline.process(&block, self.calibration))
        {
            Ok(reading) => reading,
            Err(e) => {
                if e.is_fatal_to_run() {
                    error!(error = %e, rows = self.rows, "Recording aborted");
                    self.finish();
                }
                return Err(e);
            }
        };

        let elapsed_s = self.rows as f64 * self.period_s;
        let row = MeasurementRow {
            elapsed_s,
            voltage1: reading.sensors[0].voltage,
            voltage2: reading.sensors[1].voltage,
            height1: reading.sensors[0].height,
            height2: reading.sensors[1].height,
        };
        if let Some(warnings) = &reading.warnings {
            warn!(elapsed_s, %warnings, "Reading outside voltage envelope");
        }

        self.rows += 1;
        self.samples += self.block_size as u64;
        self.trace.push(elapsed_s, &reading);

        let mut storage_error = None;
        if let Err(e) = self.sink.append(&[row]) {
            warn!(error = %e, "Failed to append measurement row");
            storage_error = Some(e.to_string());
        }

        let mut flushed = false;
        if self.rows % self.flush_every == 0 {
            match self.sink.flush() {
                Ok(()) => flushed = true,
                Err(e) => {
                    warn!(error = %e, "Periodic flush failed; will retry");
                    storage_error = Some(e.to_string());
                }
            }
        }

        debug!(row = self.rows, elapsed_s, flushed, "Tick");
        Ok(TickOutcome {
            row,
            warnings: reading.warnings.clone(),
            reading,
            refresh_display: self.rows % self.display_every == 0,
            flushed,
            storage_error,
        })
    }

    /// Stop recording, flush and close the sink, tear the session down.
    pub fn stop(mut self) -> RunSummary {
        let (final_flush, teardown) = match self.finished.take() {
            Some(done) => done,
            None => {
                self.finish();
                self.finished
                    .take()
                    .unwrap_or_else(|| (Ok(()), TeardownReport::new()))
            }
        };
        // keep Drop from finishing a second time
        self.finished = Some((Ok(()), TeardownReport::new()));

        let summary = RunSummary {
            path: self.sink.path().to_path_buf(),
            rows: self.rows,
            samples: self.samples,
            duration_s: self.rows as f64 * self.period_s,
            final_flush,
            teardown,
        };
        info!(
            path = %summary.path.display(),
            rows = summary.rows,
            duration_s = summary.duration_s,
            "Recording run finished"
        );
        summary
    }

    fn finish(&mut self) {
        if self.finished.is_some() {
            return;
        }
        let mut report = TeardownReport::new();
        report.record("stop recording", self.session.stop_recording());

        let final_flush = self.sink.close();
        if let Err(e) = &final_flush {
            error!(error = %e, "Final flush failed");
        }

        report.merge(self.session.teardown());
        self.finished = Some((final_flush, report));
    }
}

impl Drop for RecordingRun<'_> {
    fn drop(&mut self) {
        if self.finished.is_none() {
            warn!("Recording run dropped without stop; finishing");
            self.finish();
        }
    }
}

impl std::fmt::Debug for RecordingRun<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingRun")
            .field("path", &self.sink.path())
            .field("period_s", &self.period_s)
            .field("block_size", &self.block_size)
            .field("rows", &self.rows)
            .field("finished", &self.finished.is_some())
            .finish_non_exhaustive()
    }
}

fn prepare(session: &mut ChannelSession, path: &Path) -> Result<Box<dyn TabularSink>> {
    if session.state() == SessionState::Idle {
        session.setup()?;
    }
    session.activate_sensors()?;
    let sink = storage::sink_for_path(path)?;
    session.start_recording()?;
    Ok(sink)
}

/// Idle live display through the point channel.
#[derive(Debug, Clone)]
pub struct Monitor {
    pipeline: ReadingPipeline,
    interval: Duration,
    ticks: u64,
    trace: PlotTrace,
}

impl Monitor {
    /// Create a monitor polled every `interval`.
    pub fn new(pipeline: ReadingPipeline, interval: Duration) -> Self {
        Self {
            pipeline,
            interval,
            ticks: 0,
            trace: PlotTrace::default(),
        }
    }

    /// Polling interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Display history; point `k` is stamped `k * interval`.
    pub fn trace(&self) -> &PlotTrace {
        &self.trace
    }

    /// Take one point reading.
    ///
    /// Returns [`DaqError::Busy`] while the session is recording; the trace
    /// is left untouched on any failure.
    pub fn tick(
        &mut self,
        session: &mut ChannelSession,
        calibration: &CalibrationManager,
    ) -> Result<ProcessedReading> {
        let voltages = session.read_point()?;
        let reading = self.pipeline.convert(voltages, calibration);

        let t = self.ticks as f64 * self.interval.as_secs_f64();
        self.trace.push(t, &reading);
        self.ticks += 1;
        Ok(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{SignalProfile, SimOperation, SimulatedBackend};
    use crate::session::SessionConfig;

    fn fixture() -> (ChannelSession, SimulatedBackend, tempfile::TempDir, CalibrationManager) {
        let backend = SimulatedBackend::with_seed(5)
            .with_profile(SignalProfile::constant(vec![1.0, -1.0]));
        let config = SessionConfig {
            stabilization_delay: Duration::ZERO,
            ..SessionConfig::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let calibration = CalibrationManager::open(dir.path().join("cal.json"));
        (
            ChannelSession::new(Box::new(backend.clone()), config),
            backend,
            dir,
            calibration,
        )
    }

    #[test]
    fn test_block_size() {
        assert_eq!(block_size(0.1, 1000.0), 100);
        assert_eq!(block_size(0.0015, 1000.0), 2);
        assert_eq!(block_size(0.0001, 1000.0), 1);
        assert_eq!(block_size(10.0, 1000.0), 10_000);
    }

    #[test]
    fn test_elapsed_time_comes_from_row_index() {
        let (mut session, _backend, dir, calibration) = fixture();
        let settings = Settings::default();
        let path = dir.path().join("run.xlsx");
        let period = 0.25;

        let mut run = RecordingRun::start(&settings, &mut session, &calibration, period, &path).unwrap();
        assert_eq!(run.block_size(), 250);
        for k in 0..7u32 {
            let outcome = run.tick().unwrap();
            assert_eq!(outcome.row.elapsed_s, f64::from(k) * period);
        }
        assert_eq!(run.samples(), 7 * 250);

        let summary = run.stop();
        assert_eq!(summary.rows, 7);
        assert_eq!(summary.duration_s, 7.0 * period);
        assert!(summary.final_flush.is_ok());
        assert!(summary.teardown.is_clean());
    }

    #[test]
    fn test_flush_and_display_cadence() {
        let (mut session, _backend, dir, calibration) = fixture();
        let mut settings = Settings::default();
        settings.recording.flush_every_rows = 3;
        settings.recording.display_every_rows = 2;
        let path = dir.path().join("run.xlsx");

        let mut run = RecordingRun::start(&settings, &mut session, &calibration, 0.01, &path).unwrap();
        let outcomes: Vec<TickOutcome> = (0..6).map(|_| run.tick().unwrap()).collect();
        let flushed: Vec<bool> = outcomes.iter().map(|o| o.flushed).collect();
        let refresh: Vec<bool> = outcomes.iter().map(|o| o.refresh_display).collect();
        assert_eq!(flushed, vec![false, false, true, false, false, true]);
        assert_eq!(refresh, vec![false, true, false, true, false, true]);
        assert_eq!(run.trace().len(), 6);
        drop(run);

        assert_eq!(storage::load_measurements(&path).unwrap().len(), 6);
    }

    #[test]
    fn test_heights_follow_calibration() {
        let (mut session, _backend, dir, calibration) = fixture();
        // defaults: -2 V -> 0 cm, 2 V -> 5 cm
        let path = dir.path().join("run.xlsx");
        let mut run =
            RecordingRun::start(&Settings::default(), &mut session, &calibration, 0.1, &path).unwrap();

        let outcome = run.tick().unwrap();
        assert_eq!(outcome.row.voltage1, 1.0);
        assert_eq!(outcome.row.height1, Some(3.75));
        assert_eq!(outcome.row.height2, Some(1.25));
        assert!(outcome.warnings.is_none());
        run.stop();
    }

    #[test]
    fn test_invalid_request_leaves_session_idle() {
        let (mut session, backend, dir, calibration) = fixture();
        let settings = Settings::default();

        let err = RecordingRun::start(&settings, &mut session, &calibration, 20.0, &dir.path().join("a.xlsx"))
            .unwrap_err();
        assert!(matches!(err, DaqError::Validation(_)));

        let err = RecordingRun::start(&settings, &mut session, &calibration, 0.1, &dir.path().join("a.txt"))
            .unwrap_err();
        assert!(matches!(err, DaqError::Validation(_)));

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(backend.open_channels(), 0);
    }

    #[test]
    fn test_start_failure_tears_down() {
        let (mut session, backend, dir, calibration) = fixture();
        backend.fail_on(SimOperation::Start);

        let err = RecordingRun::start(
            &Settings::default(),
            &mut session,
            &calibration,
            0.1,
            &dir.path().join("run.xlsx"),
        )
        .unwrap_err();
        assert!(matches!(err, DaqError::Hardware(_)));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(backend.open_channels(), 0);
        assert_eq!(backend.output_levels(), vec![false, false]);
    }

    #[test]
    fn test_read_fault_aborts_run() {
        let (mut session, backend, dir, calibration) = fixture();
        let path = dir.path().join("run.xlsx");
        let mut run =
            RecordingRun::start(&Settings::default(), &mut session, &calibration, 0.1, &path).unwrap();

        run.tick().unwrap();
        run.tick().unwrap();
        backend.fail_on(SimOperation::Read);

        assert!(matches!(run.tick(), Err(DaqError::Hardware(_))));
        assert!(run.is_finished());
        assert!(run.tick().unwrap_err().is_not_ready());
        assert_eq!(backend.open_channels(), 0);

        let summary = run.stop();
        assert_eq!(summary.rows, 2);
        assert!(summary.final_flush.is_ok());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(storage::load_measurements(&path).unwrap().len(), 2);
    }

    #[test]
    fn test_monitor_rejected_while_recording() {
        let (mut session, _backend, _dir, calibration) = fixture();
        let mut monitor = Monitor::new(ReadingPipeline::default(), Duration::from_millis(200));

        let reading = monitor.tick(&mut session, &calibration).unwrap();
        assert_eq!(reading.sensors[0].voltage, 1.0);

        session.setup().unwrap();
        session.begin_monitoring().unwrap();
        monitor.tick(&mut session, &calibration).unwrap();
        assert_eq!(monitor.trace().last().map(|p| p.0), Some(0.2));

        session.start_recording().unwrap();
        assert!(monitor.tick(&mut session, &calibration).unwrap_err().is_busy());
        assert_eq!(monitor.trace().len(), 2);
    }

    #[test]
    fn test_plot_trace_is_bounded() {
        let mut trace = PlotTrace::new(3);
        let reading = ReadingPipeline::default().convert(
            (1.0, 2.0),
            &CalibrationManager::open(tempfile::tempdir().unwrap().path().join("c.json")),
        );
        for t in 0..5 {
            trace.push(f64::from(t), &reading);
        }
        assert_eq!(trace.len(), 3);
        assert_eq!(trace.points().next().map(|p| p.0), Some(2.0));
        trace.clear();
        assert!(trace.is_empty());
    }
}
