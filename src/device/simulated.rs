//! Simulated acquisition backend.
//!
//! Generates a synthetic water-level signal per channel:
//!
//! ```text
//! v(t) = base[ch] + drift * t + A * sin(2π f t + ch) + noise(σ)
//! ```
//!
//! clipped to the channel's input range. `t` is derived from the channel's
//! sample counter and the configured sample rate, never from the wall clock,
//! so a seeded backend produces identical data on every run.
//!
//! The backend is a cheap handle: clones share state. Tests keep a clone to
//! inject faults ([`SimulatedBackend::fail_on`], [`SimulatedBackend::fail_after`])
//! and to observe digital output levels and open channels after the session
//! has taken ownership of its boxed copy.

use std::collections::HashMap;
use std::f64::consts::TAU;
use std::fmt;
use std::sync::Arc;

use ndarray::Array2;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, trace};

use super::{
    DaqBackend, DeviceInfo, InputChannel, InputConfig, OutputChannel, OutputConfig, SampleTiming,
};
use crate::config::BackendKind;
use crate::error::{DaqError, Result};
use crate::pipeline::SampleBlock;

/// Clock used to advance simulated time for on-demand reads (Hz).
const ON_DEMAND_CLOCK_HZ: f64 = 1000.0;

/// Backend operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOperation {
    /// Device enumeration
    Enumerate,
    /// Allocating an analog input channel
    OpenInput,
    /// Allocating a digital output channel
    OpenOutput,
    /// Starting an input channel
    Start,
    /// Reading samples
    Read,
    /// Writing output levels
    Write,
    /// Stopping an input channel
    Stop,
    /// Closing any channel
    Close,
}

impl fmt::Display for SimOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Enumerate => "enumerate",
            Self::OpenInput => "open_input",
            Self::OpenOutput => "open_output",
            Self::Start => "start",
            Self::Read => "read",
            Self::Write => "write",
            Self::Stop => "stop",
            Self::Close => "close",
        };
        write!(f, "{name}")
    }
}

/// Parameters of the synthetic signal.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalProfile {
    /// Offset per channel (V); channels beyond the list reuse it cyclically
    pub base_voltages: Vec<f64>,
    /// Standard deviation of the Gaussian noise (V)
    pub noise_std: f64,
    /// Slow linear drift (V/s)
    pub drift_per_s: f64,
    /// Amplitude of the level oscillation (V)
    pub wave_amplitude: f64,
    /// Frequency of the level oscillation (Hz)
    pub wave_frequency_hz: f64,
}

impl Default for SignalProfile {
    fn default() -> Self {
        Self {
            base_voltages: vec![2.5, 3.5],
            noise_std: 0.05,
            drift_per_s: 0.001,
            wave_amplitude: 0.2,
            wave_frequency_hz: 0.1,
        }
    }
}

impl SignalProfile {
    /// A noiseless, flat signal at `levels` (one per channel).
    pub fn constant(levels: Vec<f64>) -> Self {
        Self {
            base_voltages: levels,
            noise_std: 0.0,
            drift_per_s: 0.0,
            wave_amplitude: 0.0,
            wave_frequency_hz: 0.0,
        }
    }

    fn value(&self, channel: usize, t: f64) -> f64 {
        let base = if self.base_voltages.is_empty() {
            0.0
        } else {
            self.base_voltages[channel % self.base_voltages.len()]
        };
        let wave = self.wave_amplitude * (TAU * self.wave_frequency_hz * t + channel as f64).sin();
        base + self.drift_per_s * t + wave
    }
}

#[derive(Debug)]
struct SimState {
    profile: SignalProfile,
    devices: Vec<DeviceInfo>,
    /// Remaining successes before each armed operation fails
    faults: HashMap<SimOperation, u32>,
    open_inputs: usize,
    open_outputs: usize,
    output_levels: Vec<bool>,
    write_history: Vec<Vec<bool>>,
}

impl SimState {
    fn check(&mut self, op: SimOperation) -> Result<()> {
        match self.faults.get_mut(&op) {
            Some(0) => Err(DaqError::Hardware(format!("Injected {op} failure"))),
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

struct Shared {
    rng: Mutex<ChaCha8Rng>,
    state: Mutex<SimState>,
}

/// Deterministic in-process replacement for the acquisition device.
#[derive(Clone)]
pub struct SimulatedBackend {
    shared: Arc<Shared>,
}

impl SimulatedBackend {
    /// Create a backend seeded from the OS.
    pub fn new() -> Self {
        Self::from_rng(ChaCha8Rng::from_entropy())
    }

    /// Create a reproducible backend.
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(ChaCha8Rng::seed_from_u64(seed))
    }

    fn from_rng(rng: ChaCha8Rng) -> Self {
        Self {
            shared: Arc::new(Shared {
                rng: Mutex::new(rng),
                state: Mutex::new(SimState {
                    profile: SignalProfile::default(),
                    devices: default_devices(),
                    faults: HashMap::new(),
                    open_inputs: 0,
                    open_outputs: 0,
                    output_levels: Vec::new(),
                    write_history: Vec::new(),
                }),
            }),
        }
    }

    /// Replace the synthetic signal.
    pub fn with_profile(self, profile: SignalProfile) -> Self {
        self.shared.state.lock().profile = profile;
        self
    }

    /// Replace the enumerated device list.
    pub fn with_devices(self, devices: Vec<DeviceInfo>) -> Self {
        self.shared.state.lock().devices = devices;
        self
    }

    /// Make every future `op` fail.
    pub fn fail_on(&self, op: SimOperation) {
        self.fail_after(op, 0);
    }

    /// Let `op` succeed `successes` more times, then fail every time.
    pub fn fail_after(&self, op: SimOperation, successes: u32) {
        self.shared.state.lock().faults.insert(op, successes);
    }

    /// Disarm all injected faults.
    pub fn clear_faults(&self) {
        self.shared.state.lock().faults.clear();
    }

    /// Number of channels currently open (inputs and outputs).
    pub fn open_channels(&self) -> usize {
        let state = self.shared.state.lock();
        state.open_inputs + state.open_outputs
    }

    /// Number of input channels currently open.
    pub fn open_inputs(&self) -> usize {
        self.shared.state.lock().open_inputs
    }

    /// Last levels written to the digital output lines.
    pub fn output_levels(&self) -> Vec<bool> {
        self.shared.state.lock().output_levels.clone()
    }

    /// Every successful digital output write, in order.
    pub fn write_history(&self) -> Vec<Vec<bool>> {
        self.shared.state.lock().write_history.clone()
    }

    fn check(&self, op: SimOperation) -> Result<()> {
        self.shared.state.lock().check(op)
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SimulatedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedBackend")
            .field("state", &*self.shared.state.lock())
            .finish_non_exhaustive()
    }
}

fn default_devices() -> Vec<DeviceInfo> {
    vec![
        DeviceInfo::new("cDAQ1", "cDAQ-9174"),
        DeviceInfo::new("cDAQ1Mod1", "NI 9201"),
        DeviceInfo::new("cDAQ1Mod2", "NI 9472"),
    ]
}

impl DaqBackend for SimulatedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Simulated
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        let mut state = self.shared.state.lock();
        state.check(SimOperation::Enumerate)?;
        Ok(state.devices.clone())
    }

    fn open_input(&self, config: &InputConfig) -> Result<Box<dyn InputChannel>> {
        config.validate()?;
        let mut state = self.shared.state.lock();
        state.check(SimOperation::OpenInput)?;
        state.open_inputs += 1;

        let rate_hz = match config.timing {
            SampleTiming::Continuous { rate_hz, .. } => rate_hz,
            SampleTiming::OnDemand => ON_DEMAND_CLOCK_HZ,
        };
        debug!(
            channels = %config.physical_channels,
            n_channels = config.channel_count,
            timing = ?config.timing,
            "Opened simulated input channel"
        );

        Ok(Box::new(SimInput {
            backend: self.clone(),
            config: config.clone(),
            rate_hz,
            running: false,
            closed: false,
            sample_index: 0,
        }))
    }

    fn open_output(&self, config: &OutputConfig) -> Result<Box<dyn OutputChannel>> {
        if config.lines.is_empty() {
            return Err(DaqError::Configuration(
                "At least one output line is required".to_string(),
            ));
        }
        let mut state = self.shared.state.lock();
        state.check(SimOperation::OpenOutput)?;
        state.open_outputs += 1;
        if state.output_levels.len() != config.lines.len() {
            state.output_levels = vec![false; config.lines.len()];
        }
        debug!(lines = ?config.lines, "Opened simulated output channel");

        Ok(Box::new(SimOutput {
            backend: self.clone(),
            line_count: config.lines.len(),
            closed: false,
        }))
    }
}

struct SimInput {
    backend: SimulatedBackend,
    config: InputConfig,
    rate_hz: f64,
    running: bool,
    closed: bool,
    sample_index: u64,
}

impl SimInput {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(DaqError::Hardware(format!(
                "Input channel '{}' is closed",
                self.config.physical_channels
            )))
        } else {
            Ok(())
        }
    }

    fn release(&mut self) {
        self.closed = true;
        self.running = false;
        let mut state = self.backend.shared.state.lock();
        state.open_inputs = state.open_inputs.saturating_sub(1);
    }
}

impl InputChannel for SimInput {
    fn start(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.backend.check(SimOperation::Start)?;
        if matches!(self.config.timing, SampleTiming::Continuous { .. }) {
            self.running = true;
            self.sample_index = 0;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.closed || !self.running {
            return Ok(());
        }
        self.backend.check(SimOperation::Stop)?;
        self.running = false;
        Ok(())
    }

    fn read(&mut self, samples_per_channel: usize) -> Result<SampleBlock> {
        self.ensure_open()?;
        if matches!(self.config.timing, SampleTiming::Continuous { .. }) && !self.running {
            return Err(DaqError::Hardware("Task not started".to_string()));
        }

        let profile = {
            let mut state = self.backend.shared.state.lock();
            state.check(SimOperation::Read)?;
            state.profile.clone()
        };

        let channels = self.config.channel_count;
        let mut rng = self.backend.shared.rng.lock();
        let start = self.sample_index;
        let data = Array2::from_shape_fn((channels, samples_per_channel), |(ch, i)| {
            let t = (start + i as u64) as f64 / self.rate_hz;
            let noisy = profile.value(ch, t) + gaussian(&mut *rng, profile.noise_std);
            self.config.range.clip(noisy)
        });
        self.sample_index += samples_per_channel as u64;

        trace!(samples_per_channel, first_sample = start, "Simulated read");
        Ok(SampleBlock::new(data))
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let outcome = self.backend.check(SimOperation::Close);
        self.release();
        outcome
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

impl Drop for SimInput {
    fn drop(&mut self) {
        if !self.closed {
            debug!(channels = %self.config.physical_channels, "Input channel dropped without close");
            self.release();
        }
    }
}

struct SimOutput {
    backend: SimulatedBackend,
    line_count: usize,
    closed: bool,
}

impl SimOutput {
    fn release(&mut self) {
        self.closed = true;
        let mut state = self.backend.shared.state.lock();
        state.open_outputs = state.open_outputs.saturating_sub(1);
    }
}

impl OutputChannel for SimOutput {
    fn write(&mut self, levels: &[bool]) -> Result<()> {
        if self.closed {
            return Err(DaqError::Hardware("Output channel is closed".to_string()));
        }
        if levels.len() != self.line_count {
            return Err(DaqError::Hardware(format!(
                "Expected {} output levels, got {}",
                self.line_count,
                levels.len()
            )));
        }
        let mut state = self.backend.shared.state.lock();
        state.check(SimOperation::Write)?;
        state.output_levels = levels.to_vec();
        state.write_history.push(levels.to_vec());
        Ok(())
    }

    fn line_count(&self) -> usize {
        self.line_count
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let outcome = self.backend.check(SimOperation::Close);
        self.release();
        outcome
    }
}

impl Drop for SimOutput {
    fn drop(&mut self) {
        if !self.closed {
            debug!("Output channel dropped without close");
            self.release();
        }
    }
}

/// Box-Muller draw from N(0, std²).
fn gaussian<R: Rng>(rng: &mut R, std: f64) -> f64 {
    if std <= 0.0 {
        return 0.0;
    }
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    std * (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::VoltageRange;

    fn continuous() -> InputConfig {
        InputConfig::continuous("cDAQ1Mod2/ai0:1", 2, VoltageRange::default(), 1000.0, 10_000)
    }

    #[test]
    fn test_seeded_backend_is_deterministic() {
        let read = |seed| {
            let backend = SimulatedBackend::with_seed(seed);
            let mut input = backend.open_input(&continuous()).unwrap();
            input.start().unwrap();
            input.read(50).unwrap()
        };
        assert_eq!(read(42).data(), read(42).data());
    }

    #[test]
    fn test_default_signal_near_base_levels() {
        let backend = SimulatedBackend::with_seed(7);
        let mut input = backend.open_input(&continuous()).unwrap();
        input.start().unwrap();
        let block = input.read(1000).unwrap();
        assert_eq!(block.channels(), 2);
        assert_eq!(block.samples(), 1000);

        let means = block.channel_means().unwrap();
        // wave amplitude 0.2 plus noise averaged over 1 s
        assert!((means[0] - 2.5).abs() < 0.3, "got {}", means[0]);
        assert!((means[1] - 3.5).abs() < 0.3, "got {}", means[1]);
    }

    #[test]
    fn test_signal_time_follows_sample_counter() {
        let profile = SignalProfile {
            base_voltages: vec![0.0],
            noise_std: 0.0,
            drift_per_s: 1.0,
            wave_amplitude: 0.0,
            wave_frequency_hz: 0.0,
        };
        let backend = SimulatedBackend::with_seed(1).with_profile(profile);
        let config =
            InputConfig::continuous("dev/ai0", 1, VoltageRange::default(), 100.0, 1000);
        let mut input = backend.open_input(&config).unwrap();
        input.start().unwrap();

        let first = input.read(100).unwrap();
        let second = input.read(100).unwrap();
        assert!((first.data()[[0, 0]] - 0.0).abs() < 1e-12);
        assert!((first.data()[[0, 99]] - 0.99).abs() < 1e-12);
        assert!((second.data()[[0, 0]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_values_are_clipped_to_range() {
        let backend = SimulatedBackend::with_seed(1).with_profile(SignalProfile::constant(vec![15.0, -15.0]));
        let mut input = backend.open_input(&continuous()).unwrap();
        input.start().unwrap();
        let block = input.read(10).unwrap();
        assert!(block.data().row(0).iter().all(|&v| v == 10.0));
        assert!(block.data().row(1).iter().all(|&v| v == -10.0));
    }

    #[test]
    fn test_continuous_read_requires_start() {
        let backend = SimulatedBackend::with_seed(1);
        let mut input = backend.open_input(&continuous()).unwrap();
        assert!(matches!(input.read(10), Err(DaqError::Hardware(_))));
    }

    #[test]
    fn test_on_demand_reads_without_start() {
        let backend = SimulatedBackend::with_seed(1);
        let config = InputConfig::on_demand("cDAQ1Mod2/ai0:1", 2, VoltageRange::default());
        let mut input = backend.open_input(&config).unwrap();
        assert_eq!(input.read(1).unwrap().samples(), 1);
        assert!(!input.is_running());
    }

    #[test]
    fn test_fail_after_n_reads() {
        let backend = SimulatedBackend::with_seed(1);
        let mut input = backend.open_input(&continuous()).unwrap();
        input.start().unwrap();
        backend.fail_after(SimOperation::Read, 2);

        assert!(input.read(10).is_ok());
        assert!(input.read(10).is_ok());
        let err = input.read(10).unwrap_err();
        assert_eq!(err.to_string(), "Hardware error: Injected read failure");

        backend.clear_faults();
        assert!(input.read(10).is_ok());
    }

    #[test]
    fn test_open_channel_accounting() {
        let backend = SimulatedBackend::with_seed(1);
        let mut input = backend.open_input(&continuous()).unwrap();
        let output = backend
            .open_output(&OutputConfig::new(vec!["l0".into(), "l1".into()]))
            .unwrap();
        assert_eq!(backend.open_channels(), 2);
        assert_eq!(backend.open_inputs(), 1);

        input.close().unwrap();
        assert!(input.close().is_ok());
        assert_eq!(backend.open_channels(), 1);

        drop(output);
        assert_eq!(backend.open_channels(), 0);
    }

    #[test]
    fn test_close_failure_still_releases() {
        let backend = SimulatedBackend::with_seed(1);
        let mut input = backend.open_input(&continuous()).unwrap();
        backend.fail_on(SimOperation::Close);
        assert!(input.close().is_err());
        assert_eq!(backend.open_channels(), 0);
    }

    #[test]
    fn test_output_levels_observable() {
        let backend = SimulatedBackend::with_seed(1);
        let mut output = backend
            .open_output(&OutputConfig::new(vec!["l0".into(), "l1".into()]))
            .unwrap();
        assert_eq!(backend.output_levels(), vec![false, false]);

        output.write(&[true, true]).unwrap();
        assert_eq!(backend.output_levels(), vec![true, true]);
        assert!(output.write(&[true]).is_err());

        output.write(&[false, false]).unwrap();
        assert_eq!(
            backend.write_history(),
            vec![vec![true, true], vec![false, false]]
        );
    }

    #[test]
    fn test_gaussian_noise_statistics() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let n = 20_000;
        let draws: Vec<f64> = (0..n).map(|_| gaussian(&mut rng, 0.05)).collect();
        let mean = draws.iter().sum::<f64>() / n as f64;
        let var = draws.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.005, "mean {mean}");
        assert!((var.sqrt() - 0.05).abs() < 0.005, "std {}", var.sqrt());
    }
}
