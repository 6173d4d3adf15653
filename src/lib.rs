//! # Level DAQ Core Library
//!
//! Acquisition core for a two-sensor water-level rig: the sensors are powered
//! through digital output lines, sampled through a two-channel analog input,
//! converted to height with a per-sensor linear calibration and logged to a
//! measurement table.
//!
//! ## Crate Structure
//!
//! - **`error`**: `DaqError` taxonomy and the `TeardownReport` aggregate.
//! - **`config`**: `Settings` layered from defaults, TOML and environment.
//! - **`validation`**: checks on user-supplied periods and file names.
//! - **`calibration`**: two-point calibration store and the voltage to height
//!   transform.
//! - **`device`**: channel I/O capability traits, the simulated backend and
//!   the startup capability probe.
//! - **`session`**: `ChannelSession`, the channel lifecycle state machine.
//! - **`pipeline`**: block reduction, envelope checks and unit conversion.
//! - **`storage`**: measurement table sinks (XLSX, CSV) and the loader.
//! - **`orchestrator`**: recording runs and idle monitoring, one tick at a
//!   time.
//! - **`runner`**: tokio host loop driving the orchestrator ticks.
//! - **`logging`**: tracing subscriber setup for the binary.

pub mod calibration;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod runner;
pub mod session;
pub mod storage;
pub mod validation;

pub use calibration::CalibrationManager;
pub use config::Settings;
pub use error::{DaqError, Result, TeardownReport};
pub use session::{ChannelSession, SessionConfig, SessionState};
