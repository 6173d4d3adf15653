//! Error types for the acquisition core.
//!
//! Every fallible operation on the channel session, the calibration store and
//! the recording orchestrator returns [`Result`]. `Ok` is the success flag and
//! the `Display` of a [`DaqError`] is the human-readable diagnostic, so callers
//! can decide per call whether a failure ends the current run or is only worth
//! a warning.
//!
//! ## Error Hierarchy
//!
//! - **`Configuration`**: a channel could not be allocated or configured.
//! - **`NotReady`**: an operation was attempted in the wrong session state,
//!   e.g. reading a block before recording started.
//! - **`Busy`**: a monitoring read was attempted while recording.
//! - **`Hardware`**: an I/O failure while reading or writing channels.
//! - **`Validation`**: user-supplied input (period, filename, sensor id) is
//!   out of bounds.
//! - **`DataShape`**: a sample block does not have the expected channel count.
//! - **`Persistence`**: the calibration record or the measurement table could
//!   not be read or written.
//!
//! Teardown never fails. It collects sub-failures into a [`TeardownReport`]
//! which can be turned into [`DaqError::TeardownFailed`] when a caller wants a
//! single error value.

use std::fmt;
use std::path::Path;

use thiserror::Error;

/// Result type alias for acquisition operations.
pub type Result<T> = std::result::Result<T, DaqError>;

/// Errors produced by the acquisition core.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Channel allocation or configuration failed
    #[error("Channel configuration failed: {0}")]
    Configuration(String),

    /// Operation attempted in the wrong session state
    #[error("Not ready: {0}")]
    NotReady(String),

    /// Point read attempted while a recording is active
    #[error("Busy: {0}")]
    Busy(String),

    /// Device I/O failure during read or write
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// User input out of bounds
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Unexpected channel count in a sample block
    #[error("Unexpected data shape: expected {expected} channels, got {actual}")]
    DataShape {
        /// Channel count the pipeline requires
        expected: usize,
        /// Channel count actually received
        actual: usize,
    },

    /// Calibration record or measurement table I/O failed
    #[error("Persistence error for '{path}': {message}")]
    Persistence {
        /// File involved in the failed operation
        path: String,
        /// Underlying cause
        message: String,
    },

    /// I/O error from the operating system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Teardown completed but one or more release steps failed
    #[error("Teardown completed with errors: {}", join_failures(.0))]
    TeardownFailed(Vec<DaqError>),
}

fn join_failures(failures: &[DaqError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl DaqError {
    /// Build a persistence error for `path`.
    pub fn persistence(path: impl AsRef<Path>, message: impl fmt::Display) -> Self {
        Self::Persistence {
            path: path.as_ref().display().to_string(),
            message: message.to_string(),
        }
    }

    /// Check if a recording blocked this operation.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy(_))
    }

    /// Check if the session was in the wrong state.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady(_))
    }

    /// Check if this error should abort an active recording run.
    ///
    /// Validation, busy and persistence failures leave the run intact; the
    /// measurement rows stay buffered and the next flush retries the write.
    pub fn is_fatal_to_run(&self) -> bool {
        match self {
            Self::Configuration(_)
            | Self::NotReady(_)
            | Self::Hardware(_)
            | Self::DataShape { .. }
            | Self::Io(_)
            | Self::TeardownFailed(_) => true,
            Self::Busy(_) | Self::Validation(_) | Self::Persistence { .. } => false,
        }
    }
}

/// Outcome of a best-effort release sequence.
///
/// Every release step runs regardless of earlier failures; the failures are
/// collected here instead of being raised.
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Failures from individual release steps, in the order they happened
    pub failures: Vec<DaqError>,
}

impl TeardownReport {
    /// Create an empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one release step.
    pub fn record(&mut self, step: &str, result: Result<()>) {
        if let Err(err) = result {
            tracing::warn!(step, error = %err, "Release step failed");
            self.failures.push(err);
        }
    }

    /// Merge the failures of another report into this one.
    pub fn merge(&mut self, other: TeardownReport) {
        self.failures.extend(other.failures);
    }

    /// True when every release step succeeded.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Aggregate diagnostic string, empty when clean.
    pub fn diagnostic(&self) -> String {
        join_failures(&self.failures)
    }

    /// Convert into a single result for callers that want one error value.
    pub fn into_result(self) -> Result<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(DaqError::TeardownFailed(self.failures))
        }
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            write!(f, "all resources released")
        } else {
            write!(
                f,
                "{} release step(s) failed: {}",
                self.failures.len(),
                self.diagnostic()
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::DataShape {
            expected: 2,
            actual: 3,
        };
        assert!(err.to_string().contains('2'));
        assert!(err.to_string().contains('3'));

        let err = DaqError::persistence("sensor_calibration.json", "disk full");
        assert_eq!(
            err.to_string(),
            "Persistence error for 'sensor_calibration.json': disk full"
        );
    }

    #[test]
    fn test_predicates() {
        assert!(DaqError::Busy("recording".into()).is_busy());
        assert!(DaqError::NotReady("idle".into()).is_not_ready());
        assert!(DaqError::Hardware("read".into()).is_fatal_to_run());
        assert!(!DaqError::Validation("period".into()).is_fatal_to_run());
        assert!(!DaqError::persistence("x.xlsx", "locked").is_fatal_to_run());
    }

    #[test]
    fn test_teardown_report_collects_failures() {
        let mut report = TeardownReport::new();
        report.record("stop", Ok(()));
        report.record("close input", Err(DaqError::Hardware("close failed".into())));
        report.record("close output", Err(DaqError::Hardware("line stuck".into())));

        assert!(!report.is_clean());
        assert_eq!(report.failures.len(), 2);
        assert_eq!(
            report.diagnostic(),
            "Hardware error: close failed; Hardware error: line stuck"
        );

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, DaqError::TeardownFailed(ref v) if v.len() == 2));
        assert!(err.to_string().starts_with("Teardown completed with errors"));
    }

    #[test]
    fn test_clean_report() {
        let report = TeardownReport::new();
        assert!(report.is_clean());
        assert_eq!(report.to_string(), "all resources released");
        assert!(report.into_result().is_ok());
    }
}
