//! Validators for user-supplied recording parameters.
//!
//! Validation failures block the requested action; they are returned as
//! [`DaqError::Validation`] with a message suitable for showing to the user.

use std::path::Path;

use crate::error::{DaqError, Result};

/// Shortest sampling period accepted by default (s).
pub const MIN_SAMPLING_PERIOD_S: f64 = 0.001;

/// Longest sampling period accepted by default (s).
pub const MAX_SAMPLING_PERIOD_S: f64 = 10.0;

/// Extension required for measurement files by default.
pub const MEASUREMENT_EXTENSION: &str = ".xlsx";

/// Characters that are not allowed in a measurement file name.
const FORBIDDEN_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

/// Validates a sampling period against the default bounds.
///
/// # Arguments
///
/// * `period` - Sampling period in seconds.
///
/// # Returns
///
/// * `Ok(())` if `0.001 <= period <= 10.0`.
/// * `Err(DaqError::Validation)` otherwise, including for NaN.
pub fn validate_sampling_period(period: f64) -> Result<()> {
    validate_period_within(period, MIN_SAMPLING_PERIOD_S, MAX_SAMPLING_PERIOD_S)
}

/// Validates a sampling period against explicit bounds (inclusive).
pub fn validate_period_within(period: f64, min: f64, max: f64) -> Result<()> {
    if period.is_nan() {
        return Err(DaqError::Validation(
            "Sampling period must be a number".to_string(),
        ));
    }
    if period < min {
        return Err(DaqError::Validation(format!(
            "Sampling period {period} s is below the minimum of {min} s"
        )));
    }
    if period > max {
        return Err(DaqError::Validation(format!(
            "Sampling period {period} s exceeds the maximum of {max} s"
        )));
    }
    Ok(())
}

/// Validates a measurement file name with the default `.xlsx` extension.
pub fn validate_filename(name: &str) -> Result<()> {
    validate_filename_with_extension(name, MEASUREMENT_EXTENSION)
}

/// Validates a measurement file name.
///
/// The name must be non-empty, end with `extension` and contain none of
/// `< > : " | ? *`. Only the final path component is checked for forbidden
/// characters so that directory prefixes (including drive letters) pass.
pub fn validate_filename_with_extension(name: &str, extension: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(DaqError::Validation(
            "File name cannot be empty".to_string(),
        ));
    }
    if !name.ends_with(extension) {
        return Err(DaqError::Validation(format!(
            "File name '{name}' must end with '{extension}'"
        )));
    }

    let file_name = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(name);
    if let Some(c) = file_name.chars().find(|c| FORBIDDEN_FILENAME_CHARS.contains(c)) {
        return Err(DaqError::Validation(format!(
            "File name '{file_name}' contains the forbidden character '{c}'"
        )));
    }
    if file_name == extension {
        return Err(DaqError::Validation(format!(
            "File name '{name}' has no stem"
        )));
    }
    Ok(())
}

/// Returns true if `path` names an existing file.
pub fn check_file_exists(path: impl AsRef<Path>) -> bool {
    path.as_ref().is_file()
}
