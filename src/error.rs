//! Custom error types for the application.
//!
//! This module defines the primary error type, `FtsError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of errors that can occur,
//! from I/O and configuration issues to instrument-specific problems.
//!
//! ## Error Hierarchy
//!
//! `FtsError` consolidates several error sources:
//!
//! - **`Config`**: wraps errors from the `figment` configuration pipeline,
//!   typically file parsing or format issues.
//! - **`Configuration`**: semantic errors in values that parse fine but are
//!   logically invalid (zero sample rate, bad log level, ...). These are
//!   caught by the validation step.
//! - **`Io`**: wraps standard `std::io::Error` for file and network I/O.
//! - **`Instrument`**: errors originating from hardware drivers, anything
//!   from a communication failure to a malformed device response. Drivers
//!   use `anyhow` internally; their errors cross into the core as this
//!   variant.
//! - **`Storage`**: failures while writing scan data to disk.
//!
//! The remaining variants are state-machine violations surfaced to callers
//! synchronously: `AlreadyRunning` (second concurrent scan), `AlreadyActive`
//! (second `start` on a polling stream reader), `NotCalibrated` (position
//! query before `find_offset`), and `ReaderUnresponsive` (a background task
//! that failed to exit within its grace period).

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, FtsError>;

/// The application-wide error type.
#[derive(Error, Debug)]
pub enum FtsError {
    /// Configuration file could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration loaded but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hardware driver error.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// Scan data could not be persisted.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A scan session is already running; only one may be active at a time.
    #[error("A scan is already in progress")]
    AlreadyRunning,

    /// The stream reader is already polling its device.
    #[error("Stream reader is already active")]
    AlreadyActive,

    /// Position was requested before the encoder offset was established.
    #[error("Axis is not calibrated; run find_offset first")]
    NotCalibrated,

    /// A background task did not exit within its grace period.
    #[error("Background reader did not stop within its grace period")]
    ReaderUnresponsive,

    /// Requested functionality was compiled out.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<anyhow::Error> for FtsError {
    fn from(err: anyhow::Error) -> Self {
        FtsError::Instrument(format!("{err:#}"))
    }
}
