use rusqlite;
use std::io;
use thiserror::Error;

/// Error taxonomy for the governance plane.
///
/// `BusyError` is retryable; callers are expected to back off and retry.
/// `CorruptState` is self-healing: the load path resets the record to the
/// default equilibrium and surfaces the reset as a warning on an otherwise
/// successful response, so it normally appears inside report warnings rather
/// than as a hard failure.
#[derive(Error, Debug)]
pub enum VigilError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Busy: {0}")]
    BusyError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Auth error: {0}")]
    AuthError(String),
    #[error("Corrupt state: {0}")]
    CorruptState(String),
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    #[error("Timeout: {0}")]
    TimeoutError(String),
}

impl VigilError {
    /// Whether the caller may retry the same call unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VigilError::BusyError(_))
    }

    /// Stable machine-readable code for envelopes and audit lines.
    pub fn code(&self) -> &'static str {
        match self {
            VigilError::RusqliteError(_) => "storage",
            VigilError::IoError(_) => "io",
            VigilError::ValidationError(_) => "validation",
            VigilError::BusyError(_) => "busy",
            VigilError::NotFound(_) => "not_found",
            VigilError::AuthError(_) => "auth",
            VigilError::CorruptState(_) => "corrupt_state",
            VigilError::ProtocolError(_) => "protocol",
            VigilError::TimeoutError(_) => "timeout",
        }
    }
}
