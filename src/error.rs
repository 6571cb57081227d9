//! Custom error types for the capture controller.
//!
//! This module defines the primary error type, `CaptureError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different failure classes the pipeline cares
//! about:
//!
//! - **`Io`**: Wraps standard `std::io::Error`, covering run-directory and
//!   state-file I/O.
//! - **`Config`**: Wraps errors from the `figment` configuration pipeline.
//! - **`CommandFailed` / `CommandTimeout` / `ToolMissing`**: Failures of the
//!   external capture tool. `CommandFailed` carries the tool's last captured
//!   output so the log row and the operator see what the camera subsystem
//!   actually said. A timeout is transient up to the retry budget; a missing
//!   binary is always fatal.
//! - **`FileMissingAfterSuccess`**: The tool exited 0 but no output file
//!   appeared. Exit code 0 is necessary but not sufficient; the file on disk
//!   is the authoritative success signal.
//! - **`StateCorrupt`**: The persisted counter record was unreadable. This is
//!   recovered locally by rebuilding from directory inspection and never
//!   propagates to the operator.
//! - **`Startup`**: A preflight check failed. These are the only errors fatal
//!   to the process; every per-event error is caught at the orchestrator
//!   boundary and logged.
//!
//! By using `#[from]`, `CaptureError` can be seamlessly created from
//! underlying error types, simplifying error handling with the `?` operator.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, CaptureError>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Capture command failed: {0}")]
    CommandFailed(String),

    #[error("Capture command timed out after {0:?}")]
    CommandTimeout(Duration),

    #[error("Capture tool not found: {0}")]
    ToolMissing(String),

    #[error("Capture reported success but file not found: {0}")]
    FileMissingAfterSuccess(PathBuf),

    #[error("Run state record unreadable: {0}")]
    StateCorrupt(String),

    #[error("Capture queue closed")]
    QueueClosed,

    #[error("Startup check failed: {0}")]
    Startup(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CaptureError::CommandFailed("rc=1\nSTDERR:\nCamera busy".to_string());
        assert!(err.to_string().contains("Camera busy"));
    }

    #[test]
    fn test_file_missing_error_names_path() {
        let err = CaptureError::FileMissingAfterSuccess(PathBuf::from("/run/photos/x.jpg"));
        assert!(err.to_string().contains("x.jpg"));
    }
}
