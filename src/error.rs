//! Custom error types for the controller.
//!
//! `FplcError` is the single error type shared by every component. It is built with
//! `thiserror` so lower-level failures (I/O, JSON, CSV, configuration) convert with `?`.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: figment extraction failures (missing file keys, bad types).
//! - **`Configuration`**: semantic configuration errors caught by `validate()`.
//! - **`NotConnected`** / **`SendFailed`**: command issuance without a live peer, or a
//!   write that failed mid-flight. Both are user-visible and never fatal.
//! - **`Validation`**: a method step or instrument setting was rejected at edit time.
//! - **`Protocol`**: a wire unit could not be encoded or decoded.
//! - **`InvalidState`**: an operation was requested in a run phase that forbids it.
//! - **`DeviceFault`**: an acknowledgment was attempted while a device fault is uncleared.

use thiserror::Error;

/// Convenience alias for results using the controller error type.
pub type AppResult<T> = std::result::Result<T, FplcError>;

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum FplcError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Instrument not connected")]
    NotConnected,

    #[error("Failed to send command {tag}: {reason}")]
    SendFailed { tag: String, reason: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Operation not allowed while {phase}: {operation}")]
    InvalidState { phase: String, operation: String },

    #[error("Uncleared device fault: {0}")]
    DeviceFault(String),

    #[error("Controller has shut down")]
    ControllerClosed,
}

impl From<csv::Error> for FplcError {
    fn from(value: csv::Error) -> Self {
        FplcError::Storage(value.to_string())
    }
}
