//! Core error types
//!
//! Errors raised by the scheduler, the runtime wrapper and configuration
//! loading. Network-level failures live in `tickstream-net`.

use std::time::Duration;
use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core runtime errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("Invalid interval: {0:?} (must be positive)")]
    InvalidInterval(Duration),

    #[error("Invalid interval value: {0}")]
    InvalidIntervalValue(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),

    #[error("Scheduler shut down")]
    SchedulerShutdown,
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::RuntimeError(err.to_string())
    }
}
