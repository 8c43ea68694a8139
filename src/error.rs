//! Error types for the capacity planner.

use std::time::Duration;

use crate::task::WorkerKind;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors raised while a worker processes a task.
///
/// Everything except `Cancelled` is folded into a `failed` task at the
/// worker boundary; the message is preserved verbatim in `Task::error`.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    #[error("Command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error("Command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Invalid data source: {0}")]
    Validation(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Processing failed: {0}")]
    Processing(String),

    #[error("Task was cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WorkerError {
    /// Whether this error represents cooperative cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Task dispatch errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("No worker registered for kind {kind}")]
    NoWorker { kind: WorkerKind },
}
