//! Error types for the face-swap service.

use std::path::PathBuf;

use crate::jobs::state::{TaskId, TaskState};

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// File store errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Invalid file extension: {0:?}")]
    InvalidExtension(String),

    #[error("Directory {path} is not writable: {reason}")]
    NotWritable { path: PathBuf, reason: String },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Job orchestration errors. These are the errors callers of
/// [`crate::service::SwapService`] see.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Task {id} not found")]
    NotFound { id: TaskId },

    #[error("Service overloaded: queue holds {depth} tasks, retry later")]
    Overloaded { depth: usize },

    #[error("Storage failure: {0}")]
    Io(#[from] StorageError),

    #[error("Task {id} cannot transition from {from} to {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskState,
        to: TaskState,
    },
}

impl JobError {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Overloaded { .. })
    }
}

/// Image processor errors.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("Failed to launch processor: {0}")]
    Spawn(#[source] std::io::Error),

    /// Non-zero exit. `logs` holds everything the child printed.
    #[error("Processor exited with code {code:?}: {detail}")]
    Failed {
        code: Option<i32>,
        detail: String,
        logs: Vec<String>,
    },

    #[error("Processor reported failure: {0}")]
    Rejected(String),

    #[error("Processor finished but produced no output at {0}")]
    MissingOutput(PathBuf),

    #[error("Input file not found: {0}")]
    InputMissing(PathBuf),
}

impl ProcessorError {
    /// Take the output captured before the failure, if any.
    pub fn take_logs(&mut self) -> Vec<String> {
        match self {
            Self::Failed { logs, .. } => std::mem::take(logs),
            _ => Vec::new(),
        }
    }
}
