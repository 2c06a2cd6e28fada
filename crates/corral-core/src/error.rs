//! Error types for corral-core.

use std::time::Duration;

use thiserror::Error;

use crate::serialize::SerializedError;

/// Result type for corral-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in corral-core.
#[derive(Debug, Error)]
pub enum Error {
    /// The pending task queue is at capacity.
    #[error("task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The pool has begun shutting down and accepts no more work.
    #[error("worker pool is shutting down")]
    PoolShuttingDown,

    /// A task did not settle before its deadline.
    #[error("task {task_id} timed out after {}ms", timeout.as_millis())]
    TaskTimeout { task_id: String, timeout: Duration },

    /// The worker running a task crashed or exited unexpectedly.
    #[error("worker {worker_id} crashed: {message}")]
    WorkerCrash { worker_id: usize, message: String },

    /// A value is nested deeper than the serializer allows.
    #[error("serialization depth exceeded (max {max_depth})")]
    SerializationDepthExceeded { max_depth: usize },

    /// A value references itself and the serializer is configured to fail.
    #[error("circular reference detected at {path}")]
    CircularReference { path: String },

    /// An unknown wire encoding was requested.
    #[error("unsupported encoding: {0}")]
    UnsupportedEncoding(String),

    /// A value cannot cross the isolation boundary at all.
    #[error("value cannot be serialized: {0}")]
    Unserializable(String),

    /// A type codec rejected its input.
    #[error("{codec} codec error: {message}")]
    Codec { codec: String, message: String },

    /// The task handler reported a failure.
    #[error("task failed: {}", .0.message)]
    TaskFailed(SerializedError),

    /// Pool configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// IPC communication error with a worker.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// A worker could not be started.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// The pool went away before the task settled.
    #[error("worker pool dropped before the task settled")]
    Disconnected,

    /// JSON encoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Bincode encoding error.
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
}

impl Error {
    pub(crate) fn codec(codec: &str, message: impl Into<String>) -> Self {
        Self::Codec {
            codec: codec.to_string(),
            message: message.into(),
        }
    }

    /// Whether retrying the same task could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::QueueFull { .. } | Error::TaskTimeout { .. } | Error::WorkerCrash { .. } => {
                true
            }
            Error::TaskFailed(err) => err.retryable,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_uses_millis() {
        let err = Error::TaskTimeout {
            task_id: "abc".to_string(),
            timeout: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "task abc timed out after 250ms");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::QueueFull { capacity: 1 }.is_retryable());
        assert!(!Error::PoolShuttingDown.is_retryable());
        assert!(!Error::SerializationDepthExceeded { max_depth: 3 }.is_retryable());
    }
}
