//! Error types for taskloom.

use std::time::Duration;

use thiserror::Error;

use crate::task::{TaskFailure, TaskId, TaskStatus};

/// Taskloom error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Access gate stayed saturated past the caller's deadline
    #[error("access gate saturated: no slot granted within {waited:?}")]
    AcquireTimeout { waited: Duration },

    /// Key is absent or expired
    #[error("key not found: {key}")]
    KeyNotFound { key: String },

    /// Task function returned an error or panicked
    #[error("task {id} failed: {failure}")]
    TaskFailed { id: TaskId, failure: TaskFailure },

    /// Task was cancelled before producing a result
    #[error("task {id} was cancelled")]
    TaskCancelled { id: TaskId },

    /// Await deadline elapsed before the task reached a terminal state
    #[error("timed out after {waited:?} waiting for task {id}")]
    AwaitTimeout { id: TaskId, waited: Duration },

    /// Bounded scheduler queue is full
    #[error("scheduler saturated: {depth} tasks already queued")]
    SchedulerSaturated { depth: usize },

    /// Executor or scheduler is stopping
    #[error("shutdown in progress")]
    ShutdownInProgress,

    /// Task not found (never submitted, or purged after retention)
    #[error("task not found: {id}")]
    TaskNotFound { id: String },

    /// Invalid task state transition
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition { from: TaskStatus, to: TaskStatus },

    /// Embedded database error
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Persisted row could not be decoded
    #[error("corrupt entry for key {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Validation error
    #[error("validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Whether the caller may reasonably retry or back off and try again.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::AcquireTimeout { .. }
                | Error::KeyNotFound { .. }
                | Error::AwaitTimeout { .. }
                | Error::SchedulerSaturated { .. }
        )
    }
}

/// Result type alias for taskloom.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors() {
        assert!(Error::AcquireTimeout {
            waited: Duration::from_millis(5)
        }
        .is_recoverable());
        assert!(Error::KeyNotFound { key: "k".into() }.is_recoverable());
        assert!(Error::SchedulerSaturated { depth: 3 }.is_recoverable());
        assert!(!Error::ShutdownInProgress.is_recoverable());
        assert!(!Error::Validation("bad".into()).is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::KeyNotFound { key: "alpha".into() };
        assert_eq!(err.to_string(), "key not found: alpha");

        let err = Error::TaskFailed {
            id: TaskId("task-1".into()),
            failure: TaskFailure::error("boom"),
        };
        assert_eq!(err.to_string(), "task task-1 failed: boom");
    }
}
