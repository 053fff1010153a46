//! Error types for entangle.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Main error type for graph resolution.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to launch worker for '{task}': {reason}")]
    LaunchFailure { task: String, reason: String },

    #[error("Timed out after {waited_ms}ms waiting on {pending} argument(s) of '{task}'")]
    ResolutionTimeout {
        task: String,
        pending: usize,
        waited_ms: u64,
    },

    #[error("Task '{task}' failed: {message}")]
    InvocationFailure { task: String, message: String },

    #[error("Result channel for '{task}' received more than one value")]
    ChannelProtocolViolation { task: String },

    #[error("Resolution of '{task}' was cancelled")]
    Cancelled { task: String },

    #[error("Shared memory error: {0}")]
    SharedMemory(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub(crate) fn launch(task: &str, reason: impl std::fmt::Display) -> Self {
        Self::LaunchFailure {
            task: task.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn invocation(task: &str, message: impl std::fmt::Display) -> Self {
        Self::InvocationFailure {
            task: task.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn timeout(task: &str, pending: usize, waited: Duration) -> Self {
        Self::ResolutionTimeout {
            task: task.to_string(),
            pending,
            waited_ms: waited.as_millis() as u64,
        }
    }

    /// True for `ResolutionTimeout`, the "never finished" outcome.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ResolutionTimeout { .. })
    }

    /// Convert into the form that crosses a worker's result channel.
    ///
    /// Ambient errors (IO, JSON, shared memory) raised inside a worker are
    /// reported as an invocation failure of the task that worker resolved.
    pub(crate) fn to_failure(&self, task: &str) -> Failure {
        match self {
            Self::LaunchFailure { task, reason } => Failure::Launch {
                task: task.clone(),
                reason: reason.clone(),
            },
            Self::ResolutionTimeout {
                task,
                pending,
                waited_ms,
            } => Failure::Timeout {
                task: task.clone(),
                pending: *pending,
                waited_ms: *waited_ms,
            },
            Self::InvocationFailure { task, message } => Failure::Invocation {
                task: task.clone(),
                message: message.clone(),
            },
            Self::ChannelProtocolViolation { task } => Failure::Protocol { task: task.clone() },
            Self::Cancelled { task } => Failure::Cancelled { task: task.clone() },
            other => Failure::Invocation {
                task: task.to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// Serializable error report written by a worker instead of a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Failure {
    Launch {
        task: String,
        reason: String,
    },
    Timeout {
        task: String,
        pending: usize,
        waited_ms: u64,
    },
    Invocation {
        task: String,
        message: String,
    },
    Protocol {
        task: String,
    },
    Cancelled {
        task: String,
    },
}

impl From<Failure> for EngineError {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Launch { task, reason } => Self::LaunchFailure { task, reason },
            Failure::Timeout {
                task,
                pending,
                waited_ms,
            } => Self::ResolutionTimeout {
                task,
                pending,
                waited_ms,
            },
            Failure::Invocation { task, message } => Self::InvocationFailure { task, message },
            Failure::Protocol { task } => Self::ChannelProtocolViolation { task },
            Failure::Cancelled { task } => Self::Cancelled { task },
        }
    }
}

/// Result type alias for entangle operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_timeout_error_message() {
        let err = EngineError::timeout("add", 2, Duration::from_millis(1500));
        let msg = err.to_string();
        assert!(msg.contains("1500ms"));
        assert!(msg.contains("2 argument(s)"));
        assert!(msg.contains("'add'"));
        assert!(err.is_timeout());
    }

    #[test]
    fn test_invocation_error_message() {
        let err = EngineError::invocation("three", "boom");
        assert_eq!(err.to_string(), "Task 'three' failed: boom");
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_failure_preserves_kind() {
        let original = EngineError::timeout("leaf", 1, Duration::from_millis(20));
        let rebuilt: EngineError = original.to_failure("ignored").into();
        match rebuilt {
            EngineError::ResolutionTimeout {
                task,
                pending,
                waited_ms,
            } => {
                assert_eq!(task, "leaf");
                assert_eq!(pending, 1);
                assert_eq!(waited_ms, 20);
            }
            other => panic!("Expected ResolutionTimeout, got {:?}", other),
        }
    }

    #[test]
    fn test_ambient_error_becomes_invocation_failure() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let err: EngineError = io_err.into();
        match err.to_failure("worker-task") {
            Failure::Invocation { task, message } => {
                assert_eq!(task, "worker-task");
                assert!(message.contains("pipe closed"));
            }
            other => panic!("Expected Invocation failure, got {:?}", other),
        }
    }

    #[test]
    fn test_cancelled_keeps_kind_across_channel() {
        let err = EngineError::Cancelled { task: "stall".into() };
        let rebuilt: EngineError = err.to_failure("ignored").into();
        assert!(matches!(rebuilt, EngineError::Cancelled { task } if task == "stall"));
    }

    #[test]
    fn test_failure_json_is_tagged() {
        let failure = Failure::Protocol { task: "t".into() };
        let json = serde_json::to_string(&failure).unwrap();
        assert!(json.contains("\"kind\":\"protocol\""));
    }
}
