//! Error types for task engine operations.
//!
//! Provides [`TaskError`], the error enum returned by every fallible engine
//! and store operation, and [`HandlerError`], the tagged outcome a handler
//! returns when its work fails.
//!
//! Handler failures never escape the engine as `TaskError`s. The driver
//! converts them into a `FAILED` transition with structured `error_info`,
//! so callers only ever observe them through task status.

use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::types::task::TaskStatus;

/// Errors that can occur during task operations.
///
/// Each variant carries contextual information (task ID, status, etc.)
/// to aid debugging. Use [`kind`](TaskError::kind) for a stable,
/// machine-readable category.
///
/// # Examples
///
/// ```
/// use taskmill::TaskError;
///
/// let err = TaskError::AlreadyExists {
///     task_id: "dup".to_string(),
/// };
/// assert_eq!(err.kind(), "already_exists");
/// assert!(err.to_string().contains("dup"));
/// ```
#[derive(Debug, Error)]
pub enum TaskError {
    /// Request rejected before any state was written (e.g. no handler).
    #[error("validation failed: {message}")]
    Validation {
        /// What was wrong with the request.
        message: String,
    },

    /// Task with the given ID was not found.
    #[error("task not found: {task_id}")]
    NotFound {
        /// The task ID that was not found.
        task_id: String,
    },

    /// A task with the given ID already exists in storage.
    #[error("task already exists: {task_id}")]
    AlreadyExists {
        /// The duplicate task ID.
        task_id: String,
    },

    /// Attempted an invalid state machine transition.
    #[error("invalid transition from {from} to {to} for task {task_id}")]
    InvalidTransition {
        /// The task that was being transitioned.
        task_id: String,
        /// The current status of the task.
        from: TaskStatus,
        /// The target status that was rejected.
        to: TaskStatus,
        /// Optional suggestion for the caller.
        suggested_action: Option<String>,
    },

    /// The hard deadline elapsed before the operation finished.
    #[error("task {task_id} timed out after {}s", .timeout.as_secs_f64())]
    Timeout {
        /// The task that timed out.
        task_id: String,
        /// The deadline that was exceeded.
        timeout: Duration,
    },

    /// The operation was cancelled before it finished.
    #[error("task {task_id} was cancelled")]
    Cancelled {
        /// The cancelled task.
        task_id: String,
    },

    /// A handler failed.
    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),

    /// A conditional write lost a race with another writer.
    #[error(
        "concurrent modification of task {task_id}: expected {expected}, found {actual}"
    )]
    ConcurrentModification {
        /// The contested task.
        task_id: String,
        /// The status (or version) the writer expected.
        expected: String,
        /// What storage actually held.
        actual: String,
    },

    /// Transaction misuse (nested begin, commit without begin, ...).
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Backend storage error.
    #[error("store error: {0}")]
    Storage(String),

    /// A worker pool could not accept or finish the work.
    #[error("executor error: {0}")]
    Executor(String),
}

impl TaskError {
    /// Returns a stable snake_case category for this error.
    ///
    /// # Examples
    ///
    /// ```
    /// use taskmill::TaskError;
    ///
    /// assert_eq!(TaskError::Storage("disk".into()).kind(), "storage");
    /// assert_eq!(
    ///     TaskError::NotFound { task_id: "t".into() }.kind(),
    ///     "not_found"
    /// );
    /// ```
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::NotFound { .. } => "not_found",
            Self::AlreadyExists { .. } => "already_exists",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::Handler(_) => "handler",
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::Transaction(_) => "transaction",
            Self::Storage(_) => "storage",
            Self::Executor(_) => "executor",
        }
    }

    /// Returns `true` for errors caused by the backend rather than the caller.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Transaction(_))
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub(crate) fn not_found(task_id: &str) -> Self {
        Self::NotFound {
            task_id: task_id.to_string(),
        }
    }
}

/// Outcome of a failed handler invocation.
///
/// Handlers signal retry eligibility explicitly instead of through an
/// exception hierarchy: [`Retryable`](HandlerError::Retryable) failures may
/// be retried when the task's retry policy allows it,
/// [`Fatal`](HandlerError::Fatal) failures never are.
///
/// The `kind` string is matched against a retry policy's
/// `retryable_errors` set.
///
/// # Examples
///
/// ```
/// use taskmill::HandlerError;
///
/// let err = HandlerError::retryable("connection", "peer reset");
/// assert!(err.is_retryable());
/// assert_eq!(err.kind(), "connection");
///
/// let err = HandlerError::fatal("parse", "bad input");
/// assert!(!err.is_retryable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// A transient failure; the task may be retried.
    #[error("{kind}: {message}")]
    Retryable {
        /// Short error category (e.g. `connection`, `io`).
        kind: String,
        /// Human-readable description.
        message: String,
    },

    /// A permanent failure; retrying will not help.
    #[error("{kind}: {message}")]
    Fatal {
        /// Short error category.
        kind: String,
        /// Human-readable description.
        message: String,
    },
}

impl HandlerError {
    /// Builds a retryable error.
    pub fn retryable(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Retryable {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Builds a fatal error.
    pub fn fatal(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fatal {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// The error category.
    pub fn kind(&self) -> &str {
        match self {
            Self::Retryable { kind, .. } | Self::Fatal { kind, .. } => kind,
        }
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        match self {
            Self::Retryable { message, .. } | Self::Fatal { message, .. } => message,
        }
    }

    /// Returns `true` for [`HandlerError::Retryable`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    /// Serializes this error into the structured `error_info` map stored on
    /// a failed task.
    ///
    /// # Examples
    ///
    /// ```
    /// use taskmill::HandlerError;
    ///
    /// let info = HandlerError::fatal("parse", "bad input").to_error_info(2);
    /// assert_eq!(info["error"], "bad input");
    /// assert_eq!(info["error_type"], "parse");
    /// assert_eq!(info["retryable"], false);
    /// assert_eq!(info["retry_count"], 2);
    /// ```
    pub fn to_error_info(&self, retry_count: u32) -> Map<String, Value> {
        let mut info = Map::new();
        info.insert("error".into(), json!(self.message()));
        info.insert("error_type".into(), json!(self.kind()));
        info.insert("retryable".into(), json!(self.is_retryable()));
        info.insert("failed_at".into(), json!(Utc::now().to_rfc3339()));
        info.insert("retry_count".into(), json!(retry_count));
        info
    }

    /// Reconstructs a handler error from a stored `error_info` map.
    ///
    /// Maps written by something other than [`to_error_info`](Self::to_error_info)
    /// are treated as retryable with kind `unknown`.
    pub fn from_error_info(info: &Map<String, Value>) -> Self {
        let message = info
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let kind = info
            .get("error_type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let retryable = info
            .get("retryable")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        if retryable {
            Self::Retryable { kind, message }
        } else {
            Self::Fatal { kind, message }
        }
    }
}
