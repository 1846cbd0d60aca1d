//! Task record -- the persisted representation of one unit of work.
//!
//! [`Task`] carries identity, routing, lifecycle timestamps, the caller's
//! opaque payload, and the outcome. [`TaskRequest`] is the submission
//! shape; [`StatusUpdate`] is the conditional write the lifecycle layer
//! hands to the store.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::constants::DEFAULT_MAX_RETRIES;
use crate::types::task::{ExecutionMode, TaskPriority, TaskStatus, TaskType};

/// Opaque key-value payload. The engine never interprets its contents.
pub type Payload = Map<String, Value>;

/// Persisted state of a task.
///
/// All fields are public so that store implementors have full access.
///
/// # Invariants
///
/// - `started_at` is set once, on the first `Running` transition.
/// - `completed_at` is set once, on reaching a finished status.
/// - Once terminal, exactly one of `result_data` / `error_info` is set.
/// - `retry_count <= max_retries`.
///
/// # Examples
///
/// ```
/// use taskmill::{Task, TaskRequest, TaskStatus, TaskType};
///
/// let task = Task::from_request(TaskRequest::new(TaskType::DocumentAnalysis));
/// assert_eq!(task.status, TaskStatus::Pending);
/// assert!(!task.task_id.is_empty());
/// assert_eq!(task.max_retries, 3);
/// assert!(task.started_at.is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Globally unique identifier, immutable.
    pub task_id: String,
    /// Selects the handler.
    pub task_type: TaskType,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Pending-queue ordering weight.
    pub priority: TaskPriority,
    /// Pinned routing. `None` lets the executor decide.
    pub execution_mode: Option<ExecutionMode>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// First `Running` transition.
    pub started_at: Option<DateTime<Utc>>,
    /// First finished transition.
    pub completed_at: Option<DateTime<Utc>>,
    /// Caller-owned input.
    pub input_data: Payload,
    /// Handler output, set on `Completed`.
    pub result_data: Option<Payload>,
    /// Structured failure description, set on failure or cancellation.
    pub error_info: Option<Payload>,
    /// Retries accepted so far.
    pub retry_count: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// Per-task timeout override in seconds. `0` inherits the policy.
    pub timeout_seconds: u64,
    /// Free-form annotations.
    pub metadata: Payload,
}

impl Task {
    /// Builds a new `Pending` task from a submission request.
    ///
    /// Generates a `UUIDv4` id when the request does not carry one.
    pub fn from_request(request: TaskRequest) -> Self {
        Self {
            task_id: request
                .task_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            task_type: request.task_type,
            status: TaskStatus::Pending,
            priority: request.priority,
            execution_mode: request.execution_mode,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            input_data: request.input_data,
            result_data: None,
            error_info: None,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            timeout_seconds: request.timeout_seconds.unwrap_or(0),
            metadata: request.metadata,
        }
    }

    /// Returns `true` if the task has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall time between start and finish, if both are known.
    pub fn execution_time(&self) -> Option<Duration> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        (completed - started).to_std().ok()
    }

    /// Wall time spent waiting before the first `Running` transition.
    pub fn queue_time(&self) -> Option<Duration> {
        let started = self.started_at?;
        (started - self.created_at).to_std().ok()
    }

    /// The per-task timeout override, if any.
    pub fn timeout_override(&self) -> Option<Duration> {
        (self.timeout_seconds > 0).then(|| Duration::from_secs(self.timeout_seconds))
    }

    /// Applies lifecycle timestamps for a transition into `status`.
    ///
    /// `started_at` is stamped on `Running` and `completed_at` on any
    /// finished status; neither is overwritten once set.
    pub fn stamp_for(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        if status == TaskStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if status.is_finished() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
    }

    /// Clears outcome and timestamps for a new attempt and bumps the retry
    /// counter.
    pub fn reset_for_retry(&mut self) {
        self.retry_count += 1;
        self.result_data = None;
        self.error_info = None;
        self.started_at = None;
        self.completed_at = None;
    }
}

/// Parameters for submitting a task.
///
/// # Examples
///
/// ```
/// use taskmill::{TaskPriority, TaskRequest, TaskType};
/// use serde_json::json;
///
/// let request = TaskRequest::new(TaskType::TestExecution)
///     .with_input("suite", json!("smoke"))
///     .with_priority(TaskPriority::High)
///     .with_timeout_seconds(30)
///     .with_max_retries(1);
/// assert_eq!(request.input_data["suite"], "smoke");
/// ```
#[derive(Debug, Clone)]
pub struct TaskRequest {
    /// Caller-chosen id. Generated when `None`.
    pub task_id: Option<String>,
    /// Selects the handler.
    pub task_type: TaskType,
    /// Opaque input.
    pub input_data: Payload,
    /// Scheduling priority.
    pub priority: TaskPriority,
    /// Pinned routing.
    pub execution_mode: Option<ExecutionMode>,
    /// Timeout override in seconds.
    pub timeout_seconds: Option<u64>,
    /// Retry budget override.
    pub max_retries: Option<u32>,
    /// Free-form annotations.
    pub metadata: Payload,
}

impl TaskRequest {
    /// Starts a request for the given task type.
    pub fn new(task_type: impl Into<TaskType>) -> Self {
        Self {
            task_id: None,
            task_type: task_type.into(),
            input_data: Payload::new(),
            priority: TaskPriority::default(),
            execution_mode: None,
            timeout_seconds: None,
            max_retries: None,
            metadata: Payload::new(),
        }
    }

    /// Uses a caller-chosen id instead of a generated one.
    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// Replaces the whole input payload.
    pub fn with_input_data(mut self, input: Payload) -> Self {
        self.input_data = input;
        self
    }

    /// Adds one input field.
    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.input_data.insert(key.into(), value);
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Pins the execution mode.
    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = Some(mode);
        self
    }

    /// Overrides the timeout.
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Overrides the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Adds one metadata field.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A conditional status write.
///
/// The store applies the update only if the task's current status equals
/// `expected` (when set) and the transition is legal; otherwise it fails
/// without writing.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    /// Target status.
    pub status: TaskStatus,
    /// Required current status. `None` skips the check (the transition
    /// table is still enforced).
    pub expected: Option<TaskStatus>,
    /// Result to store alongside the transition.
    pub result_data: Option<Payload>,
    /// Error info to store alongside the transition.
    pub error_info: Option<Payload>,
}

impl StatusUpdate {
    /// An update to `status` with no precondition and no outcome.
    pub fn to(status: TaskStatus) -> Self {
        Self {
            status,
            expected: None,
            result_data: None,
            error_info: None,
        }
    }

    /// Requires the current status to be `expected`.
    pub fn expecting(mut self, expected: TaskStatus) -> Self {
        self.expected = Some(expected);
        self
    }

    /// Attaches a result.
    pub fn with_result(mut self, result: Payload) -> Self {
        self.result_data = Some(result);
        self
    }

    /// Attaches error info.
    pub fn with_error(mut self, error_info: Payload) -> Self {
        self.error_info = Some(error_info);
        self
    }
}
