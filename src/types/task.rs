//! Task enumerations: status, type, priority, and execution mode.
//!
//! All enums serialize as the lowercase/snake_case strings stored in the
//! `tasks` table, except [`TaskPriority`], which is persisted as its
//! integer weight so that `ORDER BY priority DESC` works directly.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// Task lifecycle status.
///
/// A task progresses through these states according to a fixed transition
/// table. `Completed` and `Cancelled` are terminal: they have no outgoing
/// edges. `Failed` and `Timeout` are failure states that may still move to
/// `Retrying` (and `Timeout` to `Failed`).
///
/// # State Machine
///
/// ```text
/// Pending  -> Running, Cancelled
/// Running  -> Completed, Failed, Timeout, Cancelled, Retrying
/// Retrying -> Running, Failed, Cancelled
/// Failed   -> Retrying
/// Timeout  -> Retrying, Failed
/// Completed, Cancelled -> (terminal, no transitions)
/// ```
///
/// # Examples
///
/// ```
/// use taskmill::TaskStatus;
///
/// let status = TaskStatus::Pending;
/// assert!(!status.is_terminal());
/// assert!(status.can_transition_to(&TaskStatus::Running));
/// assert!(!status.can_transition_to(&TaskStatus::Completed));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting for a driver to pick it up.
    Pending,
    /// A driver is executing the handler.
    Running,
    /// Accepted for another attempt; waiting out the backoff delay.
    Retrying,
    /// Handler returned a result (terminal).
    Completed,
    /// Handler failed.
    Failed,
    /// Hard deadline exceeded.
    Timeout,
    /// Cancelled by a caller (terminal).
    Cancelled,
}

impl TaskStatus {
    /// Every status, in declaration order.
    pub const ALL: [TaskStatus; 7] = [
        Self::Pending,
        Self::Running,
        Self::Retrying,
        Self::Completed,
        Self::Failed,
        Self::Timeout,
        Self::Cancelled,
    ];

    /// Returns the snake_case name used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns `true` if this status has no outgoing transitions.
    ///
    /// # Examples
    ///
    /// ```
    /// use taskmill::TaskStatus;
    ///
    /// assert!(TaskStatus::Completed.is_terminal());
    /// assert!(TaskStatus::Cancelled.is_terminal());
    /// assert!(!TaskStatus::Failed.is_terminal());
    /// ```
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Returns `true` while work is in flight (`Running` or `Retrying`).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Retrying)
    }

    /// Returns `true` only for `Completed`.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Returns `true` for `Failed` and `Timeout`.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Timeout)
    }

    /// Returns `true` once the task has stopped executing, whether or not it
    /// can still be retried.
    pub fn is_finished(&self) -> bool {
        self.is_terminal() || self.is_failure()
    }

    /// Returns `true` if transitioning from this status to `next` is valid.
    ///
    /// Self-transitions are never valid.
    ///
    /// # Examples
    ///
    /// ```
    /// use taskmill::TaskStatus;
    ///
    /// assert!(TaskStatus::Running.can_transition_to(&TaskStatus::Retrying));
    /// assert!(TaskStatus::Failed.can_transition_to(&TaskStatus::Retrying));
    /// assert!(!TaskStatus::Failed.can_transition_to(&TaskStatus::Pending));
    /// assert!(!TaskStatus::Running.can_transition_to(&TaskStatus::Running));
    /// ```
    pub fn can_transition_to(&self, next: &Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Cancelled),
            Self::Running => matches!(
                next,
                Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled | Self::Retrying
            ),
            Self::Retrying => matches!(next, Self::Running | Self::Failed | Self::Cancelled),
            Self::Failed => matches!(next, Self::Retrying),
            Self::Timeout => matches!(next, Self::Retrying | Self::Failed),
            Self::Completed | Self::Cancelled => false,
        }
    }

    /// Returns the statuses reachable from this one.
    pub fn allowed_transitions(&self) -> Vec<TaskStatus> {
        Self::ALL
            .into_iter()
            .filter(|next| self.can_transition_to(next))
            .collect()
    }

    /// Validates a transition from this status to `next`.
    ///
    /// Returns `Ok(())` if the transition is valid, or a
    /// [`TaskError::InvalidTransition`] with context about the rejected
    /// transition.
    ///
    /// # Examples
    ///
    /// ```
    /// use taskmill::TaskStatus;
    ///
    /// assert!(TaskStatus::Running
    ///     .validate_transition("task-123", &TaskStatus::Completed)
    ///     .is_ok());
    /// assert!(TaskStatus::Completed
    ///     .validate_transition("task-123", &TaskStatus::Running)
    ///     .is_err());
    /// ```
    pub fn validate_transition(&self, task_id: &str, next: &Self) -> Result<(), TaskError> {
        if self.can_transition_to(next) {
            return Ok(());
        }

        let suggested_action = if self.is_terminal() {
            Some("task is in a terminal state and cannot be transitioned".to_string())
        } else if self == next {
            Some(format!("task is already in {self} state"))
        } else if self.is_failure() && *next == Self::Pending {
            Some("use retry to move a failed task back into execution".to_string())
        } else {
            None
        };

        Err(TaskError::InvalidTransition {
            task_id: task_id.to_string(),
            from: *self,
            to: *next,
            suggested_action,
        })
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| TaskError::validation(format!("unknown task status: {s}")))
    }
}

/// Identifies which registered handler runs a task.
///
/// The four built-in kinds come with default retry, timeout, and routing
/// policies. [`TaskType::Custom`] lets collaborators register new kinds;
/// they fall back to the default policies.
///
/// # Examples
///
/// ```
/// use taskmill::TaskType;
///
/// assert_eq!(TaskType::TestExecution.as_str(), "test_execution");
/// assert_eq!("report_generation".parse::<TaskType>().unwrap(), TaskType::ReportGeneration);
/// assert_eq!(
///     "image_resize".parse::<TaskType>().unwrap(),
///     TaskType::Custom("image_resize".to_string())
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskType {
    /// Analyze an uploaded document.
    DocumentAnalysis,
    /// Generate test cases.
    TestGeneration,
    /// Execute generated tests.
    TestExecution,
    /// Render a report.
    ReportGeneration,
    /// Any other kind registered by a collaborator.
    Custom(String),
}

impl TaskType {
    /// The built-in kinds.
    pub const BUILTIN: [TaskType; 4] = [
        Self::DocumentAnalysis,
        Self::TestGeneration,
        Self::TestExecution,
        Self::ReportGeneration,
    ];

    /// Returns the snake_case name used in storage and logs.
    pub fn as_str(&self) -> &str {
        match self {
            Self::DocumentAnalysis => "document_analysis",
            Self::TestGeneration => "test_generation",
            Self::TestExecution => "test_execution",
            Self::ReportGeneration => "report_generation",
            Self::Custom(name) => name,
        }
    }

    /// Default routing for this kind when the task does not pin a mode.
    ///
    /// Returns `None` for custom kinds; the executor then picks based on the
    /// handler's flavor.
    pub fn default_execution_mode(&self) -> Option<ExecutionMode> {
        match self {
            Self::DocumentAnalysis | Self::TestGeneration | Self::ReportGeneration => {
                Some(ExecutionMode::CpuIntensive)
            }
            Self::TestExecution => Some(ExecutionMode::IoIntensive),
            Self::Custom(_) => None,
        }
    }
}

impl From<String> for TaskType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "document_analysis" => Self::DocumentAnalysis,
            "test_generation" => Self::TestGeneration,
            "test_execution" => Self::TestExecution,
            "report_generation" => Self::ReportGeneration,
            _ => Self::Custom(s),
        }
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<TaskType> for String {
    fn from(t: TaskType) -> Self {
        match t {
            TaskType::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl FromStr for TaskType {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(TaskError::validation("task type must not be empty"));
        }
        Ok(Self::from(s))
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority. Higher values are picked first from the pending
/// queue.
///
/// # Examples
///
/// ```
/// use taskmill::TaskPriority;
///
/// assert!(TaskPriority::Urgent > TaskPriority::High);
/// assert_eq!(TaskPriority::Normal.value(), 5);
/// assert_eq!(TaskPriority::from_value(10), Some(TaskPriority::High));
/// ```
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "i64", into = "i64")]
pub enum TaskPriority {
    /// Background work.
    Low,
    /// The default.
    #[default]
    Normal,
    /// Ahead of normal work.
    High,
    /// Ahead of everything else.
    Urgent,
}

impl TaskPriority {
    /// Every priority, lowest first.
    pub const ALL: [TaskPriority; 4] = [Self::Low, Self::Normal, Self::High, Self::Urgent];

    /// The persisted integer weight.
    pub fn value(&self) -> i64 {
        match self {
            Self::Low => 1,
            Self::Normal => 5,
            Self::High => 10,
            Self::Urgent => 20,
        }
    }

    /// Maps a persisted weight back to a priority.
    pub fn from_value(value: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.value() == value)
    }
}

impl From<TaskPriority> for i64 {
    fn from(p: TaskPriority) -> Self {
        p.value()
    }
}

impl TryFrom<i64> for TaskPriority {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::from_value(value).ok_or_else(|| format!("unknown task priority: {value}"))
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        };
        f.write_str(name)
    }
}

/// Routing hint for the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Blocking, compute-heavy work: CPU pool.
    CpuIntensive,
    /// Blocking IO: IO pool.
    IoIntensive,
    /// Cheap async work awaited inline on the runtime.
    AsyncCoroutine,
}

impl ExecutionMode {
    /// Every mode.
    pub const ALL: [Self; 3] = [Self::CpuIntensive, Self::IoIntensive, Self::AsyncCoroutine];

    /// Returns the snake_case name used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CpuIntensive => "cpu_intensive",
            Self::IoIntensive => "io_intensive",
            Self::AsyncCoroutine => "async_coroutine",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu_intensive" => Ok(Self::CpuIntensive),
            "io_intensive" => Ok(Self::IoIntensive),
            "async_coroutine" => Ok(Self::AsyncCoroutine),
            other => Err(TaskError::validation(format!(
                "unknown execution mode: {other}"
            ))),
        }
    }
}
