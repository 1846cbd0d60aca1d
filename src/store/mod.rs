//! Task persistence: the [`TaskStore`] contract and its implementations.
//!
//! # Architecture
//!
//! The storage system has three layers:
//!
//! 1. **[`TaskStore`]** -- The backend-agnostic contract, used as
//!    `Arc<dyn TaskStore>` by the lifecycle manager and the engine.
//!
//! 2. **[`GenericTaskStore<B>`](generic::GenericTaskStore)** -- All domain
//!    logic (transition validation, conditional writes, filtering, ordering,
//!    statistics, transactions) on top of a key-value backend. Has a blanket
//!    `TaskStore` impl.
//!
//! 3. **[`StorageBackend`]** -- Dumb KV trait that backends implement.
//!
//! A relational implementation,
//! [`SqliteTaskStore`](crate::store::sqlite::SqliteTaskStore), implements
//! [`TaskStore`] directly with SQL and is available behind the `sqlite`
//! feature flag.
//!
//! # Supporting Types
//!
//! - [`ListOptions`] / [`TaskFilter`] / [`OrderBy`] - parameters for `list`.
//! - [`TaskPage`] - one page of results plus the unwindowed total.
//! - [`TaskStatistics`] / [`TimeRange`] - aggregate reporting.

pub mod backend;
pub mod generic;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

pub use backend::{StorageBackend, StorageError, VersionedRecord};

use crate::constants::{DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT};
use crate::domain::{StatusUpdate, Task};
use crate::error::TaskError;
use crate::types::task::{TaskPriority, TaskStatus, TaskType};

/// Filter applied by [`TaskStore::list`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    /// Only tasks of this type.
    pub task_type: Option<TaskType>,
    /// Only tasks in this status.
    pub status: Option<TaskStatus>,
    /// Only tasks with this priority.
    pub priority: Option<TaskPriority>,
}

impl TaskFilter {
    /// Returns `true` if `task` passes every set criterion.
    pub fn matches(&self, task: &Task) -> bool {
        self.task_type.as_ref().is_none_or(|t| *t == task.task_type)
            && self.status.is_none_or(|s| s == task.status)
            && self.priority.is_none_or(|p| p == task.priority)
    }
}

/// Sort key for [`TaskStore::list`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderBy {
    /// Creation time.
    #[default]
    CreatedAt,
    /// Priority weight.
    Priority,
    /// Status name.
    Status,
}

/// Parameters for listing tasks with offset pagination.
///
/// # Examples
///
/// ```
/// use taskmill::store::{ListOptions, OrderBy};
/// use taskmill::TaskStatus;
///
/// let options = ListOptions::default()
///     .with_status(TaskStatus::Completed)
///     .with_window(50, 100)
///     .ordered_by(OrderBy::Priority, true);
/// assert_eq!(options.limit, 50);
/// assert_eq!(options.offset, 100);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOptions {
    /// Record filter.
    pub filter: TaskFilter,
    /// Page size, clamped to `1..=1000`.
    pub limit: usize,
    /// Records to skip.
    pub offset: usize,
    /// Sort key.
    pub order_by: OrderBy,
    /// Sort descending.
    pub descending: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            filter: TaskFilter::default(),
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
            order_by: OrderBy::CreatedAt,
            descending: true,
        }
    }
}

impl ListOptions {
    /// Restricts to one status.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.filter.status = Some(status);
        self
    }

    /// Restricts to one task type.
    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.filter.task_type = Some(task_type);
        self
    }

    /// Restricts to one priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.filter.priority = Some(priority);
        self
    }

    /// Sets the page window.
    pub fn with_window(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    /// Sets the sort order.
    pub fn ordered_by(mut self, order_by: OrderBy, descending: bool) -> Self {
        self.order_by = order_by;
        self.descending = descending;
        self
    }

    /// The page size actually applied.
    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_LIST_LIMIT)
    }
}

/// A page of tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskPage {
    /// Tasks in the requested window.
    pub items: Vec<Task>,
    /// Matching tasks before windowing.
    pub total: usize,
}

/// Creation-time window for [`TaskStore::get_statistics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Inclusive lower bound.
    pub start: DateTime<Utc>,
    /// Inclusive upper bound.
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// The window ending now and reaching `span` into the past.
    pub fn last(span: ChronoDuration) -> Self {
        let end = Utc::now();
        Self {
            start: end - span,
            end,
        }
    }

    /// Returns `true` if `at` lies inside the window.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

/// Task counts created within the last hour, day, and week.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentActivity {
    /// Created in the last hour.
    pub last_hour: usize,
    /// Created in the last 24 hours.
    pub last_day: usize,
    /// Created in the last 7 days.
    pub last_week: usize,
}

/// Aggregate statistics over stored tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStatistics {
    /// Tasks considered.
    pub total: usize,
    /// Counts keyed by status name.
    pub by_status: BTreeMap<String, usize>,
    /// Counts keyed by task type name.
    pub by_type: BTreeMap<String, usize>,
    /// Counts keyed by priority name.
    pub by_priority: BTreeMap<String, usize>,
    /// `completed / (completed + failed) * 100`, or `0.0` with neither.
    pub success_rate: f64,
    /// Mean execution time in seconds over completed tasks.
    pub average_execution_time: Option<f64>,
    /// Recent creation counts.
    pub recent: RecentActivity,
}

impl TaskStatistics {
    /// Aggregates statistics over an in-memory set of tasks.
    ///
    /// Used by key-value backed stores; relational stores compute the same
    /// numbers in SQL.
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>, now: DateTime<Utc>) -> Self {
        let mut stats = Self::default();
        let mut exec_total = 0.0;
        let mut exec_samples = 0usize;

        for task in tasks {
            stats.total += 1;
            *stats
                .by_status
                .entry(task.status.to_string())
                .or_default() += 1;
            *stats
                .by_type
                .entry(task.task_type.to_string())
                .or_default() += 1;
            *stats
                .by_priority
                .entry(task.priority.to_string())
                .or_default() += 1;

            if task.status == TaskStatus::Completed {
                if let Some(elapsed) = task.execution_time() {
                    exec_total += elapsed.as_secs_f64();
                    exec_samples += 1;
                }
            }

            let age = now - task.created_at;
            if age <= ChronoDuration::hours(1) {
                stats.recent.last_hour += 1;
            }
            if age <= ChronoDuration::days(1) {
                stats.recent.last_day += 1;
            }
            if age <= ChronoDuration::weeks(1) {
                stats.recent.last_week += 1;
            }
        }

        let completed = stats.count(TaskStatus::Completed);
        let failed = stats.count(TaskStatus::Failed);
        stats.success_rate = success_rate(completed, failed);
        if exec_samples > 0 {
            stats.average_execution_time = Some(exec_total / exec_samples as f64);
        }
        stats
    }

    /// The count recorded for `status`.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.by_status.get(status.as_str()).copied().unwrap_or(0)
    }
}

pub(crate) fn success_rate(completed: usize, failed: usize) -> f64 {
    let finished = completed + failed;
    if finished == 0 {
        0.0
    } else {
        completed as f64 / finished as f64 * 100.0
    }
}

/// Backend-agnostic task persistence contract.
///
/// Every write path is safe under concurrent callers: single-task writes are
/// conditional (compare-and-swap or `UPDATE ... WHERE status = ?`), so two
/// writers racing on one task id cannot both succeed.
///
/// Transactions are scoped to the store instance; nesting is rejected with
/// [`TaskError::Transaction`].
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persists a new task.
    ///
    /// # Errors
    ///
    /// - [`TaskError::AlreadyExists`] if the id is taken.
    async fn create(&self, task: Task) -> Result<Task, TaskError>;

    /// Fetches a task. A missing id is `Ok(None)`, not an error.
    async fn get(&self, task_id: &str) -> Result<Option<Task>, TaskError>;

    /// Applies a conditional status transition and stamps timestamps.
    ///
    /// # Errors
    ///
    /// - [`TaskError::NotFound`] if the task does not exist.
    /// - [`TaskError::ConcurrentModification`] if `update.expected` does not
    ///   match the stored status.
    /// - [`TaskError::InvalidTransition`] if the table forbids the move.
    async fn update_status(&self, task_id: &str, update: StatusUpdate)
        -> Result<Task, TaskError>;

    /// Moves a failed or timed-out task into `Retrying`, incrementing
    /// `retry_count` and clearing outcome and timestamps.
    ///
    /// # Errors
    ///
    /// - [`TaskError::NotFound`] if the task does not exist.
    /// - [`TaskError::ConcurrentModification`] if the stored status is not
    ///   `expected`.
    /// - [`TaskError::Validation`] if the retry budget is exhausted.
    async fn update_retry(&self, task_id: &str, expected: TaskStatus)
        -> Result<Task, TaskError>;

    /// Lists tasks matching `options.filter`, ordered and windowed.
    async fn list(&self, options: ListOptions) -> Result<TaskPage, TaskError>;

    /// Pending tasks by priority descending, then creation ascending.
    async fn get_pending(&self, limit: usize) -> Result<Vec<Task>, TaskError>;

    /// Every task currently `Running`.
    async fn get_running(&self) -> Result<Vec<Task>, TaskError>;

    /// `Running` tasks whose `started_at` is older than `started_before`.
    async fn get_timeout_candidates(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Task>, TaskError>;

    /// Aggregate statistics, optionally limited to a creation-time window.
    async fn get_statistics(&self, range: Option<TimeRange>)
        -> Result<TaskStatistics, TaskError>;

    /// Deletes a task. Returns `true` if it existed.
    async fn delete(&self, task_id: &str) -> Result<bool, TaskError>;

    /// Deletes tasks in one of `statuses` created before `older_than`.
    /// Returns the number deleted.
    async fn delete_old(
        &self,
        older_than: DateTime<Utc>,
        statuses: &[TaskStatus],
    ) -> Result<usize, TaskError>;

    /// Transitions each listed task to `status`, skipping tasks that are
    /// missing or for which the move is illegal. Returns the number updated.
    async fn bulk_update_status(
        &self,
        task_ids: &[String],
        status: TaskStatus,
    ) -> Result<usize, TaskError>;

    /// Returns `true` if the backend is reachable.
    async fn health_check(&self) -> Result<bool, TaskError>;

    /// Opens a transaction.
    ///
    /// Transactions are store-wide, not per caller: at most one is open at a
    /// time, and it captures every write made through this store until
    /// `commit` or `rollback`, whichever task or driver issued it. A rollback
    /// therefore also reverts status changes the engine made concurrently.
    /// Use them for maintenance work on a quiesced store.
    ///
    /// # Errors
    ///
    /// - [`TaskError::Transaction`] if one is already open.
    async fn begin_transaction(&self) -> Result<(), TaskError>;

    /// Commits the open transaction.
    ///
    /// # Errors
    ///
    /// - [`TaskError::Transaction`] if none is open.
    async fn commit(&self) -> Result<(), TaskError>;

    /// Discards every write made since `begin_transaction`, including writes
    /// from other callers of the same store.
    ///
    /// # Errors
    ///
    /// - [`TaskError::Transaction`] if none is open.
    async fn rollback(&self) -> Result<(), TaskError>;
}

// Blanket implementation: GenericTaskStore<B> implements TaskStore for any
// StorageBackend B.
#[async_trait]
impl<B: StorageBackend + 'static> TaskStore for generic::GenericTaskStore<B> {
    async fn create(&self, task: Task) -> Result<Task, TaskError> {
        self.create(task).await
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>, TaskError> {
        self.get(task_id).await
    }

    async fn update_status(
        &self,
        task_id: &str,
        update: StatusUpdate,
    ) -> Result<Task, TaskError> {
        self.update_status(task_id, update).await
    }

    async fn update_retry(&self, task_id: &str, expected: TaskStatus) -> Result<Task, TaskError> {
        self.update_retry(task_id, expected).await
    }

    async fn list(&self, options: ListOptions) -> Result<TaskPage, TaskError> {
        self.list(options).await
    }

    async fn get_pending(&self, limit: usize) -> Result<Vec<Task>, TaskError> {
        self.get_pending(limit).await
    }

    async fn get_running(&self) -> Result<Vec<Task>, TaskError> {
        self.get_running().await
    }

    async fn get_timeout_candidates(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Task>, TaskError> {
        self.get_timeout_candidates(started_before).await
    }

    async fn get_statistics(&self, range: Option<TimeRange>) -> Result<TaskStatistics, TaskError> {
        self.get_statistics(range).await
    }

    async fn delete(&self, task_id: &str) -> Result<bool, TaskError> {
        self.delete(task_id).await
    }

    async fn delete_old(
        &self,
        older_than: DateTime<Utc>,
        statuses: &[TaskStatus],
    ) -> Result<usize, TaskError> {
        self.delete_old(older_than, statuses).await
    }

    async fn bulk_update_status(
        &self,
        task_ids: &[String],
        status: TaskStatus,
    ) -> Result<usize, TaskError> {
        self.bulk_update_status(task_ids, status).await
    }

    async fn health_check(&self) -> Result<bool, TaskError> {
        self.health_check().await
    }

    async fn begin_transaction(&self) -> Result<(), TaskError> {
        self.begin_transaction()
    }

    async fn commit(&self) -> Result<(), TaskError> {
        self.commit()
    }

    async fn rollback(&self) -> Result<(), TaskError> {
        self.rollback().await
    }
}
