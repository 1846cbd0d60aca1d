//! Lifecycle manager: validated status transitions plus an event bus.
//!
//! [`LifecycleManager::transition_task_status`] is the only path the engine
//! uses to change a task's status. It validates the move against the
//! transition table, writes it conditionally (the stored status must still
//! be the one the caller observed), stamps timestamps, and then notifies
//! registered [`EventHandler`]s.
//!
//! Event delivery is best-effort: a handler that fails or panics is logged
//! and the remaining handlers still run. The transition itself is never
//! rolled back because of a handler.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::constants::MAX_EVENT_HISTORY;
use crate::domain::{Payload, StatusUpdate, Task};
use crate::error::TaskError;
use crate::executor::panic_message;
use crate::store::TaskStore;
use crate::types::task::TaskStatus;

/// Kind of lifecycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventType {
    /// Task persisted in `Pending`.
    TaskCreated,
    /// Task entered `Running`.
    TaskStarted,
    /// Task entered `Completed`.
    TaskCompleted,
    /// Task entered `Failed`.
    TaskFailed,
    /// Task entered `Retrying`.
    TaskRetrying,
    /// Task entered `Cancelled`.
    TaskCancelled,
    /// Task entered `Timeout`.
    TaskTimeout,
}

impl LifecycleEventType {
    /// The event emitted when a task enters `status`.
    pub fn for_status(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Pending => Self::TaskCreated,
            TaskStatus::Running => Self::TaskStarted,
            TaskStatus::Retrying => Self::TaskRetrying,
            TaskStatus::Completed => Self::TaskCompleted,
            TaskStatus::Failed => Self::TaskFailed,
            TaskStatus::Timeout => Self::TaskTimeout,
            TaskStatus::Cancelled => Self::TaskCancelled,
        }
    }
}

impl fmt::Display for LifecycleEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TaskCreated => "task_created",
            Self::TaskStarted => "task_started",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::TaskRetrying => "task_retrying",
            Self::TaskCancelled => "task_cancelled",
            Self::TaskTimeout => "task_timeout",
        };
        f.write_str(name)
    }
}

/// A status-change notification.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleEvent {
    /// Affected task.
    pub task_id: String,
    /// What happened.
    pub event_type: LifecycleEventType,
    /// Status before the change; `None` for creation.
    pub old_status: Option<TaskStatus>,
    /// Status after the change.
    pub new_status: TaskStatus,
    /// When the change was applied.
    pub timestamp: DateTime<Utc>,
    /// Extra context supplied by the caller of the transition.
    pub payload: Payload,
}

type SyncEventFn = dyn Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync;
type AsyncEventFn = dyn Fn(LifecycleEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// A lifecycle subscriber, either synchronous or asynchronous.
///
/// The flavor is fixed when the handler is built; dispatch never inspects
/// the callable at call time.
#[derive(Clone)]
pub enum EventHandler {
    /// Called inline on the emitting task.
    Sync(Arc<SyncEventFn>),
    /// Awaited inline on the emitting task.
    Async(Arc<AsyncEventFn>),
}

impl EventHandler {
    /// Wraps a synchronous callback.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    /// Wraps an asynchronous callback.
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(LifecycleEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::Async(Arc::new(move |event| f(event).boxed()))
    }

    async fn dispatch(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        match self {
            Self::Sync(f) => f(event),
            Self::Async(f) => f(event.clone()).await,
        }
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("EventHandler::Sync"),
            Self::Async(_) => f.write_str("EventHandler::Async"),
        }
    }
}

/// Optional outcome written together with a transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionOutcome {
    /// Result to store (for `Completed`).
    pub result_data: Option<Payload>,
    /// Error info to store (for failures and cancellation).
    pub error_info: Option<Payload>,
    /// Extra event payload; not persisted.
    pub event_payload: Payload,
}

impl TransitionOutcome {
    /// An outcome carrying a result.
    pub fn result(result: Payload) -> Self {
        Self {
            result_data: Some(result),
            ..Self::default()
        }
    }

    /// An outcome carrying error info.
    pub fn error(error_info: Payload) -> Self {
        Self {
            error_info: Some(error_info),
            ..Self::default()
        }
    }
}

/// Applies validated transitions and fans out lifecycle events.
pub struct LifecycleManager {
    store: Arc<dyn TaskStore>,
    handlers: RwLock<Vec<(Option<LifecycleEventType>, EventHandler)>>,
    history: Mutex<VecDeque<LifecycleEvent>>,
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("handlers", &self.handlers.read().len())
            .field("history", &self.history.lock().len())
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    /// Creates a manager writing through `store`.
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            handlers: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// The store transitions are written to.
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Subscribes `handler` to one event type.
    pub fn on(&self, event_type: LifecycleEventType, handler: EventHandler) {
        self.handlers.write().push((Some(event_type), handler));
    }

    /// Subscribes `handler` to every event.
    pub fn on_any(&self, handler: EventHandler) {
        self.handlers.write().push((None, handler));
    }

    /// Returns `true` if the table allows `from -> to`.
    pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
        from.can_transition_to(&to)
    }

    /// Fails with [`TaskError::InvalidTransition`] unless `from -> to` is legal.
    pub fn validate_transition(task_id: &str, from: TaskStatus, to: TaskStatus) -> Result<(), TaskError> {
        from.validate_transition(task_id, &to)
    }

    /// `Completed` or `Cancelled`.
    pub fn is_terminal_state(status: TaskStatus) -> bool {
        status.is_terminal()
    }

    /// `Running` or `Retrying`.
    pub fn is_active_state(status: TaskStatus) -> bool {
        status.is_active()
    }

    /// `Completed`.
    pub fn is_success_state(status: TaskStatus) -> bool {
        status.is_success()
    }

    /// `Failed` or `Timeout`.
    pub fn is_failure_state(status: TaskStatus) -> bool {
        status.is_failure()
    }

    /// Moves `task` from its observed status to `new_status`.
    ///
    /// The write only succeeds if storage still holds `task.status`, so a
    /// concurrent writer surfaces as [`TaskError::ConcurrentModification`].
    ///
    /// # Errors
    ///
    /// - [`TaskError::InvalidTransition`] before anything is written if the
    ///   table forbids the move.
    /// - Any error from [`TaskStore::update_status`].
    pub async fn transition_task_status(
        &self,
        task: &Task,
        new_status: TaskStatus,
        outcome: TransitionOutcome,
    ) -> Result<Task, TaskError> {
        Self::validate_transition(&task.task_id, task.status, new_status)?;

        let update = StatusUpdate {
            status: new_status,
            expected: Some(task.status),
            result_data: outcome.result_data,
            error_info: outcome.error_info,
        };
        let updated = self.store.update_status(&task.task_id, update).await?;

        tracing::info!(
            task_id = %task.task_id,
            from = %task.status,
            to = %new_status,
            "task status changed"
        );

        self.emit(LifecycleEvent {
            task_id: task.task_id.clone(),
            event_type: LifecycleEventType::for_status(new_status),
            old_status: Some(task.status),
            new_status,
            timestamp: Utc::now(),
            payload: outcome.event_payload,
        })
        .await;

        Ok(updated)
    }

    /// Emits `task_created` for a freshly persisted task.
    pub async fn record_created(&self, task: &Task) {
        self.emit(LifecycleEvent {
            task_id: task.task_id.clone(),
            event_type: LifecycleEventType::TaskCreated,
            old_status: None,
            new_status: task.status,
            timestamp: task.created_at,
            payload: Payload::new(),
        })
        .await;
    }

    /// Records a status change applied outside this manager (for example a
    /// retry reset written by the store) and notifies subscribers.
    pub async fn record_transition(&self, task: &Task, old_status: TaskStatus) {
        self.emit(LifecycleEvent {
            task_id: task.task_id.clone(),
            event_type: LifecycleEventType::for_status(task.status),
            old_status: Some(old_status),
            new_status: task.status,
            timestamp: Utc::now(),
            payload: Payload::new(),
        })
        .await;
    }

    async fn emit(&self, event: LifecycleEvent) {
        let matching: Vec<EventHandler> = self
            .handlers
            .read()
            .iter()
            .filter(|(filter, _)| filter.is_none_or(|t| t == event.event_type))
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in matching {
            let outcome = AssertUnwindSafe(handler.dispatch(&event))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(anyhow::anyhow!(
                        "subscriber panicked: {}",
                        panic_message(payload.as_ref())
                    ))
                });
            if let Err(e) = outcome {
                tracing::warn!(
                    task_id = %event.task_id,
                    event = %event.event_type,
                    error = %e,
                    "lifecycle event handler failed"
                );
            }
        }

        let mut history = self.history.lock();
        if history.len() >= MAX_EVENT_HISTORY {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// The most recent `limit` events, oldest first.
    pub fn event_history(&self, limit: usize) -> Vec<LifecycleEvent> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }
}
