//! The task orchestrator.
//!
//! [`TaskEngine`] owns one instance of every manager and a handler registry.
//! `submit` persists a `Pending` task and spawns a driver for it; the driver
//! is the only writer of that task's status while it lives. Status writes are
//! conditional on the status the writer observed, so the engine needs no
//! global lock: a `cancel` or a timeout sweep racing a driver simply makes
//! one of the two writes fail with [`TaskError::ConcurrentModification`],
//! and the loser backs off.
//!
//! # Cancellation
//!
//! Cancellation is cooperative. A driver selects on its
//! [`CancellationToken`] alongside the handler, so async handlers are dropped
//! at their next suspension point. Work already handed to a pool thread keeps
//! running until it returns; its result is discarded.
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use taskmill::engine::TaskEngine;
//! use taskmill::executor::TaskHandler;
//! use taskmill::{TaskRequest, TaskType};
//!
//! # async fn example() -> Result<(), taskmill::TaskError> {
//! let engine = TaskEngine::builder()
//!     .handler(
//!         TaskType::ReportGeneration,
//!         TaskHandler::sync(|input, ctx| {
//!             ctx.set_progress(50.0, Some("rendering"));
//!             let mut out = input;
//!             out.insert("rendered".into(), json!(true));
//!             Ok(out)
//!         }),
//!     )
//!     .build()?;
//! engine.start();
//!
//! let task_id = engine
//!     .submit(TaskRequest::new(TaskType::ReportGeneration).with_input("id", json!(7)))
//!     .await?;
//! let task = engine.get_status(&task_id).await?;
//! assert!(task.is_some());
//! engine.stop().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::context::{TaskContextManager, TaskExecutionContext};
use crate::domain::{Payload, Task, TaskRequest};
use crate::error::{HandlerError, TaskError};
use crate::executor::{ExecutorManager, TaskHandler};
use crate::lifecycle::{LifecycleManager, TransitionOutcome};
use crate::monitor::{MetricsSnapshot, TaskMonitor};
use crate::retry::RetryManager;
use crate::store::memory::InMemoryTaskStore;
use crate::store::{ListOptions, TaskPage, TaskStatistics, TaskStore, TimeRange};
use crate::timeout::{TimeoutConfig, TimeoutManager};
use crate::types::task::{TaskStatus, TaskType};

/// Statuses purged by the retention sweep.
const PURGEABLE: [TaskStatus; 2] = [TaskStatus::Completed, TaskStatus::Cancelled];

/// How often [`TaskEngine::wait_for`] polls the store.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Builder for [`TaskEngine`].
///
/// Every piece is optional: the default engine uses an in-memory store, the
/// built-in per-type retry presets, and a timeout policy whose default
/// deadline comes from [`EngineConfig::default_timeout_secs`].
#[allow(missing_debug_implementations)]
pub struct TaskEngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn TaskStore>>,
    retry: Option<RetryManager>,
    timeouts: Option<TimeoutConfig>,
    handlers: HashMap<TaskType, TaskHandler>,
}

impl Default for TaskEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskEngineBuilder {
    /// A builder with default settings.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            store: None,
            retry: None,
            timeouts: None,
            handlers: HashMap::new(),
        }
    }

    /// Sets the runtime configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the storage backend.
    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the retry policies.
    pub fn retry_manager(mut self, retry: RetryManager) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Sets the timeout policy.
    pub fn timeout_config(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    /// Registers a handler up front.
    pub fn handler(mut self, task_type: impl Into<TaskType>, handler: TaskHandler) -> Self {
        self.handlers.insert(task_type.into(), handler);
        self
    }

    /// Creates the worker pools and wires the managers together.
    ///
    /// # Errors
    ///
    /// - [`TaskError::Executor`] if a worker thread cannot be spawned.
    pub fn build(self) -> Result<TaskEngine, TaskError> {
        let executor = ExecutorManager::new(&self.config.executor_config())?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::default()));
        let timeouts = self.timeouts.unwrap_or_else(|| {
            TimeoutConfig::default().with_default_timeout(self.config.default_timeout())
        });

        tracing::debug!(
            handlers = self.handlers.len(),
            auto_retry = self.config.auto_retry,
            "task engine built"
        );

        Ok(TaskEngine {
            inner: Arc::new(EngineInner {
                lifecycle: LifecycleManager::new(Arc::clone(&store)),
                store,
                retry: self.retry.unwrap_or_else(RetryManager::with_builtin_defaults),
                timeouts: TimeoutManager::new(timeouts),
                executor,
                contexts: TaskContextManager::new(),
                monitor: TaskMonitor::new(),
                handlers: RwLock::new(self.handlers),
                drivers: dashmap::DashMap::new(),
                shutdown: CancellationToken::new(),
                loops: Mutex::new(None),
                stopped: AtomicBool::new(false),
                next_seq: AtomicU64::new(0),
                config: self.config,
            }),
        })
    }
}

#[derive(Debug, Clone)]
struct DriverHandle {
    seq: u64,
    cancel: CancellationToken,
    done: CancellationToken,
}

/// Running background loops and the token that stops them.
struct Loops {
    stop: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

struct EngineInner {
    config: EngineConfig,
    store: Arc<dyn TaskStore>,
    lifecycle: LifecycleManager,
    retry: RetryManager,
    timeouts: TimeoutManager,
    executor: ExecutorManager,
    contexts: TaskContextManager,
    monitor: TaskMonitor,
    handlers: RwLock<HashMap<TaskType, TaskHandler>>,
    drivers: dashmap::DashMap<String, DriverHandle>,
    // Parent of every driver token.
    shutdown: CancellationToken,
    loops: Mutex<Option<Loops>>,
    stopped: AtomicBool,
    next_seq: AtomicU64,
}

/// Unregisters a driver and signals `done` however the driver exits.
struct DriverGuard {
    inner: Arc<EngineInner>,
    task_id: String,
    seq: u64,
    done: CancellationToken,
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        self.inner
            .drivers
            .remove_if(&self.task_id, |_, d| d.seq == self.seq);
        self.done.cancel();
    }
}

/// Asynchronous task orchestrator.
///
/// Cloning is cheap; clones share the same engine.
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for TaskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEngine")
            .field("config", &self.inner.config)
            .field("drivers", &self.inner.drivers.len())
            .field("stopped", &self.inner.stopped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl TaskEngine {
    /// Starts a [`TaskEngineBuilder`].
    pub fn builder() -> TaskEngineBuilder {
        TaskEngineBuilder::new()
    }

    /// Registers (or replaces) the handler for `task_type`.
    pub fn register_handler(&self, task_type: impl Into<TaskType>, handler: TaskHandler) {
        let task_type = task_type.into();
        tracing::info!(task_type = %task_type, is_async = handler.is_async(), "handler registered");
        self.inner.handlers.write().insert(task_type, handler);
    }

    /// Returns `true` if a handler is registered for `task_type`.
    pub fn has_handler(&self, task_type: &TaskType) -> bool {
        self.inner.handlers.read().contains_key(task_type)
    }

    /// Persists a new `Pending` task and schedules it. Returns once the task
    /// is stored, without waiting for it to run.
    ///
    /// A request without `max_retries` takes the budget of its type's retry
    /// policy, or [`EngineConfig::default_max_retries`].
    ///
    /// # Errors
    ///
    /// - [`TaskError::Validation`] if no handler is registered for the type.
    /// - [`TaskError::AlreadyExists`] if the request carries a taken id.
    /// - [`TaskError::Executor`] after [`stop`](Self::stop).
    pub async fn submit(&self, mut request: TaskRequest) -> Result<String, TaskError> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(TaskError::Executor("engine is stopped".into()));
        }
        if !self.has_handler(&request.task_type) {
            return Err(TaskError::validation(format!(
                "no handler registered for task type '{}'",
                request.task_type
            )));
        }
        if request.max_retries.is_none() {
            request.max_retries = Some(
                self.inner
                    .retry
                    .type_config(&request.task_type)
                    .map_or(self.inner.config.default_max_retries, |c| c.max_retries),
            );
        }

        let task = self
            .inner
            .store
            .create(Task::from_request(request))
            .await?;
        self.inner.lifecycle.record_created(&task).await;
        self.inner.monitor.record_submitted(&task.task_type);

        tracing::info!(
            task_id = %task.task_id,
            task_type = %task.task_type,
            priority = %task.priority,
            "task submitted"
        );

        self.spawn_driver(task.task_id.clone());
        Ok(task.task_id)
    }

    /// The stored task, or `None` for an unknown id.
    pub async fn get_status(&self, task_id: &str) -> Result<Option<Task>, TaskError> {
        self.inner.store.get(task_id).await
    }

    /// Lists tasks.
    pub async fn list(&self, options: ListOptions) -> Result<TaskPage, TaskError> {
        self.inner.store.list(options).await
    }

    /// Aggregate statistics from the store.
    pub async fn get_statistics(
        &self,
        range: Option<TimeRange>,
    ) -> Result<TaskStatistics, TaskError> {
        self.inner.store.get_statistics(range).await
    }

    /// Execution metrics observed by this engine.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.monitor.metrics()
    }

    /// A copy of the live execution context of a running task.
    pub fn context(&self, task_id: &str) -> Option<TaskExecutionContext> {
        self.inner.contexts.snapshot(task_id)
    }

    /// Cancels a task.
    ///
    /// A `Pending` task moves straight to `Cancelled`. For a `Running` or
    /// `Retrying` task the driver is signalled and given
    /// [`EngineConfig::cancel_ack_timeout_ms`] to record the cancellation
    /// itself; after that the status is forced.
    ///
    /// Returns `false` for unknown ids and for tasks that already finished.
    pub async fn cancel(&self, task_id: &str) -> Result<bool, TaskError> {
        let Some(task) = self.inner.store.get(task_id).await? else {
            return Ok(false);
        };

        match task.status {
            TaskStatus::Pending => {
                match self
                    .inner
                    .lifecycle
                    .transition_task_status(&task, TaskStatus::Cancelled, cancelled_outcome(&task))
                    .await
                {
                    Ok(cancelled) => {
                        self.signal_driver(task_id);
                        self.record_finished(&cancelled, false);
                        return Ok(true);
                    },
                    // The driver started it in between.
                    Err(TaskError::ConcurrentModification { .. }) => {},
                    Err(e) => return Err(e),
                }
            },
            TaskStatus::Running | TaskStatus::Retrying => {},
            status => {
                tracing::debug!(task_id = %task_id, status = %status, "nothing to cancel");
                return Ok(false);
            },
        }

        self.cancel_active(task_id).await
    }

    async fn cancel_active(&self, task_id: &str) -> Result<bool, TaskError> {
        let driver = self.inner.drivers.get(task_id).map(|d| d.value().clone());
        if let Some(driver) = driver {
            driver.cancel.cancel();
            let ack = self.inner.config.cancel_ack_timeout();
            if tokio::time::timeout(ack, driver.done.cancelled())
                .await
                .is_err()
            {
                tracing::warn!(
                    task_id = %task_id,
                    ack_ms = ack.as_millis() as u64,
                    "driver did not acknowledge cancellation, forcing status"
                );
            }
        }

        let Some(task) = self.inner.store.get(task_id).await? else {
            return Ok(false);
        };
        if task.status == TaskStatus::Cancelled {
            return Ok(true);
        }
        if !LifecycleManager::can_transition(task.status, TaskStatus::Cancelled) {
            // Finished on its own before the signal landed.
            return Ok(false);
        }

        match self
            .inner
            .lifecycle
            .transition_task_status(&task, TaskStatus::Cancelled, cancelled_outcome(&task))
            .await
        {
            Ok(cancelled) => {
                self.record_finished(&cancelled, task.status == TaskStatus::Running);
                Ok(true)
            },
            Err(TaskError::ConcurrentModification { .. }) => Ok(self
                .inner
                .store
                .get(task_id)
                .await?
                .is_some_and(|t| t.status == TaskStatus::Cancelled)),
            Err(e) => Err(e),
        }
    }

    /// Schedules another attempt of a `Failed` or `Timeout` task.
    ///
    /// The task moves to `Retrying` with its retry counter bumped and its
    /// outcome cleared; a new driver waits out the backoff and runs it.
    /// Returns `false` without touching the task if the retry policy or the
    /// task's budget rules it out.
    pub async fn retry(&self, task_id: &str) -> Result<bool, TaskError> {
        let Some(task) = self.inner.store.get(task_id).await? else {
            return Ok(false);
        };
        if !self.inner.retry.should_retry(&task, None) {
            tracing::warn!(
                task_id = %task_id,
                status = %task.status,
                retry_count = task.retry_count,
                max_retries = task.max_retries,
                "task cannot be retried"
            );
            return Ok(false);
        }

        let retrying = match self.inner.store.update_retry(task_id, task.status).await {
            Ok(t) => t,
            Err(TaskError::ConcurrentModification { .. } | TaskError::Validation { .. }) => {
                return Ok(false)
            },
            Err(e) => return Err(e),
        };
        self.inner
            .lifecycle
            .record_transition(&retrying, task.status)
            .await;
        self.inner.monitor.record_retried(&retrying.task_type);

        tracing::info!(
            task_id = %task_id,
            retry_count = retrying.retry_count,
            max_retries = retrying.max_retries,
            "retry scheduled"
        );
        self.spawn_driver(task_id.to_string());
        Ok(true)
    }

    /// Polls until `task_id` has stopped executing and no driver owns it, or
    /// `timeout` elapses. Returns `None` for unknown ids.
    ///
    /// # Errors
    ///
    /// - [`TaskError::Timeout`] if the task is still in flight at the deadline.
    pub async fn wait_for(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<Option<Task>, TaskError> {
        tokio::time::timeout(timeout, self.poll_settled(task_id))
            .await
            .map_err(|_| TaskError::Timeout {
                task_id: task_id.to_string(),
                timeout,
            })?
    }

    async fn poll_settled(&self, task_id: &str) -> Result<Option<Task>, TaskError> {
        loop {
            match self.inner.store.get(task_id).await? {
                Some(t) if !t.status.is_finished() || self.inner.drivers.contains_key(task_id) => {
                    tokio::time::sleep(WAIT_POLL_INTERVAL).await;
                },
                other => return Ok(other),
            }
        }
    }

    /// Deletes completed and cancelled tasks older than the retention window.
    /// Returns the number deleted.
    pub async fn cleanup_old_tasks(&self) -> Result<usize, TaskError> {
        let Some(cutoff) = Utc::now().checked_sub_signed(self.inner.config.retention()) else {
            return Ok(0);
        };
        let deleted = self.inner.store.delete_old(cutoff, &PURGEABLE).await?;
        if deleted > 0 {
            tracing::info!(deleted, cutoff = %cutoff, "purged old tasks");
        }
        for task_id in self.inner.retry.tracked_tasks() {
            if self.inner.store.get(&task_id).await?.is_none() {
                self.inner.retry.clear_history(&task_id);
            }
        }
        Ok(deleted)
    }

    /// Forces `Timeout` on running tasks past their deadline and signals
    /// their drivers. Returns the number of tasks timed out.
    pub async fn sweep_timeouts(&self) -> Result<usize, TaskError> {
        let now = Utc::now();
        let mut swept = 0;
        for task in self.inner.store.get_timeout_candidates(now).await? {
            let timeout = self.inner.timeouts.get_timeout_for_task(&task);
            let deadline = task.started_at.and_then(|started| {
                chrono::Duration::from_std(timeout)
                    .ok()
                    .and_then(|t| started.checked_add_signed(t))
            });
            if deadline.is_none_or(|d| now < d) {
                continue;
            }

            let outcome = TransitionOutcome::error(timeout_info(&task, timeout));
            match self
                .inner
                .lifecycle
                .transition_task_status(&task, TaskStatus::Timeout, outcome)
                .await
            {
                Ok(timed_out) => {
                    self.signal_driver(&task.task_id);
                    self.record_finished(&timed_out, true);
                    tracing::warn!(
                        task_id = %task.task_id,
                        timeout_ms = timeout.as_millis() as u64,
                        "sweep timed out a straggling task"
                    );
                    swept += 1;
                },
                Err(TaskError::ConcurrentModification { .. } | TaskError::InvalidTransition { .. }) => {},
                Err(e) => return Err(e),
            }
        }
        Ok(swept)
    }

    /// Launches the cleanup and timeout loops. Does nothing if they are
    /// already running or disabled in the config.
    pub fn start(&self) {
        if !self.inner.config.enable_background_tasks {
            tracing::debug!("background tasks disabled");
            return;
        }
        let mut loops = self.inner.loops.lock();
        if loops.is_some() {
            tracing::warn!("task engine already started");
            return;
        }

        let stop = self.inner.shutdown.child_token();
        let weak = Arc::downgrade(&self.inner);
        let handles = vec![
            spawn_loop(
                "cleanup",
                self.inner.config.cleanup_interval(),
                stop.clone(),
                weak.clone(),
                |engine| async move { engine.cleanup_old_tasks().await }.boxed(),
            ),
            spawn_loop(
                "timeout_sweep",
                self.inner.config.timeout_sweep_interval(),
                stop.clone(),
                weak,
                |engine| async move { engine.sweep_timeouts().await }.boxed(),
            ),
        ];
        *loops = Some(Loops { stop, handles });
        tracing::info!("task engine started");
    }

    /// Stops the loops, cancels every driver, waits briefly for them to
    /// record their cancellation, and shuts the worker pools down.
    ///
    /// The engine rejects new submissions afterwards.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        let loops = self.inner.loops.lock().take();
        if let Some(loops) = loops {
            loops.stop.cancel();
            for handle in loops.handles {
                if let Err(e) = handle.await {
                    tracing::warn!(error = %e, "background loop ended abnormally");
                }
            }
        }

        self.inner.shutdown.cancel();
        let pending: Vec<CancellationToken> = self
            .inner
            .drivers
            .iter()
            .map(|d| d.done.clone())
            .collect();
        let drained = join_all(pending.iter().map(|done| done.cancelled()));
        if tokio::time::timeout(self.inner.config.cancel_ack_timeout(), drained)
            .await
            .is_err()
        {
            tracing::warn!(
                drivers = self.inner.drivers.len(),
                "some drivers did not stop in time"
            );
        }

        self.inner.executor.shutdown();
        tracing::info!("task engine stopped");
    }

    /// Number of tasks currently owned by a driver.
    pub fn active_drivers(&self) -> usize {
        self.inner.drivers.len()
    }

    /// The runtime configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The storage backend.
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.inner.store
    }

    /// The lifecycle manager, for subscribing to events.
    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.inner.lifecycle
    }

    /// The retry policies.
    pub fn retry_manager(&self) -> &RetryManager {
        &self.inner.retry
    }

    /// The timeout manager.
    pub fn timeouts(&self) -> &TimeoutManager {
        &self.inner.timeouts
    }

    /// The worker pools.
    pub fn executor(&self) -> &ExecutorManager {
        &self.inner.executor
    }

    /// The live context registry.
    pub fn contexts(&self) -> &TaskContextManager {
        &self.inner.contexts
    }

    /// The metrics aggregator.
    pub fn monitor(&self) -> &TaskMonitor {
        &self.inner.monitor
    }

    fn signal_driver(&self, task_id: &str) {
        if let Some(driver) = self.inner.drivers.get(task_id) {
            driver.cancel.cancel();
        }
    }

    /// Bookkeeping for a task that just reached a finished status. Retry
    /// history is dropped once the task can no longer be retried.
    fn record_finished(&self, task: &Task, was_running: bool) {
        self.inner.monitor.record_finished(task, was_running);
        if task.status.is_terminal() {
            self.inner.retry.clear_history(&task.task_id);
        }
    }

    fn handler_for(&self, task_type: &TaskType) -> Option<TaskHandler> {
        self.inner.handlers.read().get(task_type).cloned()
    }

    fn spawn_driver(&self, task_id: String) {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.shutdown.child_token();
        let done = CancellationToken::new();
        self.inner.drivers.insert(
            task_id.clone(),
            DriverHandle {
                seq,
                cancel: cancel.clone(),
                done: done.clone(),
            },
        );

        let engine = self.clone();
        let driver: BoxFuture<'static, ()> = async move {
            let _guard = DriverGuard {
                inner: Arc::clone(&engine.inner),
                task_id: task_id.clone(),
                seq,
                done,
            };
            if let Err(e) = engine.drive(&task_id, &cancel).await {
                tracing::error!(task_id = %task_id, error = %e, "task driver failed");
            }
        }
        .boxed();
        tokio::spawn(driver);
    }

    /// Runs one attempt of `task_id`, from `Pending` or `Retrying` to a
    /// finished status.
    async fn drive(&self, task_id: &str, cancel: &CancellationToken) -> Result<(), TaskError> {
        let Some(mut task) = self.inner.store.get(task_id).await? else {
            return Ok(());
        };

        match task.status {
            TaskStatus::Pending => {},
            TaskStatus::Retrying => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return self.cancel_unstarted(&task).await,
                    _ = self.inner.retry.wait_for_retry(&task) => {},
                }
                task = match self.inner.store.get(task_id).await? {
                    Some(t) if t.status == TaskStatus::Retrying => t,
                    _ => return Ok(()),
                };
            },
            status => {
                tracing::debug!(task_id = %task_id, status = %status, "driver skipped");
                return Ok(());
            },
        }
        if cancel.is_cancelled() {
            return self.cancel_unstarted(&task).await;
        }

        let handler = self.handler_for(&task.task_type);
        let guard = self.inner.contexts.install(task_id, &task.task_type);
        let running = match self
            .inner
            .lifecycle
            .transition_task_status(&task, TaskStatus::Running, TransitionOutcome::default())
            .await
        {
            Ok(t) => t,
            Err(TaskError::ConcurrentModification { .. } | TaskError::InvalidTransition { .. }) => {
                tracing::debug!(task_id = %task_id, "task changed before it could start");
                return Ok(());
            },
            Err(e) => return Err(e),
        };
        self.inner.monitor.record_started(&running);

        let outcome = match handler {
            Some(handler) => {
                let mode = ExecutorManager::resolve_mode(
                    &running.task_type,
                    running.execution_mode,
                    &handler,
                );
                let timeout = self.inner.timeouts.get_timeout_for_task(&running);
                tracing::debug!(
                    task_id = %task_id,
                    mode = %mode,
                    timeout_ms = timeout.as_millis() as u64,
                    "executing task"
                );
                self.inner
                    .timeouts
                    .execute_with_timeout(
                        task_id,
                        timeout,
                        cancel.clone(),
                        self.inner.executor.submit(
                            mode,
                            &handler,
                            running.input_data.clone(),
                            guard.handle().clone(),
                        ),
                    )
                    .await
                    .and_then(|result| result)
            },
            None => Err(TaskError::Handler(HandlerError::fatal(
                "no_handler",
                format!("no handler registered for task type '{}'", running.task_type),
            ))),
        };

        let (status, transition, handler_error) = match outcome {
            Ok(result) => (TaskStatus::Completed, TransitionOutcome::result(result), None),
            Err(TaskError::Timeout { timeout, .. }) => (
                TaskStatus::Timeout,
                TransitionOutcome::error(timeout_info(&running, timeout)),
                None,
            ),
            Err(TaskError::Cancelled { .. }) => {
                (TaskStatus::Cancelled, cancelled_outcome(&running), None)
            },
            Err(TaskError::Handler(e)) => (
                TaskStatus::Failed,
                TransitionOutcome::error(e.to_error_info(running.retry_count)),
                Some(e),
            ),
            Err(other) => {
                let e = HandlerError::fatal(other.kind(), other.to_string());
                (
                    TaskStatus::Failed,
                    TransitionOutcome::error(e.to_error_info(running.retry_count)),
                    Some(e),
                )
            },
        };

        // The context must be gone before anyone can observe the final status.
        drop(guard);

        let finished = match self
            .inner
            .lifecycle
            .transition_task_status(&running, status, transition)
            .await
        {
            Ok(t) => t,
            Err(TaskError::ConcurrentModification { .. }) => {
                tracing::debug!(
                    task_id = %task_id,
                    outcome = %status,
                    "status was settled elsewhere, dropping outcome"
                );
                return Ok(());
            },
            Err(e) => return Err(e),
        };
        self.record_finished(&finished, true);

        if self.inner.config.auto_retry
            && finished.status.is_failure()
            && self
                .inner
                .retry
                .should_retry(&finished, handler_error.as_ref())
        {
            self.retry(task_id).await?;
        }
        Ok(())
    }

    async fn cancel_unstarted(&self, task: &Task) -> Result<(), TaskError> {
        match self
            .inner
            .lifecycle
            .transition_task_status(task, TaskStatus::Cancelled, cancelled_outcome(task))
            .await
        {
            Ok(cancelled) => {
                self.record_finished(&cancelled, false);
                Ok(())
            },
            Err(TaskError::ConcurrentModification { .. } | TaskError::InvalidTransition { .. }) => {
                Ok(())
            },
            Err(e) => Err(e),
        }
    }
}

fn cancelled_outcome(task: &Task) -> TransitionOutcome {
    TransitionOutcome::error(
        HandlerError::fatal("cancelled", "task was cancelled").to_error_info(task.retry_count),
    )
}

fn timeout_info(task: &Task, timeout: Duration) -> Payload {
    let mut info = HandlerError::retryable(
        "timeout",
        format!("task timed out after {}s", timeout.as_secs_f64()),
    )
    .to_error_info(task.retry_count);
    info.insert("timeout_seconds".into(), json!(timeout.as_secs_f64()));
    info.insert("timeout_at".into(), json!(Utc::now().to_rfc3339()));
    info
}

fn spawn_loop<F>(
    name: &'static str,
    period: Duration,
    stop: CancellationToken,
    engine: Weak<EngineInner>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(TaskEngine) -> BoxFuture<'static, Result<usize, TaskError>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = interval.tick() => {},
            }
            let Some(inner) = engine.upgrade() else {
                break;
            };
            match tick(TaskEngine { inner }).await {
                Ok(n) => tracing::debug!(task = name, affected = n, "background sweep finished"),
                Err(e) => tracing::warn!(task = name, error = %e, "background sweep failed, skipping cycle"),
            }
        }
        tracing::debug!(task = name, "background loop stopped");
    })
}
