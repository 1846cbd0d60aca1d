//! Deadline enforcement and running-task introspection.
//!
//! [`TimeoutManager::execute_with_timeout`] races an operation against a
//! hard deadline and a cancellation token. When soft timeouts are enabled, a
//! watcher fires the registered soft-timeout callbacks at
//! `timeout * soft_timeout_ratio` as an early warning. The watcher is aborted
//! as soon as the operation finishes.
//!
//! While an operation is in flight its timing is visible through
//! [`running_info`](TimeoutManager::running_info) and
//! [`statistics`](TimeoutManager::statistics).

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::constants::{
    DEFAULT_SHUTDOWN_GRACE_SECS, DEFAULT_SOFT_TIMEOUT_RATIO, DEFAULT_TIMEOUT_SECS,
};
use crate::domain::Task;
use crate::error::TaskError;
use crate::types::task::TaskType;

/// Invoked with the task id and its configured timeout.
pub type TimeoutCallback = Arc<dyn Fn(&str, Duration) + Send + Sync>;

/// Timeout policy.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Applies when neither the task nor its type sets a timeout.
    pub default_timeout: Duration,
    /// Per-type overrides.
    pub type_timeouts: HashMap<TaskType, Duration>,
    /// Fire soft-timeout callbacks before the hard deadline.
    pub enable_soft_timeout: bool,
    /// Fraction of the timeout at which the soft warning fires, in `(0, 1]`.
    pub soft_timeout_ratio: f64,
    /// Allow [`TimeoutManager::graceful_shutdown_task`] to wait for a stop.
    pub enable_graceful_shutdown: bool,
    /// How long a graceful stop may take.
    pub shutdown_grace_period: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            type_timeouts: HashMap::new(),
            enable_soft_timeout: true,
            soft_timeout_ratio: DEFAULT_SOFT_TIMEOUT_RATIO,
            enable_graceful_shutdown: true,
            shutdown_grace_period: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}

impl TimeoutConfig {
    fn preset(default_secs: u64, [doc, gen, exec, report]: [u64; 4]) -> Self {
        let type_timeouts = [
            (TaskType::DocumentAnalysis, doc),
            (TaskType::TestGeneration, gen),
            (TaskType::TestExecution, exec),
            (TaskType::ReportGeneration, report),
        ]
        .into_iter()
        .map(|(t, secs)| (t, Duration::from_secs(secs)))
        .collect();
        Self {
            default_timeout: Duration::from_secs(default_secs),
            type_timeouts,
            ..Self::default()
        }
    }

    /// Short deadlines for interactive work.
    pub fn fast() -> Self {
        Self::preset(60, [30, 60, 120, 45])
    }

    /// The usual deadlines.
    pub fn standard() -> Self {
        Self::preset(300, [180, 300, 600, 240])
    }

    /// Long deadlines for batch work.
    pub fn long_running() -> Self {
        Self::preset(1800, [900, 1800, 3600, 1200])
    }

    /// Replaces the default timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Overrides the timeout of one task type.
    pub fn with_type_timeout(mut self, task_type: TaskType, timeout: Duration) -> Self {
        self.type_timeouts.insert(task_type, timeout);
        self
    }

    /// Enables the soft warning at `ratio` of the timeout.
    pub fn with_soft_timeout(mut self, ratio: f64) -> Self {
        self.enable_soft_timeout = true;
        self.soft_timeout_ratio = ratio;
        self
    }

    /// Disables the soft warning.
    pub fn without_soft_timeout(mut self) -> Self {
        self.enable_soft_timeout = false;
        self
    }

    /// Replaces the graceful-stop window.
    pub fn with_shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period = grace;
        self
    }

    fn soft_deadline(&self, timeout: Duration) -> Option<Duration> {
        if !self.enable_soft_timeout {
            return None;
        }
        let ratio = self.soft_timeout_ratio;
        (ratio > 0.0 && ratio <= 1.0).then(|| timeout.mul_f64(ratio))
    }
}

/// Timing of one in-flight operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunningTaskInfo {
    /// The task.
    pub task_id: String,
    /// Configured hard deadline.
    pub timeout: Duration,
    /// Time since the operation started.
    pub elapsed: Duration,
    /// Time left before the deadline.
    pub remaining: Duration,
    /// `elapsed / timeout * 100`, capped at 100.
    pub progress_percent: f64,
}

/// Aggregate timing across in-flight operations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeoutStatistics {
    /// Operations in flight.
    pub running: usize,
    /// In-flight operations past 90% of their deadline.
    pub near_timeout: usize,
    /// Mean of `progress_percent`, or 0.
    pub average_progress: f64,
    /// Hard timeouts since the manager was created.
    pub timeouts_total: u64,
    /// Soft warnings since the manager was created.
    pub soft_timeouts_total: u64,
}

#[derive(Debug)]
struct RunningEntry {
    seq: u64,
    started: Instant,
    timeout: Duration,
    stop: CancellationToken,
    finished: CancellationToken,
}

impl RunningEntry {
    fn info(&self, task_id: &str) -> RunningTaskInfo {
        let elapsed = self.started.elapsed();
        let progress_percent = if self.timeout.is_zero() {
            100.0
        } else {
            (elapsed.as_secs_f64() / self.timeout.as_secs_f64() * 100.0).min(100.0)
        };
        RunningTaskInfo {
            task_id: task_id.to_string(),
            timeout: self.timeout,
            elapsed,
            remaining: self.timeout.saturating_sub(elapsed),
            progress_percent,
        }
    }
}

/// Deregisters an in-flight entry and stops its soft watcher.
struct RunningGuard<'a> {
    running: &'a DashMap<String, RunningEntry>,
    task_id: &'a str,
    seq: u64,
    finished: CancellationToken,
    watcher: Option<tokio::task::JoinHandle<()>>,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        self.running.remove_if(self.task_id, |_, e| e.seq == self.seq);
        self.finished.cancel();
    }
}

/// Resolves and enforces deadlines.
pub struct TimeoutManager {
    config: TimeoutConfig,
    running: DashMap<String, RunningEntry>,
    soft_callbacks: Arc<RwLock<Vec<TimeoutCallback>>>,
    timeout_callbacks: RwLock<Vec<TimeoutCallback>>,
    timeouts_total: AtomicU64,
    soft_timeouts_total: Arc<AtomicU64>,
    next_seq: AtomicU64,
}

impl std::fmt::Debug for TimeoutManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutManager")
            .field("config", &self.config)
            .field("running", &self.running.len())
            .finish_non_exhaustive()
    }
}

impl Default for TimeoutManager {
    fn default() -> Self {
        Self::new(TimeoutConfig::default())
    }
}

impl TimeoutManager {
    /// A manager enforcing `config`.
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            config,
            running: DashMap::new(),
            soft_callbacks: Arc::new(RwLock::new(Vec::new())),
            timeout_callbacks: RwLock::new(Vec::new()),
            timeouts_total: AtomicU64::new(0),
            soft_timeouts_total: Arc::new(AtomicU64::new(0)),
            next_seq: AtomicU64::new(0),
        }
    }

    /// The policy in force.
    pub fn config(&self) -> &TimeoutConfig {
        &self.config
    }

    /// Registers a soft-timeout callback.
    pub fn on_soft_timeout<F>(&self, callback: F)
    where
        F: Fn(&str, Duration) + Send + Sync + 'static,
    {
        self.soft_callbacks.write().push(Arc::new(callback));
    }

    /// Registers a hard-timeout callback.
    pub fn on_timeout<F>(&self, callback: F)
    where
        F: Fn(&str, Duration) + Send + Sync + 'static,
    {
        self.timeout_callbacks.write().push(Arc::new(callback));
    }

    /// Task override, then type override, then the default.
    pub fn get_timeout_for_task(&self, task: &Task) -> Duration {
        task.timeout_override()
            .or_else(|| self.config.type_timeouts.get(&task.task_type).copied())
            .unwrap_or(self.config.default_timeout)
    }

    /// Runs `operation` until it finishes, `timeout` elapses, or `cancel`
    /// fires.
    ///
    /// # Errors
    ///
    /// - [`TaskError::Timeout`] when the deadline passes first. Timeout
    ///   callbacks have run by the time this returns.
    /// - [`TaskError::Cancelled`] when `cancel` fires first, including via
    ///   [`graceful_shutdown_task`](Self::graceful_shutdown_task).
    pub async fn execute_with_timeout<F, T>(
        &self,
        task_id: &str,
        timeout: Duration,
        cancel: CancellationToken,
        operation: F,
    ) -> Result<T, TaskError>
    where
        F: Future<Output = T>,
    {
        let finished = CancellationToken::new();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.running.insert(
            task_id.to_string(),
            RunningEntry {
                seq,
                started: Instant::now(),
                timeout,
                stop: cancel.clone(),
                finished: finished.clone(),
            },
        );

        let watcher = self.config.soft_deadline(timeout).map(|soft| {
            let callbacks = Arc::clone(&self.soft_callbacks);
            let counter = Arc::clone(&self.soft_timeouts_total);
            let id = task_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(soft).await;
                counter.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    task_id = %id,
                    soft_timeout_ms = soft.as_millis() as u64,
                    timeout_ms = timeout.as_millis() as u64,
                    "task approaching timeout"
                );
                let callbacks = callbacks.read().clone();
                for callback in callbacks {
                    callback(&id, timeout);
                }
            })
        });

        let _guard = RunningGuard {
            running: &self.running,
            task_id,
            seq,
            finished,
            watcher,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TaskError::Cancelled {
                task_id: task_id.to_string(),
            }),
            outcome = tokio::time::timeout(timeout, operation) => match outcome {
                Ok(value) => Ok(value),
                Err(_) => {
                    self.timeouts_total.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        task_id = %task_id,
                        timeout_ms = timeout.as_millis() as u64,
                        "task timed out"
                    );
                    let callbacks = self.timeout_callbacks.read().clone();
                    for callback in callbacks {
                        callback(task_id, timeout);
                    }
                    Err(TaskError::Timeout {
                        task_id: task_id.to_string(),
                        timeout,
                    })
                },
            },
        }
    }

    /// Timing of an in-flight operation.
    pub fn running_info(&self, task_id: &str) -> Option<RunningTaskInfo> {
        self.running.get(task_id).map(|e| e.info(task_id))
    }

    /// Timing of every in-flight operation.
    pub fn running_tasks(&self) -> Vec<RunningTaskInfo> {
        self.running.iter().map(|e| e.info(e.key())).collect()
    }

    /// Returns `true` if `task_id` has used at least `threshold` (0 to 1) of
    /// its deadline.
    pub fn is_near_timeout(&self, task_id: &str, threshold: f64) -> bool {
        self.running_info(task_id)
            .is_some_and(|info| info.progress_percent >= threshold * 100.0)
    }

    /// Aggregate timing.
    pub fn statistics(&self) -> TimeoutStatistics {
        let infos = self.running_tasks();
        let running = infos.len();
        let near_timeout = infos.iter().filter(|i| i.progress_percent >= 90.0).count();
        let average_progress = if running == 0 {
            0.0
        } else {
            infos.iter().map(|i| i.progress_percent).sum::<f64>() / running as f64
        };
        TimeoutStatistics {
            running,
            near_timeout,
            average_progress,
            timeouts_total: self.timeouts_total.load(Ordering::Relaxed),
            soft_timeouts_total: self.soft_timeouts_total.load(Ordering::Relaxed),
        }
    }

    /// Requests a cooperative stop of `task_id` and waits up to the grace
    /// period for its operation to unwind.
    ///
    /// Returns `true` if the operation finished in time, `false` if it is
    /// unknown, graceful shutdown is disabled, or the grace period elapsed.
    pub async fn graceful_shutdown_task(&self, task_id: &str) -> bool {
        if !self.config.enable_graceful_shutdown {
            return false;
        }
        let Some((stop, finished)) = self
            .running
            .get(task_id)
            .map(|e| (e.stop.clone(), e.finished.clone()))
        else {
            return false;
        };

        stop.cancel();
        let stopped = tokio::time::timeout(self.config.shutdown_grace_period, finished.cancelled())
            .await
            .is_ok();
        if !stopped {
            tracing::warn!(
                task_id = %task_id,
                grace_ms = self.config.shutdown_grace_period.as_millis() as u64,
                "task did not stop within the grace period"
            );
        }
        stopped
    }
}
