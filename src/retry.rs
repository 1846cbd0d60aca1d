//! Retry policy and backoff.
//!
//! [`RetryManager`] owns one default [`RetryConfig`] plus per-type overrides
//! and is the single place a retry delay is computed. Configs are immutable
//! once the manager is built; only the per-task history is mutated at run
//! time.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::RngExt;
use serde::Serialize;

use crate::constants::MAX_RETRY_HISTORY;
use crate::domain::Task;
use crate::error::HandlerError;
use crate::types::task::{TaskStatus, TaskType};

/// A user-supplied delay function, called with the task's retry count.
pub type DelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// How the delay grows between attempts.
#[derive(Clone)]
pub enum RetryStrategy {
    /// Always `base_delay`.
    Fixed,
    /// `base_delay * 2^retry_count`.
    Exponential,
    /// `base_delay * (retry_count + 1)`.
    Linear,
    /// Caller-defined.
    Custom(DelayFn),
}

impl fmt::Debug for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed => f.write_str("Fixed"),
            Self::Exponential => f.write_str("Exponential"),
            Self::Linear => f.write_str("Linear"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// When a failed task is eligible for another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCondition {
    /// Any failure or timeout, regardless of error kind.
    Always,
    /// Task is `Failed` and the handler error (if any) is retryable.
    OnFailure,
    /// Task is `Timeout`.
    OnTimeout,
    /// Task is `Failed` and the error kind is in `retryable_errors`.
    OnSpecificError,
    /// Never retry.
    Never,
}

/// Retry policy for one task type.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Default budget for tasks that don't carry their own.
    pub max_retries: u32,
    /// Delay growth.
    pub strategy: RetryStrategy,
    /// Delay unit.
    pub base_delay: Duration,
    /// Upper bound for every computed delay, jitter included.
    pub max_delay: Duration,
    /// Adds a random 10-30% surcharge.
    pub jitter: bool,
    /// Eligibility rule.
    pub condition: RetryCondition,
    /// Error kinds accepted by [`RetryCondition::OnSpecificError`].
    pub retryable_errors: HashSet<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            strategy: RetryStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter: true,
            condition: RetryCondition::OnFailure,
            retryable_errors: HashSet::new(),
        }
    }
}

impl RetryConfig {
    fn preset(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// 5 attempts, 0.5s base, 30s cap.
    pub fn fast() -> Self {
        Self::preset(5, Duration::from_millis(500), Duration::from_secs(30))
    }

    /// 3 attempts, 1s base, 60s cap.
    pub fn standard() -> Self {
        Self::preset(3, Duration::from_secs(1), Duration::from_secs(60))
    }

    /// 2 attempts, 5s base, 300s cap.
    pub fn slow() -> Self {
        Self::preset(2, Duration::from_secs(5), Duration::from_secs(300))
    }

    /// 5 attempts on connection, timeout, or io errors only.
    pub fn network() -> Self {
        Self {
            condition: RetryCondition::OnSpecificError,
            retryable_errors: ["connection", "timeout", "io"]
                .into_iter()
                .map(String::from)
                .collect(),
            ..Self::preset(5, Duration::from_secs(2), Duration::from_secs(120))
        }
    }

    /// Never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            condition: RetryCondition::Never,
            ..Self::default()
        }
    }

    /// Replaces the strategy.
    pub fn with_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Replaces the base delay.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Replaces the delay cap.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replaces the eligibility rule.
    pub fn with_condition(mut self, condition: RetryCondition) -> Self {
        self.condition = condition;
        self
    }

    /// Replaces the budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Adds an error kind to the retryable set.
    pub fn with_retryable_error(mut self, kind: impl Into<String>) -> Self {
        self.retryable_errors.insert(kind.into());
        self
    }

    /// Delay before jitter, already clamped to `max_delay`.
    pub fn base_delay_for(&self, retry_count: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let raw = match &self.strategy {
            RetryStrategy::Fixed => base,
            RetryStrategy::Exponential => base * 2f64.powi(retry_count.min(63) as i32),
            RetryStrategy::Linear => base * (f64::from(retry_count) + 1.0),
            RetryStrategy::Custom(f) => f(retry_count).as_secs_f64(),
        };
        let capped = raw.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// Delay for `retry_count`, with jitter when enabled. Never exceeds
    /// `max_delay` and never falls below the unjittered delay.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let delay = self.base_delay_for(retry_count);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let surcharge = rand::rng().random_range(0.1..=0.3);
        delay.mul_f64(1.0 + surcharge).min(self.max_delay.max(delay))
    }
}

/// One recorded retry wait.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryRecord {
    /// Retry count at the time of the wait.
    pub retry_count: u32,
    /// How long the caller waited.
    pub delay: Duration,
    /// When the wait started.
    pub timestamp: DateTime<Utc>,
}

/// Aggregate retry activity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryStatistics {
    /// Tasks with at least one recorded retry.
    pub tasks_with_retries: usize,
    /// Recorded retry waits across all tasks (capped per task).
    pub total_attempts: usize,
    /// `total_attempts / tasks_with_retries`, or 0.
    pub average_attempts: f64,
}

/// Resolves retry policy per task type and computes delays.
#[derive(Debug)]
pub struct RetryManager {
    default_config: RetryConfig,
    type_configs: HashMap<TaskType, RetryConfig>,
    history: DashMap<String, VecDeque<RetryRecord>>,
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryManager {
    /// A manager applying `default_config` to every type.
    pub fn new(default_config: RetryConfig) -> Self {
        Self {
            default_config,
            type_configs: HashMap::new(),
            history: DashMap::new(),
        }
    }

    /// A manager with the built-in per-type presets.
    pub fn with_builtin_defaults() -> Self {
        Self::default()
            .with_type_config(TaskType::DocumentAnalysis, RetryConfig::standard())
            .with_type_config(TaskType::TestGeneration, RetryConfig::standard())
            .with_type_config(TaskType::TestExecution, RetryConfig::network())
            .with_type_config(TaskType::ReportGeneration, RetryConfig::slow())
    }

    /// Overrides the policy for one task type.
    pub fn with_type_config(mut self, task_type: TaskType, config: RetryConfig) -> Self {
        self.type_configs.insert(task_type, config);
        self
    }

    /// The override for `task_type`, if one was set.
    pub fn type_config(&self, task_type: &TaskType) -> Option<&RetryConfig> {
        self.type_configs.get(task_type)
    }

    /// The policy applying to `task_type`.
    pub fn config_for(&self, task_type: &TaskType) -> &RetryConfig {
        self.type_configs
            .get(task_type)
            .unwrap_or(&self.default_config)
    }

    /// Decides whether `task` may be retried.
    ///
    /// The task's own `max_retries` is the budget; the policy's condition
    /// decides eligibility. `error` is the handler outcome when known; when
    /// absent it is recovered from the task's `error_info`.
    pub fn should_retry(&self, task: &Task, error: Option<&HandlerError>) -> bool {
        if task.retry_count >= task.max_retries {
            return false;
        }
        if !task.status.is_failure() {
            return false;
        }

        let stored;
        let error = match error {
            Some(e) => Some(e),
            None => {
                stored = task.error_info.as_ref().map(HandlerError::from_error_info);
                stored.as_ref()
            },
        };

        let config = self.config_for(&task.task_type);
        let eligible = match config.condition {
            RetryCondition::Never => false,
            RetryCondition::Always => true,
            RetryCondition::OnTimeout => task.status == TaskStatus::Timeout,
            RetryCondition::OnFailure => {
                task.status == TaskStatus::Failed && error.is_none_or(HandlerError::is_retryable)
            },
            RetryCondition::OnSpecificError => match task.status {
                TaskStatus::Timeout => config.retryable_errors.contains("timeout"),
                _ => error.is_some_and(|e| config.retryable_errors.contains(e.kind())),
            },
        };

        tracing::debug!(
            task_id = %task.task_id,
            retry_count = task.retry_count,
            max_retries = task.max_retries,
            condition = ?config.condition,
            eligible,
            "retry decision"
        );
        eligible
    }

    /// Delay before the next attempt of `task`.
    pub fn calculate_delay(&self, task: &Task) -> Duration {
        self.config_for(&task.task_type).delay_for(task.retry_count)
    }

    /// Records the wait in the task's history and sleeps for the computed
    /// delay. Returns the delay.
    pub async fn wait_for_retry(&self, task: &Task) -> Duration {
        let delay = self.calculate_delay(task);
        {
            let mut history = self.history.entry(task.task_id.clone()).or_default();
            if history.len() >= MAX_RETRY_HISTORY {
                history.pop_front();
            }
            history.push_back(RetryRecord {
                retry_count: task.retry_count,
                delay,
                timestamp: Utc::now(),
            });
        }
        tracing::info!(
            task_id = %task.task_id,
            retry_count = task.retry_count,
            delay_ms = delay.as_millis() as u64,
            "waiting before retry"
        );
        tokio::time::sleep(delay).await;
        delay
    }

    /// Recorded waits for `task_id`, oldest first.
    pub fn retry_history(&self, task_id: &str) -> Vec<RetryRecord> {
        self.history
            .get(task_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forgets the history of `task_id`.
    pub fn clear_history(&self, task_id: &str) {
        self.history.remove(task_id);
    }

    /// Ids of the tasks that currently have recorded history.
    pub fn tracked_tasks(&self) -> Vec<String> {
        self.history.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Aggregate retry activity.
    pub fn statistics(&self) -> RetryStatistics {
        let tasks_with_retries = self.history.len();
        let total_attempts: usize = self.history.iter().map(|h| h.len()).sum();
        let average_attempts = if tasks_with_retries == 0 {
            0.0
        } else {
            total_attempts as f64 / tasks_with_retries as f64
        };
        RetryStatistics {
            tasks_with_retries,
            total_attempts,
            average_attempts,
        }
    }
}
