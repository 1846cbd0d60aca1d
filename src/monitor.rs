//! Execution metrics.
//!
//! [`TaskMonitor`] counts lifecycle outcomes, keeps bounded samples of
//! execution and queue time, and produces a [`MetricsSnapshot`] on demand.
//! It is purely observational: nothing in the engine reads it back.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::constants::MAX_MONITOR_SAMPLES;
use crate::domain::Task;
use crate::types::task::{TaskStatus, TaskType};

const THROUGHPUT_WINDOW: Duration = Duration::from_secs(60);

/// What the monitor was told about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    /// A task was accepted.
    Submitted {
        /// Its type.
        task_type: TaskType,
    },
    /// A task started running.
    Started {
        /// Its type.
        task_type: TaskType,
    },
    /// A task left `Running`.
    Finished {
        /// Its type.
        task_type: TaskType,
        /// Where it ended up.
        status: TaskStatus,
        /// Seconds spent running, if known.
        execution_time: Option<f64>,
        /// Seconds spent queued, if known.
        queue_time: Option<f64>,
    },
    /// A retry was accepted.
    Retried {
        /// Its type.
        task_type: TaskType,
    },
}

/// Outcome counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    /// Accepted submissions.
    pub submitted: u64,
    /// Reached `Completed`.
    pub completed: u64,
    /// Reached `Failed`.
    pub failed: u64,
    /// Reached `Cancelled`.
    pub cancelled: u64,
    /// Reached `Timeout`.
    pub timed_out: u64,
    /// Accepted retries.
    pub retried: u64,
}

impl Counters {
    fn apply(&mut self, event: &MonitorEvent) {
        match event {
            MonitorEvent::Submitted { .. } => self.submitted += 1,
            MonitorEvent::Retried { .. } => self.retried += 1,
            MonitorEvent::Started { .. } => {},
            MonitorEvent::Finished { status, .. } => match status {
                TaskStatus::Completed => self.completed += 1,
                TaskStatus::Failed => self.failed += 1,
                TaskStatus::Cancelled => self.cancelled += 1,
                TaskStatus::Timeout => self.timed_out += 1,
                _ => {},
            },
        }
    }
}

/// Point-in-time view of the monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Totals.
    pub counters: Counters,
    /// Totals per task type.
    pub by_type: BTreeMap<String, Counters>,
    /// `completed / (completed + failed + timed_out) * 100`, or 0.
    pub success_rate: f64,
    /// Mean execution time in seconds.
    pub average_execution_time: Option<f64>,
    /// Median execution time in seconds.
    pub p50_execution_time: Option<f64>,
    /// 95th percentile execution time in seconds.
    pub p95_execution_time: Option<f64>,
    /// Mean queue time in seconds.
    pub average_queue_time: Option<f64>,
    /// Tasks finished per second over the last minute.
    pub throughput_per_second: f64,
    /// Tasks started but not finished.
    pub active_tasks: u64,
}

type MetricsCallback = Arc<dyn Fn(&MonitorEvent) + Send + Sync>;

#[derive(Debug, Default)]
struct MonitorState {
    counters: Counters,
    by_type: BTreeMap<String, Counters>,
    execution_times: VecDeque<f64>,
    queue_times: VecDeque<f64>,
    finished_at: VecDeque<Instant>,
    active: u64,
}

fn push_bounded<T>(samples: &mut VecDeque<T>, value: T) {
    if samples.len() >= MAX_MONITOR_SAMPLES {
        samples.pop_front();
    }
    samples.push_back(value);
}

fn mean(samples: &VecDeque<f64>) -> Option<f64> {
    (!samples.is_empty()).then(|| samples.iter().sum::<f64>() / samples.len() as f64)
}

fn percentile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    // Nearest-rank.
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted.get(rank.clamp(1, sorted.len()) - 1).copied()
}

/// Aggregates execution metrics.
#[derive(Default)]
pub struct TaskMonitor {
    state: Mutex<MonitorState>,
    callbacks: RwLock<Vec<MetricsCallback>>,
}

impl std::fmt::Debug for TaskMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskMonitor")
            .field("counters", &self.state.lock().counters)
            .finish_non_exhaustive()
    }
}

impl TaskMonitor {
    /// An empty monitor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback run on every recorded event.
    pub fn on_event<F>(&self, callback: F)
    where
        F: Fn(&MonitorEvent) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    /// Records an accepted submission.
    pub fn record_submitted(&self, task_type: &TaskType) {
        self.record(MonitorEvent::Submitted {
            task_type: task_type.clone(),
        });
    }

    /// Records a task entering `Running`.
    pub fn record_started(&self, task: &Task) {
        self.record(MonitorEvent::Started {
            task_type: task.task_type.clone(),
        });
    }

    /// Records a task leaving `Running` (or a pending task being cancelled).
    pub fn record_finished(&self, task: &Task, was_running: bool) {
        self.record_event(
            MonitorEvent::Finished {
                task_type: task.task_type.clone(),
                status: task.status,
                execution_time: task.execution_time().map(|d| d.as_secs_f64()),
                queue_time: task.queue_time().map(|d| d.as_secs_f64()),
            },
            was_running,
        );
    }

    /// Records an accepted retry.
    pub fn record_retried(&self, task_type: &TaskType) {
        self.record(MonitorEvent::Retried {
            task_type: task_type.clone(),
        });
    }

    fn record(&self, event: MonitorEvent) {
        self.record_event(event, false);
    }

    fn record_event(&self, event: MonitorEvent, was_running: bool) {
        {
            let mut state = self.state.lock();
            state.counters.apply(&event);
            let task_type = match &event {
                MonitorEvent::Submitted { task_type }
                | MonitorEvent::Started { task_type }
                | MonitorEvent::Finished { task_type, .. }
                | MonitorEvent::Retried { task_type } => task_type.to_string(),
            };
            state.by_type.entry(task_type).or_default().apply(&event);

            match &event {
                MonitorEvent::Started { .. } => state.active += 1,
                MonitorEvent::Finished {
                    execution_time,
                    queue_time,
                    ..
                } => {
                    if was_running {
                        state.active = state.active.saturating_sub(1);
                    }
                    if let Some(t) = execution_time {
                        push_bounded(&mut state.execution_times, *t);
                    }
                    if let Some(t) = queue_time {
                        push_bounded(&mut state.queue_times, *t);
                    }
                    push_bounded(&mut state.finished_at, Instant::now());
                },
                _ => {},
            }
        }

        let callbacks = self.callbacks.read().clone();
        for callback in callbacks {
            callback(&event);
        }
    }

    /// Current metrics.
    pub fn metrics(&self) -> MetricsSnapshot {
        let state = self.state.lock();
        let mut sorted: Vec<f64> = state.execution_times.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);

        let c = &state.counters;
        let outcomes = c.completed + c.failed + c.timed_out;
        let recent = state
            .finished_at
            .iter()
            .filter(|at| at.elapsed() <= THROUGHPUT_WINDOW)
            .count();

        MetricsSnapshot {
            counters: c.clone(),
            by_type: state.by_type.clone(),
            success_rate: if outcomes == 0 {
                0.0
            } else {
                c.completed as f64 / outcomes as f64 * 100.0
            },
            average_execution_time: mean(&state.execution_times),
            p50_execution_time: percentile(&sorted, 0.5),
            p95_execution_time: percentile(&sorted, 0.95),
            average_queue_time: mean(&state.queue_times),
            throughput_per_second: recent as f64 / THROUGHPUT_WINDOW.as_secs_f64(),
            active_tasks: state.active,
        }
    }

    /// Clears every counter and sample. Callbacks stay registered.
    pub fn reset(&self) {
        *self.state.lock() = MonitorState::default();
    }
}
