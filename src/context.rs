//! Per-execution context handed to handlers.
//!
//! Each running task owns one [`TaskExecutionContext`]: identity, progress,
//! current step, a capped log ring, and free-form debug info. Handlers
//! receive a [`ContextHandle`] as an explicit argument. Observers can also
//! reach a live context by task id through [`TaskContextManager`] for as
//! long as the task runs.
//!
//! # Design
//!
//! The engine installs a context with [`TaskContextManager::install`], which
//! returns a [`ContextGuard`]. Dropping the guard removes the context from
//! the keyed lookup, so every exit path of the driver (success, failure,
//! timeout, cancellation, panic unwinding) releases it. A handle cloned by a
//! handler stays usable after removal but is no longer discoverable by id.
//!
//! `ContextHandle` is `Clone + Send + Sync`: it wraps an
//! `Arc<parking_lot::Mutex<TaskExecutionContext>>`. Cloning is a ref-count
//! bump and every clone points at the same context.
//!
//! # Examples
//!
//! ```
//! use taskmill::context::TaskContextManager;
//! use taskmill::TaskType;
//!
//! let manager = TaskContextManager::new();
//! {
//!     let guard = manager.install("t-1", &TaskType::DocumentAnalysis);
//!     guard.handle().set_progress(150.0, Some("parsing"));
//!     let snapshot = manager.snapshot("t-1").unwrap();
//!     assert_eq!(snapshot.progress_percent, 100.0);
//!     assert_eq!(snapshot.current_step.as_deref(), Some("parsing"));
//! }
//! assert!(manager.get("t-1").is_none());
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::constants::MAX_CONTEXT_LOG_ENTRIES;
use crate::domain::Payload;
use crate::types::task::TaskType;

/// Severity of a context log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal progress.
    Info,
    /// Something unexpected but recoverable.
    Warn,
    /// A failure.
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// One structured log line recorded by a handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    /// When the line was recorded.
    pub timestamp: DateTime<Utc>,
    /// Severity.
    pub level: LogLevel,
    /// Message text.
    pub message: String,
    /// Step active when the line was recorded.
    pub step: Option<String>,
    /// Progress when the line was recorded.
    pub progress: Option<f64>,
    /// Extra structured fields.
    pub extra: Payload,
}

/// Mutable state of one running task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskExecutionContext {
    /// The task being executed.
    pub task_id: String,
    /// Its type.
    pub task_type: TaskType,
    /// `worker-{thread id}` of the thread that last picked the task up.
    pub worker_id: String,
    /// OS process id.
    pub process_id: u32,
    /// Debug form of the executing thread's id.
    pub thread_id: String,
    /// When the context was installed.
    pub started_at: DateTime<Utc>,
    /// Handler-reported progress, 0 to 100.
    pub progress_percent: f64,
    /// Handler-reported step name.
    pub current_step: Option<String>,
    /// Most recent log entries, oldest first.
    pub logs: VecDeque<LogEntry>,
    /// Free-form diagnostic values.
    pub debug_info: Payload,
}

fn current_thread_id() -> String {
    format!("{:?}", std::thread::current().id())
}

impl TaskExecutionContext {
    /// A fresh context with identity taken from the calling thread.
    pub fn new(task_id: impl Into<String>, task_type: TaskType) -> Self {
        let thread_id = current_thread_id();
        Self {
            task_id: task_id.into(),
            task_type,
            worker_id: format!("worker-{thread_id}"),
            process_id: std::process::id(),
            thread_id,
            started_at: Utc::now(),
            progress_percent: 0.0,
            current_step: None,
            logs: VecDeque::new(),
            debug_info: Payload::new(),
        }
    }

    /// Sets progress, clamped to `0..=100`, and optionally the step.
    pub fn set_progress(&mut self, percent: f64, step: Option<&str>) {
        self.progress_percent = if percent.is_nan() {
            0.0
        } else {
            percent.clamp(0.0, 100.0)
        };
        if let Some(step) = step {
            self.current_step = Some(step.to_string());
        }
    }

    /// Replaces the current step.
    pub fn update_step(&mut self, step: impl Into<String>) {
        self.current_step = Some(step.into());
    }

    /// Appends a log entry, dropping the oldest past the cap.
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>, extra: Payload) {
        if self.logs.len() >= MAX_CONTEXT_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            step: self.current_step.clone(),
            progress: Some(self.progress_percent),
            extra,
        });
    }

    /// Stores one debug value.
    pub fn set_debug_info(&mut self, key: impl Into<String>, value: Value) {
        self.debug_info.insert(key.into(), value);
    }

    /// Re-captures identity from the calling thread.
    pub fn bind_current_thread(&mut self) {
        self.thread_id = current_thread_id();
        self.worker_id = format!("worker-{}", self.thread_id);
    }
}

/// Shared handle to a live [`TaskExecutionContext`].
#[derive(Clone)]
pub struct ContextHandle {
    inner: Arc<Mutex<TaskExecutionContext>>,
}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("task_id", &self.inner.lock().task_id)
            .finish()
    }
}

impl ContextHandle {
    /// A handle to a context that is not registered anywhere.
    ///
    /// Used for ad-hoc executor submissions outside the engine.
    pub fn detached(task_id: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TaskExecutionContext::new(task_id, task_type))),
        }
    }

    /// The task this context belongs to.
    pub fn task_id(&self) -> String {
        self.inner.lock().task_id.clone()
    }

    /// See [`TaskExecutionContext::set_progress`].
    pub fn set_progress(&self, percent: f64, step: Option<&str>) {
        self.inner.lock().set_progress(percent, step);
    }

    /// See [`TaskExecutionContext::update_step`].
    pub fn update_step(&self, step: impl Into<String>) {
        self.inner.lock().update_step(step);
    }

    /// See [`TaskExecutionContext::set_debug_info`].
    pub fn set_debug_info(&self, key: impl Into<String>, value: Value) {
        self.inner.lock().set_debug_info(key, value);
    }

    /// Records a log entry and mirrors it to `tracing`.
    pub fn log(&self, level: LogLevel, message: impl Into<String>, extra: Payload) {
        let message = message.into();
        let task_id = {
            let mut ctx = self.inner.lock();
            ctx.log(level, message.clone(), extra);
            ctx.task_id.clone()
        };
        match level {
            LogLevel::Debug => tracing::debug!(task_id = %task_id, "{message}"),
            LogLevel::Info => tracing::info!(task_id = %task_id, "{message}"),
            LogLevel::Warn => tracing::warn!(task_id = %task_id, "{message}"),
            LogLevel::Error => tracing::error!(task_id = %task_id, "{message}"),
        }
    }

    /// Logs at debug level.
    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message, Payload::new());
    }

    /// Logs at info level.
    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message, Payload::new());
    }

    /// Logs at warn level.
    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message, Payload::new());
    }

    /// Logs at error level.
    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message, Payload::new());
    }

    /// Current progress.
    pub fn progress(&self) -> f64 {
        self.inner.lock().progress_percent
    }

    /// A copy of the context as it is now.
    pub fn snapshot(&self) -> TaskExecutionContext {
        self.inner.lock().clone()
    }

    pub(crate) fn bind_current_thread(&self) {
        self.inner.lock().bind_current_thread();
    }
}

/// Keyed registry of live contexts.
#[derive(Debug, Clone, Default)]
pub struct TaskContextManager {
    contexts: Arc<DashMap<String, ContextHandle>>,
}

impl TaskContextManager {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and registers a context for `task_id`, replacing any stale
    /// entry. The context is removed when the returned guard drops.
    pub fn install(&self, task_id: &str, task_type: &TaskType) -> ContextGuard {
        let handle = ContextHandle::detached(task_id, task_type.clone());
        if self
            .contexts
            .insert(task_id.to_string(), handle.clone())
            .is_some()
        {
            tracing::warn!(task_id = %task_id, "replaced a stale execution context");
        }
        ContextGuard {
            contexts: Arc::clone(&self.contexts),
            task_id: task_id.to_string(),
            handle,
        }
    }

    /// The live context of `task_id`, if it is running.
    pub fn get(&self, task_id: &str) -> Option<ContextHandle> {
        self.contexts.get(task_id).map(|h| h.value().clone())
    }

    /// A copy of the live context of `task_id`.
    pub fn snapshot(&self, task_id: &str) -> Option<TaskExecutionContext> {
        self.get(task_id).map(|h| h.snapshot())
    }

    /// Returns `true` if `task_id` has a live context.
    pub fn contains(&self, task_id: &str) -> bool {
        self.contexts.contains_key(task_id)
    }

    /// Number of live contexts.
    pub fn active_count(&self) -> usize {
        self.contexts.len()
    }
}

/// Removes its context from the registry on drop.
#[derive(Debug)]
pub struct ContextGuard {
    contexts: Arc<DashMap<String, ContextHandle>>,
    task_id: String,
    handle: ContextHandle,
}

impl ContextGuard {
    /// The guarded context.
    pub fn handle(&self) -> &ContextHandle {
        &self.handle
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        // Only remove our own entry; a newer install for the same id wins.
        self.contexts
            .remove_if(&self.task_id, |_, h| Arc::ptr_eq(&h.inner, &self.handle.inner));
    }
}
