//! Handler routing across worker pools.
//!
//! Three execution paths exist:
//!
//! - **CPU pool**: dedicated OS threads, one per core by default. A worker
//!   retires after `max_tasks_per_child` jobs and starts its own replacement,
//!   which bounds per-thread memory growth from long-lived handler state.
//! - **IO pool**: dedicated OS threads, four per core by default.
//! - **Inline**: async handlers are awaited on the runtime; sync handlers on
//!   this path go through `spawn_blocking`.
//!
//! Pools are fed through a bounded `tokio::sync::mpsc` channel shared by all
//! workers of the pool; results come back over a `oneshot`. Panics inside a
//! handler are caught and surface as a fatal [`HandlerError`]; the worker
//! keeps running.
//!
//! Dropping the future returned by [`ExecutorManager::submit`] stops waiting
//! for pooled work but does not interrupt it. The job runs to completion on
//! its worker and its result is discarded.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::constants::{DEFAULT_MAX_TASKS_PER_CHILD, IO_POOL_MULTIPLIER};
use crate::context::ContextHandle;
use crate::domain::Payload;
use crate::error::{HandlerError, TaskError};
use crate::types::task::{ExecutionMode, TaskType};

/// What a handler returns.
pub type HandlerResult = Result<Payload, HandlerError>;

type SyncHandlerFn = dyn Fn(Payload, ContextHandle) -> HandlerResult + Send + Sync;
type AsyncHandlerFn =
    dyn Fn(Payload, ContextHandle) -> BoxFuture<'static, HandlerResult> + Send + Sync;

/// A registered handler, tagged with its calling convention.
///
/// # Examples
///
/// ```
/// use taskmill::executor::TaskHandler;
/// use taskmill::domain::Payload;
///
/// let blocking = TaskHandler::sync(|input, _ctx| Ok(input));
/// let asynchronous = TaskHandler::from_async(|input: Payload, _ctx| async move { Ok(input) });
/// assert!(!blocking.is_async());
/// assert!(asynchronous.is_async());
/// ```
#[derive(Clone)]
pub enum TaskHandler {
    /// Runs to completion on whichever thread picks it up.
    Sync(Arc<SyncHandlerFn>),
    /// Returns a future.
    Async(Arc<AsyncHandlerFn>),
}

impl TaskHandler {
    /// Wraps a blocking function.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Payload, ContextHandle) -> HandlerResult + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    /// Wraps an async function.
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Payload, ContextHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self::Async(Arc::new(move |input, ctx| f(input, ctx).boxed()))
    }

    /// Returns `true` for [`TaskHandler::Async`].
    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }
}

impl fmt::Debug for TaskHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("TaskHandler::Sync"),
            Self::Async(_) => f.write_str("TaskHandler::Async"),
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string())
}

fn panic_error(payload: &(dyn std::any::Any + Send)) -> HandlerError {
    HandlerError::fatal("panic", panic_message(payload))
}

struct PoolShared {
    name: &'static str,
    receiver: Mutex<mpsc::Receiver<Job>>,
    max_tasks_per_worker: Option<u64>,
    next_worker: AtomicUsize,
    live_workers: AtomicUsize,
    recycled: AtomicU64,
}

fn spawn_worker(shared: &Arc<PoolShared>) -> std::io::Result<()> {
    let id = shared.next_worker.fetch_add(1, Ordering::Relaxed);
    let worker_shared = Arc::clone(shared);
    shared.live_workers.fetch_add(1, Ordering::Relaxed);
    let spawned = std::thread::Builder::new()
        .name(format!("{}-worker-{id}", shared.name))
        .spawn(move || worker_loop(worker_shared));
    if spawned.is_err() {
        shared.live_workers.fetch_sub(1, Ordering::Relaxed);
    }
    spawned.map(|_| ())
}

fn worker_loop(shared: Arc<PoolShared>) {
    let mut handled: u64 = 0;
    loop {
        let job = shared.receiver.lock().blocking_recv();
        let Some(job) = job else {
            break;
        };
        job();
        handled += 1;

        if shared.max_tasks_per_worker.is_some_and(|max| handled >= max) {
            match spawn_worker(&shared) {
                Ok(()) => {
                    shared.recycled.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(pool = shared.name, handled, "worker recycled");
                    break;
                },
                Err(e) => {
                    tracing::warn!(pool = shared.name, error = %e, "could not recycle worker");
                    handled = 0;
                },
            }
        }
    }
    shared.live_workers.fetch_sub(1, Ordering::Relaxed);
}

/// A fixed-size pool of OS threads.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    size: usize,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.name)
            .field("size", &self.size)
            .field("live_workers", &self.live_workers())
            .finish()
    }
}

impl WorkerPool {
    /// Starts `size` workers (at least one). With `max_tasks_per_worker`
    /// set, each worker is replaced after that many jobs.
    pub fn new(
        name: &'static str,
        size: usize,
        max_tasks_per_worker: Option<u64>,
    ) -> Result<Self, TaskError> {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel(size * 64);
        let shared = Arc::new(PoolShared {
            name,
            receiver: Mutex::new(receiver),
            max_tasks_per_worker: max_tasks_per_worker.filter(|max| *max > 0),
            next_worker: AtomicUsize::new(0),
            live_workers: AtomicUsize::new(0),
            recycled: AtomicU64::new(0),
        });
        for _ in 0..size {
            spawn_worker(&shared)
                .map_err(|e| TaskError::Executor(format!("failed to start {name} worker: {e}")))?;
        }
        tracing::debug!(pool = name, size, "worker pool started");
        Ok(Self {
            shared,
            sender: Mutex::new(Some(sender)),
            size,
        })
    }

    /// Configured worker count.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers currently alive.
    pub fn live_workers(&self) -> usize {
        self.shared.live_workers.load(Ordering::Relaxed)
    }

    /// Workers retired and replaced so far.
    pub fn recycled_workers(&self) -> u64 {
        self.shared.recycled.load(Ordering::Relaxed)
    }

    fn closed(&self) -> TaskError {
        TaskError::Executor(format!("{} pool is shut down", self.shared.name))
    }

    /// Runs `job` on a worker and waits for its value.
    ///
    /// # Errors
    ///
    /// - [`TaskError::Executor`] if the pool is shut down.
    /// - [`TaskError::Handler`] with a fatal `panic` error if `job` panics.
    pub async fn execute<F, T>(&self, job: F) -> Result<T, TaskError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.sender.lock().clone().ok_or_else(|| self.closed())?;
        let (tx, rx) = oneshot::channel();
        let wrapped: Job = Box::new(move || {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(job));
            let _ = tx.send(outcome);
        });
        sender.send(wrapped).await.map_err(|_| self.closed())?;
        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => Err(TaskError::Handler(panic_error(payload.as_ref()))),
            Err(_) => Err(self.closed()),
        }
    }

    /// Stops accepting work. Queued jobs still run; idle workers exit.
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_some() {
            tracing::debug!(pool = self.shared.name, "worker pool shutting down");
        }
    }
}

/// Pool sizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// CPU workers. `0` means one per core.
    pub cpu_workers: usize,
    /// IO workers. `0` means four per core.
    pub io_workers: usize,
    /// Jobs per CPU worker before it is replaced. `0` disables recycling.
    pub max_tasks_per_child: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            cpu_workers: 0,
            io_workers: 0,
            max_tasks_per_child: DEFAULT_MAX_TASKS_PER_CHILD,
        }
    }
}

impl ExecutorConfig {
    fn cores() -> usize {
        std::thread::available_parallelism().map_or(1, |n| n.get())
    }

    /// CPU pool size after auto-detection.
    pub fn resolved_cpu_workers(&self) -> usize {
        if self.cpu_workers == 0 {
            Self::cores()
        } else {
            self.cpu_workers
        }
    }

    /// IO pool size after auto-detection.
    pub fn resolved_io_workers(&self) -> usize {
        if self.io_workers == 0 {
            Self::cores() * IO_POOL_MULTIPLIER
        } else {
            self.io_workers
        }
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Counters for one execution path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    /// Which path.
    pub mode: ExecutionMode,
    /// Worker threads (0 for the inline path).
    pub workers: usize,
    /// Jobs accepted.
    pub submitted: u64,
    /// Jobs that returned `Ok`.
    pub completed: u64,
    /// Jobs that failed or panicked.
    pub failed: u64,
    /// `completed / (completed + failed) * 100`, or 0.
    pub success_rate: f64,
    /// Finished jobs per second of uptime.
    pub tasks_per_second: f64,
    /// Time since the executor started.
    pub uptime: Duration,
    /// Workers retired and replaced.
    pub recycled_workers: u64,
}

/// One job of a batch submission.
#[derive(Debug, Clone)]
pub struct BatchItem {
    /// Identifies the job in logs and its context.
    pub task_id: String,
    /// Used for routing when `execution_mode` is unset.
    pub task_type: TaskType,
    /// Pinned routing.
    pub execution_mode: Option<ExecutionMode>,
    /// What to run.
    pub handler: TaskHandler,
    /// Handler input.
    pub input: Payload,
}

struct ExecutorInner {
    cpu: WorkerPool,
    io: WorkerPool,
    counters: [PoolCounters; 3],
    started: Instant,
}

/// Routes handlers to the CPU pool, the IO pool, or the runtime.
///
/// Cloning is cheap; clones share the pools.
#[derive(Clone)]
pub struct ExecutorManager {
    inner: Arc<ExecutorInner>,
}

impl fmt::Debug for ExecutorManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorManager")
            .field("cpu", &self.inner.cpu)
            .field("io", &self.inner.io)
            .finish()
    }
}

fn slot(mode: ExecutionMode) -> usize {
    match mode {
        ExecutionMode::CpuIntensive => 0,
        ExecutionMode::IoIntensive => 1,
        ExecutionMode::AsyncCoroutine => 2,
    }
}

impl ExecutorManager {
    /// Starts both pools.
    pub fn new(config: &ExecutorConfig) -> Result<Self, TaskError> {
        let cpu = WorkerPool::new(
            "cpu",
            config.resolved_cpu_workers(),
            Some(config.max_tasks_per_child),
        )?;
        let io = WorkerPool::new("io", config.resolved_io_workers(), None)?;
        Ok(Self {
            inner: Arc::new(ExecutorInner {
                cpu,
                io,
                counters: Default::default(),
                started: Instant::now(),
            }),
        })
    }

    /// Picks the execution path: the pinned mode, then the type's default,
    /// then inline for async handlers and the IO pool for sync ones.
    pub fn resolve_mode(
        task_type: &TaskType,
        pinned: Option<ExecutionMode>,
        handler: &TaskHandler,
    ) -> ExecutionMode {
        pinned
            .or_else(|| task_type.default_execution_mode())
            .unwrap_or(if handler.is_async() {
                ExecutionMode::AsyncCoroutine
            } else {
                ExecutionMode::IoIntensive
            })
    }

    /// Runs `handler` on the path for `mode`.
    ///
    /// # Errors
    ///
    /// - [`TaskError::Handler`] if the handler returns an error or panics.
    /// - [`TaskError::Executor`] if the pool is shut down.
    pub async fn submit(
        &self,
        mode: ExecutionMode,
        handler: &TaskHandler,
        input: Payload,
        ctx: ContextHandle,
    ) -> Result<Payload, TaskError> {
        let counters = &self.inner.counters[slot(mode)];
        counters.submitted.fetch_add(1, Ordering::Relaxed);

        let outcome = self.dispatch(mode, handler.clone(), input, ctx).await;

        match &outcome {
            Ok(_) => counters.completed.fetch_add(1, Ordering::Relaxed),
            Err(_) => counters.failed.fetch_add(1, Ordering::Relaxed),
        };
        outcome
    }

    async fn dispatch(
        &self,
        mode: ExecutionMode,
        handler: TaskHandler,
        input: Payload,
        ctx: ContextHandle,
    ) -> Result<Payload, TaskError> {
        let pool = match mode {
            ExecutionMode::CpuIntensive => &self.inner.cpu,
            ExecutionMode::IoIntensive => &self.inner.io,
            ExecutionMode::AsyncCoroutine => {
                return match handler {
                    TaskHandler::Async(f) => AssertUnwindSafe(f(input, ctx))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|payload| Err(panic_error(payload.as_ref())))
                        .map_err(TaskError::from),
                    TaskHandler::Sync(f) => {
                        tokio::task::spawn_blocking(move || {
                            ctx.bind_current_thread();
                            f(input, ctx)
                        })
                        .await
                        .map_err(|e| match e.try_into_panic() {
                            Ok(payload) => TaskError::Handler(panic_error(payload.as_ref())),
                            Err(e) => TaskError::Executor(e.to_string()),
                        })?
                        .map_err(TaskError::from)
                    },
                };
            },
        };

        let result = match handler {
            TaskHandler::Sync(f) => {
                pool.execute(move || {
                    ctx.bind_current_thread();
                    f(input, ctx)
                })
                .await?
            },
            TaskHandler::Async(f) => {
                let runtime = tokio::runtime::Handle::current();
                pool.execute(move || {
                    ctx.bind_current_thread();
                    runtime.block_on(f(input, ctx))
                })
                .await?
            },
        };
        result.map_err(TaskError::from)
    }

    /// Starts every item and returns one future per item, in order.
    ///
    /// Items run independently; one failure never affects the others.
    pub fn submit_batch(
        &self,
        items: Vec<BatchItem>,
    ) -> Vec<BoxFuture<'static, Result<Payload, TaskError>>> {
        items
            .into_iter()
            .map(|item| {
                let executor = self.clone();
                let handle = tokio::spawn(async move {
                    let mode =
                        Self::resolve_mode(&item.task_type, item.execution_mode, &item.handler);
                    let ctx = ContextHandle::detached(item.task_id, item.task_type);
                    executor.submit(mode, &item.handler, item.input, ctx).await
                });
                async move {
                    handle
                        .await
                        .map_err(|e| TaskError::Executor(e.to_string()))?
                }
                .boxed()
            })
            .collect()
    }

    /// Runs every item and collects per-item results, in order.
    pub async fn submit_batch_async(
        &self,
        items: Vec<BatchItem>,
    ) -> Vec<Result<Payload, TaskError>> {
        join_all(self.submit_batch(items)).await
    }

    /// Counters for one path.
    pub fn stats(&self, mode: ExecutionMode) -> PoolStats {
        let counters = &self.inner.counters[slot(mode)];
        let submitted = counters.submitted.load(Ordering::Relaxed);
        let completed = counters.completed.load(Ordering::Relaxed);
        let failed = counters.failed.load(Ordering::Relaxed);
        let finished = completed + failed;
        let uptime = self.inner.started.elapsed();
        let (workers, recycled_workers) = match mode {
            ExecutionMode::CpuIntensive => (self.inner.cpu.size(), self.inner.cpu.recycled_workers()),
            ExecutionMode::IoIntensive => (self.inner.io.size(), self.inner.io.recycled_workers()),
            ExecutionMode::AsyncCoroutine => (0, 0),
        };
        PoolStats {
            mode,
            workers,
            submitted,
            completed,
            failed,
            success_rate: if finished == 0 {
                0.0
            } else {
                completed as f64 / finished as f64 * 100.0
            },
            tasks_per_second: if uptime.is_zero() {
                0.0
            } else {
                finished as f64 / uptime.as_secs_f64()
            },
            uptime,
            recycled_workers,
        }
    }

    /// Counters for all three paths.
    pub fn all_stats(&self) -> Vec<PoolStats> {
        ExecutionMode::ALL.iter().map(|mode| self.stats(*mode)).collect()
    }

    /// Closes both pools. Queued jobs finish; new submissions fail.
    pub fn shutdown(&self) {
        self.inner.cpu.shutdown();
        self.inner.io.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn small() -> ExecutorManager {
        ExecutorManager::new(&ExecutorConfig {
            cpu_workers: 1,
            io_workers: 2,
            max_tasks_per_child: 2,
        })
        .unwrap()
    }

    fn echo() -> TaskHandler {
        TaskHandler::sync(|mut input, ctx| {
            ctx.set_progress(50.0, Some("echo"));
            input.insert("worker".into(), json!(ctx.snapshot().worker_id));
            Ok(input)
        })
    }

    fn ctx(id: &str) -> ContextHandle {
        ContextHandle::detached(id, TaskType::Custom("test".into()))
    }

    #[test]
    fn routing_precedence() {
        let sync = echo();
        let asynchronous = TaskHandler::from_async(|input, _| async move { Ok(input) });
        let custom = TaskType::Custom("ocr".into());

        assert_eq!(
            ExecutorManager::resolve_mode(&TaskType::TestExecution, None, &sync),
            ExecutionMode::IoIntensive
        );
        assert_eq!(
            ExecutorManager::resolve_mode(
                &TaskType::TestExecution,
                Some(ExecutionMode::CpuIntensive),
                &sync
            ),
            ExecutionMode::CpuIntensive
        );
        assert_eq!(
            ExecutorManager::resolve_mode(&custom, None, &asynchronous),
            ExecutionMode::AsyncCoroutine
        );
        assert_eq!(
            ExecutorManager::resolve_mode(&custom, None, &sync),
            ExecutionMode::IoIntensive
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sync_handler_runs_on_a_pool_thread() {
        let executor = small();
        let handle = ctx("t1");
        let out = executor
            .submit(ExecutionMode::CpuIntensive, &echo(), Payload::new(), handle.clone())
            .await
            .unwrap();
        assert!(out["worker"].as_str().unwrap().starts_with("worker-"));
        assert_eq!(handle.progress(), 50.0);
        let stats = executor.stats(ExecutionMode::CpuIntensive);
        assert_eq!((stats.submitted, stats.completed, stats.failed), (1, 1, 0));
        assert_eq!(stats.success_rate, 100.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_handler_runs_inline_and_in_pools() {
        let executor = small();
        let handler = TaskHandler::from_async(|mut input: Payload, _| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            input.insert("done".into(), json!(true));
            Ok(input)
        });
        for mode in ExecutionMode::ALL {
            let out = executor
                .submit(mode, &handler, Payload::new(), ctx("a"))
                .await
                .unwrap();
            assert_eq!(out["done"], true);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panics_become_fatal_errors() {
        let executor = small();
        let boom = TaskHandler::sync(|_, _| panic!("kaboom"));
        for mode in ExecutionMode::ALL {
            let err = executor
                .submit(mode, &boom, Payload::new(), ctx("p"))
                .await
                .unwrap_err();
            match err {
                TaskError::Handler(e) => {
                    assert!(!e.is_retryable());
                    assert_eq!(e.kind(), "panic");
                    assert_eq!(e.message(), "kaboom");
                },
                other => panic!("unexpected error: {other}"),
            }
        }
        // The pool survived.
        executor
            .submit(ExecutionMode::CpuIntensive, &echo(), Payload::new(), ctx("after"))
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cpu_workers_are_recycled() {
        let executor = small();
        for i in 0..6 {
            executor
                .submit(ExecutionMode::CpuIntensive, &echo(), Payload::new(), ctx(&format!("r{i}")))
                .await
                .unwrap();
        }
        // Recycling happens after the result is sent; give the last worker a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(executor.stats(ExecutionMode::CpuIntensive).recycled_workers >= 2);
        assert_eq!(executor.stats(ExecutionMode::IoIntensive).recycled_workers, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn batch_isolates_failures() {
        let executor = small();
        let failing = TaskHandler::sync(|_, _| Err(HandlerError::retryable("io", "disk busy")));
        let items = vec![
            BatchItem {
                task_id: "ok".into(),
                task_type: TaskType::TestExecution,
                execution_mode: None,
                handler: echo(),
                input: Payload::new(),
            },
            BatchItem {
                task_id: "bad".into(),
                task_type: TaskType::TestExecution,
                execution_mode: Some(ExecutionMode::AsyncCoroutine),
                handler: failing,
                input: Payload::new(),
            },
        ];
        let results = executor.submit_batch_async(items).await;
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(
            &results[1],
            Err(TaskError::Handler(HandlerError::Retryable { .. }))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_rejects_new_work() {
        let executor = small();
        executor.shutdown();
        let err = executor
            .submit(ExecutionMode::IoIntensive, &echo(), Payload::new(), ctx("late"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "executor");
        // Inline work does not depend on the pools.
        executor
            .submit(ExecutionMode::AsyncCoroutine, &echo(), Payload::new(), ctx("inline"))
            .await
            .unwrap();
    }
}
