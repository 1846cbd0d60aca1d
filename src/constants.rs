//! Default values shared across the engine.

/// Default hard timeout applied when neither the task nor its type overrides it.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Default retry budget for a new task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Fraction of the hard timeout at which the soft-timeout warning fires.
pub const DEFAULT_SOFT_TIMEOUT_RATIO: f64 = 0.8;

/// Grace period granted to a task asked to stop cooperatively.
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

/// Ring buffer cap for per-task context log entries.
pub const MAX_CONTEXT_LOG_ENTRIES: usize = 100;

/// Cap on the per-task retry history.
pub const MAX_RETRY_HISTORY: usize = 10;

/// Cap on the lifecycle event history.
pub const MAX_EVENT_HISTORY: usize = 1000;

/// Tasks a CPU pool worker runs before it is recycled.
pub const DEFAULT_MAX_TASKS_PER_CHILD: u64 = 100;

/// IO pool size as a multiple of the CPU count.
pub const IO_POOL_MULTIPLIER: usize = 4;

/// Default page size for `list`.
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Upper bound on the page size for `list`.
pub const MAX_LIST_LIMIT: usize = 1000;

/// Interval between retention sweeps.
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300;

/// Age after which terminal tasks are purged.
pub const DEFAULT_RETENTION_DAYS: u64 = 7;

/// Interval between timeout sweeps.
pub const DEFAULT_TIMEOUT_SWEEP_INTERVAL_SECS: u64 = 60;

/// How long `cancel` waits for a running driver to acknowledge.
pub const DEFAULT_CANCEL_ACK_TIMEOUT_MS: u64 = 5000;

/// Completed-task samples kept by the monitor.
pub const MAX_MONITOR_SAMPLES: usize = 10_000;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "TASKMILL_";
