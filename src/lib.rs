//! Asynchronous task execution engine.
//!
//! `taskmill` accepts units of work tagged with a task type, persists them,
//! and runs them through a registered handler on one of three execution
//! paths (a CPU pool, an IO pool, or inline on the async runtime), each
//! under a deadline and an optional retry policy.
//!
//! # Overview
//!
//! A task moves through a fixed state machine:
//! `pending` -> `running` -> `completed` / `failed` / `timeout` /
//! `cancelled`, with `retrying` as the way back from `failed` and `timeout`.
//! Every status write is conditional on the status the writer last saw, so
//! a cancel, a timeout sweep and the task's own driver never overwrite each
//! other.
//!
//! # Module Organization
//!
//! - [`engine`] - The [`TaskEngine`] orchestrator and its builder
//! - [`store`] - Storage contract and the in-memory (and sqlite) stores
//! - [`lifecycle`] - Transition validation and lifecycle events
//! - [`retry`] / [`timeout`] - Policies and their managers
//! - [`executor`] - Worker pools and handler dispatch
//! - [`context`] - Per-task progress and log reporting
//! - [`monitor`] - Execution metrics
//! - [`config`] - File and environment configuration
//! - [`error`] - The [`TaskError`] taxonomy and [`HandlerError`] outcomes

pub mod config;
pub mod constants;
pub mod context;
pub mod domain;
pub mod engine;
pub mod error;
pub mod executor;
pub mod lifecycle;
#[cfg(feature = "logging")]
pub mod logging;
pub mod monitor;
pub mod retry;
pub mod store;
pub mod timeout;
pub mod types;

// Re-exports for ergonomic access
pub use config::EngineConfig;
pub use context::{ContextHandle, TaskContextManager, TaskExecutionContext};
pub use domain::{Payload, StatusUpdate, Task, TaskRequest};
pub use engine::{TaskEngine, TaskEngineBuilder};
pub use error::{HandlerError, TaskError};
pub use executor::{ExecutorManager, TaskHandler};
pub use lifecycle::{LifecycleEvent, LifecycleEventType, LifecycleManager};
pub use retry::{RetryConfig, RetryManager, RetryStrategy};
pub use store::memory::InMemoryTaskStore;
pub use store::{ListOptions, TaskStore};
pub use timeout::{TimeoutConfig, TimeoutManager};
pub use types::*;
