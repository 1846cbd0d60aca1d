//! End-to-end tests for the task engine: execution, retries, timeouts,
//! cancellation, and execution-context cleanup.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use taskmill::engine::TaskEngine;
use taskmill::executor::TaskHandler;
use taskmill::lifecycle::{EventHandler, LifecycleEvent, LifecycleEventType};
use taskmill::retry::{RetryCondition, RetryConfig, RetryManager, RetryStrategy};
use taskmill::{
    EngineConfig, ExecutionMode, HandlerError, Payload, Task, TaskRequest, TaskStatus, TaskType,
};

const WAIT: Duration = Duration::from_secs(10);

fn quick_retries() -> RetryManager {
    RetryManager::new(
        RetryConfig::default()
            .with_strategy(RetryStrategy::Fixed)
            .with_base_delay(Duration::from_millis(10))
            .with_jitter(false),
    )
}

fn engine_with(config: EngineConfig) -> TaskEngine {
    TaskEngine::builder()
        .config(EngineConfig {
            cpu_workers: 2,
            io_workers: 2,
            ..config
        })
        .retry_manager(quick_retries())
        .build()
        .unwrap()
}

fn engine() -> TaskEngine {
    engine_with(EngineConfig::default())
}

/// Records every lifecycle event the engine emits.
fn record_events(engine: &TaskEngine) -> Arc<Mutex<Vec<LifecycleEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    engine.lifecycle().on_any(EventHandler::sync(move |event| {
        sink.lock().push(event.clone());
        Ok(())
    }));
    events
}

fn events_for(events: &Mutex<Vec<LifecycleEvent>>, task_id: &str) -> Vec<LifecycleEventType> {
    events
        .lock()
        .iter()
        .filter(|e| e.task_id == task_id)
        .map(|e| e.event_type)
        .collect()
}

async fn wait_until(engine: &TaskEngine, task_id: &str, status: TaskStatus) -> Task {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let task = engine.get_status(task_id).await.unwrap().unwrap();
        if task.status == status {
            return task;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {task_id} stuck in {}",
            task.status
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn sleeper(secs: u64) -> TaskHandler {
    TaskHandler::from_async(move |_input, _ctx| async move {
        tokio::time::sleep(Duration::from_secs(secs)).await;
        Ok(Payload::new())
    })
}

// ─── Execution ──────────────────────────────────────────────────────────────

mod execution {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn every_execution_path_completes() {
        let engine = engine();
        engine.register_handler(
            "double",
            TaskHandler::sync(|input, ctx| {
                ctx.set_progress(50.0, Some("doubling"));
                let n = input["n"].as_i64().unwrap_or_default();
                let mut out = Payload::new();
                out.insert("n".into(), json!(n * 2));
                Ok(out)
            }),
        );

        let mut ids = Vec::new();
        for (i, mode) in ExecutionMode::ALL.into_iter().enumerate() {
            let id = engine
                .submit(
                    TaskRequest::new("double")
                        .with_input("n", json!(i + 1))
                        .with_execution_mode(mode),
                )
                .await
                .unwrap();
            ids.push((id, i as i64 + 1));
        }

        for (id, n) in ids {
            let task = engine.wait_for(&id, WAIT).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Completed);
            assert_eq!(task.result_data.unwrap()["n"], json!(n * 2));
            assert!(task.completed_at >= task.started_at);
        }
        for mode in ExecutionMode::ALL {
            assert_eq!(engine.executor().stats(mode).completed, 1, "{mode}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn events_follow_the_happy_path() {
        let engine = engine();
        let events = record_events(&engine);
        engine.register_handler("noop", TaskHandler::sync(|_, _| Ok(Payload::new())));

        let id = engine.submit(TaskRequest::new("noop")).await.unwrap();
        engine.wait_for(&id, WAIT).await.unwrap();

        assert_eq!(
            events_for(&events, &id),
            vec![
                LifecycleEventType::TaskCreated,
                LifecycleEventType::TaskStarted,
                LifecycleEventType::TaskCompleted,
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handler_error_becomes_failed_with_error_info() {
        let engine = engine();
        engine.register_handler(
            TaskType::DocumentAnalysis,
            TaskHandler::sync(|_, _| Err(HandlerError::fatal("parse", "not a pdf"))),
        );

        let id = engine
            .submit(TaskRequest::new(TaskType::DocumentAnalysis))
            .await
            .unwrap();
        let task = engine.wait_for(&id, WAIT).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.result_data.is_none());
        let info = task.error_info.unwrap();
        assert_eq!(info["error"], "not a pdf");
        assert_eq!(info["error_type"], "parse");
        assert_eq!(info["retry_count"], 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_handler_fails_without_killing_the_pool() {
        let engine = engine();
        engine.register_handler(
            "explode",
            TaskHandler::sync(|input, _| {
                if input.contains_key("boom") {
                    panic!("kaboom");
                }
                Ok(input)
            }),
        );

        let bad = engine
            .submit(
                TaskRequest::new("explode")
                    .with_input("boom", json!(true))
                    .with_execution_mode(ExecutionMode::CpuIntensive),
            )
            .await
            .unwrap();
        let task = engine.wait_for(&bad, WAIT).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_info.unwrap()["error_type"], "panic");

        let good = engine
            .submit(TaskRequest::new("explode").with_execution_mode(ExecutionMode::CpuIntensive))
            .await
            .unwrap();
        let task = engine.wait_for(&good, WAIT).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_subscriber_does_not_strand_the_task() {
        let engine = engine();
        engine.lifecycle().on(
            LifecycleEventType::TaskStarted,
            EventHandler::sync(|_| panic!("subscriber bug")),
        );
        engine.register_handler("echo", TaskHandler::sync(|input, _| Ok(input)));

        let id = engine
            .submit(TaskRequest::new("echo").with_input("k", json!("v")))
            .await
            .unwrap();
        let task = engine.wait_for(&id, WAIT).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result_data.unwrap()["k"], json!("v"));
        assert_eq!(engine.active_drivers(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_ids_and_unknown_ids() {
        let engine = engine();
        engine.register_handler("noop", TaskHandler::sync(|_, _| Ok(Payload::new())));

        engine
            .submit(TaskRequest::new("noop").with_task_id("fixed"))
            .await
            .unwrap();
        let err = engine
            .submit(TaskRequest::new("noop").with_task_id("fixed"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "already_exists");
        assert!(engine.get_status("never-submitted").await.unwrap().is_none());
        assert!(!engine.cancel("never-submitted").await.unwrap());
        assert!(!engine.retry("never-submitted").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn statistics_and_metrics_reflect_outcomes() {
        let engine = engine();
        engine.register_handler(
            "coin",
            TaskHandler::sync(|input, _| {
                if input["ok"] == json!(true) {
                    Ok(Payload::new())
                } else {
                    Err(HandlerError::fatal("tails", "lost the toss"))
                }
            }),
        );

        let mut ids = Vec::new();
        for ok in [true, true, true, false] {
            ids.push(
                engine
                    .submit(TaskRequest::new("coin").with_input("ok", json!(ok)))
                    .await
                    .unwrap(),
            );
        }
        for id in &ids {
            engine.wait_for(id, WAIT).await.unwrap();
        }

        let stats = engine.get_statistics(None).await.unwrap();
        assert_eq!(stats.total, 4);
        assert!((stats.success_rate - 75.0).abs() < 1e-9);

        let metrics = engine.metrics();
        assert_eq!(metrics.counters.submitted, 4);
        assert_eq!(metrics.counters.completed, 3);
        assert_eq!(metrics.counters.failed, 1);
        assert_eq!(metrics.active_tasks, 0);
    }
}

// ─── Retries ────────────────────────────────────────────────────────────────

mod retries {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn budget_of_two_allows_exactly_two_retries() {
        let engine = engine();
        engine.register_handler(
            "always-fails",
            TaskHandler::sync(|_, _| Err(HandlerError::retryable("flaky", "try again"))),
        );

        let id = engine
            .submit(TaskRequest::new("always-fails").with_max_retries(2))
            .await
            .unwrap();

        for attempt in 1..=2 {
            let task = engine.wait_for(&id, WAIT).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Failed);
            assert!(engine.retry(&id).await.unwrap(), "retry {attempt} refused");
        }

        let task = engine.wait_for(&id, WAIT).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 2);

        assert!(!engine.retry(&id).await.unwrap());
        let task = engine.get_status(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 2);
        assert_eq!(engine.retry_manager().retry_history(&id).len(), 2);
        assert_eq!(engine.metrics().counters.retried, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn retry_passes_through_retrying_and_clears_outcome() {
        let engine = engine();
        let events = record_events(&engine);
        let calls = Arc::new(Mutex::new(0u32));
        let seen = Arc::clone(&calls);
        engine.register_handler(
            "second-time-lucky",
            TaskHandler::sync(move |_, _| {
                let mut n = seen.lock();
                *n += 1;
                if *n == 1 {
                    Err(HandlerError::retryable("io", "eof"))
                } else {
                    Ok(Payload::new())
                }
            }),
        );

        let id = engine
            .submit(TaskRequest::new("second-time-lucky"))
            .await
            .unwrap();
        wait_until(&engine, &id, TaskStatus::Failed).await;
        assert!(engine.retry(&id).await.unwrap());

        let task = engine.wait_for(&id, WAIT).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retry_count, 1);
        assert!(task.error_info.is_none());
        assert_eq!(
            events_for(&events, &id),
            vec![
                LifecycleEventType::TaskCreated,
                LifecycleEventType::TaskStarted,
                LifecycleEventType::TaskFailed,
                LifecycleEventType::TaskRetrying,
                LifecycleEventType::TaskStarted,
                LifecycleEventType::TaskCompleted,
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn completed_tasks_cannot_be_retried() {
        let engine = engine();
        engine.register_handler("noop", TaskHandler::sync(|_, _| Ok(Payload::new())));
        let id = engine.submit(TaskRequest::new("noop")).await.unwrap();
        engine.wait_for(&id, WAIT).await.unwrap();

        assert!(!engine.retry(&id).await.unwrap());
        assert_eq!(
            engine.get_status(&id).await.unwrap().unwrap().retry_count,
            0
        );
    }
}

// ─── Timeouts ───────────────────────────────────────────────────────────────

mod timeouts {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_async_handler_times_out() {
        let engine = engine();
        let events = record_events(&engine);
        engine.register_handler("sleepy", sleeper(30));

        let id = engine
            .submit(TaskRequest::new("sleepy").with_timeout_seconds(1))
            .await
            .unwrap();
        let task = engine.wait_for(&id, WAIT).await.unwrap().unwrap();

        assert_eq!(task.status, TaskStatus::Timeout);
        assert!(task.result_data.is_none());
        let info = task.error_info.unwrap();
        assert_eq!(info["error_type"], "timeout");
        assert_eq!(info["retryable"], true);
        assert!(!events_for(&events, &id).contains(&LifecycleEventType::TaskCompleted));
        assert_eq!(engine.timeouts().statistics().timeouts_total, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pooled_work_is_abandoned_on_timeout() {
        let engine = engine();
        engine.register_handler(
            "grind",
            TaskHandler::sync(|_, _| {
                std::thread::sleep(Duration::from_millis(2500));
                Ok(Payload::new())
            }),
        );

        let id = engine
            .submit(
                TaskRequest::new("grind")
                    .with_timeout_seconds(1)
                    .with_execution_mode(ExecutionMode::CpuIntensive),
            )
            .await
            .unwrap();
        let task = engine.wait_for(&id, WAIT).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Timeout);

        // The worker finishes later; its result must not resurrect the task.
        tokio::time::sleep(Duration::from_millis(2000)).await;
        let task = engine.get_status(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Timeout);
        assert!(task.result_data.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn auto_retry_leaves_timeouts_under_on_failure() {
        let engine = engine_with(EngineConfig {
            auto_retry: true,
            ..EngineConfig::default()
        });
        engine.register_handler("sleepy", sleeper(30));

        let id = engine
            .submit(
                TaskRequest::new("sleepy")
                    .with_timeout_seconds(1)
                    .with_max_retries(1),
            )
            .await
            .unwrap();
        let task = engine.wait_for(&id, WAIT).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Timeout);
        assert_eq!(task.retry_count, 0);
        assert!(!engine.retry(&id).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn auto_retry_retries_timeouts_under_on_timeout() {
        let engine = TaskEngine::builder()
            .config(EngineConfig {
                auto_retry: true,
                ..EngineConfig::default()
            })
            .retry_manager(RetryManager::new(
                RetryConfig::default()
                    .with_strategy(RetryStrategy::Fixed)
                    .with_base_delay(Duration::from_millis(10))
                    .with_jitter(false)
                    .with_condition(RetryCondition::OnTimeout),
            ))
            .handler("sleepy", sleeper(30))
            .build()
            .unwrap();

        let id = engine
            .submit(
                TaskRequest::new("sleepy")
                    .with_timeout_seconds(1)
                    .with_max_retries(1),
            )
            .await
            .unwrap();
        let task = engine.wait_for(&id, WAIT).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Timeout);
        assert_eq!(task.retry_count, 1);
    }
}

// ─── Cancellation ───────────────────────────────────────────────────────────

mod cancellation {
    use super::*;
    use pretty_assertions::assert_eq;

    // Single-threaded so the driver cannot start before `cancel` runs.
    #[tokio::test]
    async fn pending_task_is_cancelled_without_running() {
        let engine = engine();
        let events = record_events(&engine);
        engine.register_handler("sleepy", sleeper(30));

        let id = engine.submit(TaskRequest::new("sleepy")).await.unwrap();
        assert!(engine.cancel(&id).await.unwrap());

        let task = engine.wait_for(&id, WAIT).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.started_at.is_none());
        assert!(task.completed_at.is_some());
        assert_eq!(task.error_info.unwrap()["error_type"], "cancelled");
        assert_eq!(
            events_for(&events, &id),
            vec![
                LifecycleEventType::TaskCreated,
                LifecycleEventType::TaskCancelled,
            ]
        );
        assert!(!engine.cancel(&id).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn running_task_is_cancelled_once() {
        let engine = engine();
        let events = record_events(&engine);
        engine.register_handler("sleepy", sleeper(30));

        let id = engine.submit(TaskRequest::new("sleepy")).await.unwrap();
        wait_until(&engine, &id, TaskStatus::Running).await;

        assert!(engine.cancel(&id).await.unwrap());
        let task = engine.get_status(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        let completed_at = task.completed_at.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let task = engine.get_status(&id).await.unwrap().unwrap();
        assert_eq!(task.completed_at, Some(completed_at));
        let cancelled = events_for(&events, &id)
            .into_iter()
            .filter(|e| *e == LifecycleEventType::TaskCancelled)
            .count();
        assert_eq!(cancelled, 1);
        assert_eq!(engine.active_drivers(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelling_pooled_work_discards_its_result() {
        let engine = engine();
        engine.register_handler(
            "grind",
            TaskHandler::sync(|_, _| {
                std::thread::sleep(Duration::from_millis(500));
                Ok(Payload::new())
            }),
        );

        let id = engine
            .submit(TaskRequest::new("grind").with_execution_mode(ExecutionMode::IoIntensive))
            .await
            .unwrap();
        wait_until(&engine, &id, TaskStatus::Running).await;
        assert!(engine.cancel(&id).await.unwrap());

        tokio::time::sleep(Duration::from_millis(800)).await;
        let task = engine.get_status(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.result_data.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn finished_tasks_are_not_cancellable() {
        let engine = engine();
        engine.register_handler("noop", TaskHandler::sync(|_, _| Ok(Payload::new())));
        let id = engine.submit(TaskRequest::new("noop")).await.unwrap();
        engine.wait_for(&id, WAIT).await.unwrap();

        assert!(!engine.cancel(&id).await.unwrap());
        assert_eq!(
            engine.get_status(&id).await.unwrap().unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn retrying_task_can_be_cancelled_during_backoff() {
        let engine = TaskEngine::builder()
            .retry_manager(RetryManager::new(
                RetryConfig::default()
                    .with_strategy(RetryStrategy::Fixed)
                    .with_base_delay(Duration::from_secs(30))
                    .with_jitter(false),
            ))
            .build()
            .unwrap();
        engine.register_handler(
            "fails",
            TaskHandler::sync(|_, _| Err(HandlerError::retryable("io", "eof"))),
        );

        let id = engine.submit(TaskRequest::new("fails")).await.unwrap();
        engine.wait_for(&id, WAIT).await.unwrap();
        assert!(engine.retry(&id).await.unwrap());
        wait_until(&engine, &id, TaskStatus::Retrying).await;

        assert!(engine.cancel(&id).await.unwrap());
        let task = engine.get_status(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert_eq!(task.retry_count, 1);
        assert!(engine.retry_manager().retry_history(&id).is_empty());
    }
}

// ─── Execution Context ──────────────────────────────────────────────────────

mod context {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn context_is_live_only_while_running() {
        let engine = engine();
        let probe = engine.clone();
        let observed = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&observed);
        engine.register_handler(
            "observe",
            TaskHandler::from_async(move |_input, ctx| {
                let probe = probe.clone();
                let sink = Arc::clone(&sink);
                async move {
                    ctx.set_progress(40.0, Some("halfway"));
                    ctx.info("looked around");
                    *sink.lock() = probe.context(&ctx.task_id());
                    Ok(Payload::new())
                }
            }),
        );

        let id = engine.submit(TaskRequest::new("observe")).await.unwrap();
        let task = engine.wait_for(&id, WAIT).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);

        let seen = observed.lock().clone().expect("context visible while running");
        assert_eq!(seen.task_id, id);
        assert_eq!(seen.progress_percent, 40.0);
        assert_eq!(seen.current_step.as_deref(), Some("halfway"));
        assert_eq!(seen.logs.len(), 1);

        assert!(engine.context(&id).is_none());
        assert_eq!(engine.contexts().active_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn context_is_removed_on_every_exit_path() {
        let engine = engine();
        engine.register_handler(
            "fails",
            TaskHandler::sync(|_, _| Err(HandlerError::fatal("bad", "no"))),
        );
        engine.register_handler(
            "panics",
            TaskHandler::sync(|_, _| panic!("oops")),
        );
        engine.register_handler("sleepy", sleeper(30));

        let failed = engine.submit(TaskRequest::new("fails")).await.unwrap();
        let panicked = engine.submit(TaskRequest::new("panics")).await.unwrap();
        let timed_out = engine
            .submit(TaskRequest::new("sleepy").with_timeout_seconds(1))
            .await
            .unwrap();
        let cancelled = engine.submit(TaskRequest::new("sleepy")).await.unwrap();
        wait_until(&engine, &cancelled, TaskStatus::Running).await;
        engine.cancel(&cancelled).await.unwrap();

        for id in [&failed, &panicked, &timed_out, &cancelled] {
            let task = engine.wait_for(id, WAIT).await.unwrap().unwrap();
            assert!(task.status.is_finished());
            assert!(engine.context(id).is_none(), "{} leaked its context", task.status);
        }
        assert_eq!(engine.contexts().active_count(), 0);
    }
}

// ─── Background Sweeps ──────────────────────────────────────────────────────

mod background {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timeout_loop_catches_orphaned_tasks() {
        let engine = TaskEngine::builder()
            .config(EngineConfig {
                timeout_sweep_interval_secs: 1,
                ..EngineConfig::default()
            })
            .timeout_config(
                taskmill::TimeoutConfig::default().with_default_timeout(Duration::from_secs(1)),
            )
            .build()
            .unwrap();

        let mut orphan = Task::from_request(TaskRequest::new("gone").with_task_id("orphan"));
        orphan.status = TaskStatus::Running;
        orphan.started_at = Some(chrono::Utc::now() - chrono::Duration::minutes(5));
        engine.store().create(orphan).await.unwrap();

        engine.start();
        let task = wait_until(&engine, "orphan", TaskStatus::Timeout).await;
        assert!(task.completed_at.is_some());
        engine.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn orphaned_running_task_can_be_cancelled() {
        let engine = engine();
        let mut orphan = Task::from_request(TaskRequest::new("gone").with_task_id("orphan"));
        orphan.status = TaskStatus::Running;
        orphan.started_at = Some(chrono::Utc::now());
        engine.store().create(orphan).await.unwrap();

        assert!(engine.cancel("orphan").await.unwrap());
        assert_eq!(
            engine.get_status("orphan").await.unwrap().unwrap().status,
            TaskStatus::Cancelled
        );
    }
}

// ─── Sqlite-backed Engine ───────────────────────────────────────────────────

#[cfg(feature = "sqlite")]
mod sqlite_engine {
    use super::*;
    use pretty_assertions::assert_eq;
    use taskmill::store::sqlite::SqliteTaskStore;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runs_tasks_against_sqlite() {
        let engine = TaskEngine::builder()
            .store(Arc::new(SqliteTaskStore::open_in_memory().unwrap()))
            .retry_manager(quick_retries())
            .handler("echo", TaskHandler::sync(|input, _| Ok(input)))
            .build()
            .unwrap();

        let id = engine
            .submit(TaskRequest::new("echo").with_input("k", json!("v")))
            .await
            .unwrap();
        let task = engine.wait_for(&id, WAIT).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result_data.unwrap()["k"], "v");
    }
}
