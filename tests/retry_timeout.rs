//! Retry backoff and timeout policy tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taskmill::retry::{RetryCondition, RetryConfig, RetryManager, RetryStrategy};
use taskmill::timeout::{TimeoutConfig, TimeoutManager};
use taskmill::{HandlerError, Task, TaskRequest, TaskStatus, TaskType};
use tokio_util::sync::CancellationToken;

fn failed(task_type: TaskType, retry_count: u32, max_retries: u32) -> Task {
    let mut task = Task::from_request(TaskRequest::new(task_type).with_max_retries(max_retries));
    task.status = TaskStatus::Failed;
    task.retry_count = retry_count;
    task
}

// ─── Backoff ────────────────────────────────────────────────────────────────

mod backoff {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn exponential_doubles_from_base() {
        let config = RetryConfig::default()
            .with_strategy(RetryStrategy::Exponential)
            .with_base_delay(Duration::from_secs(1))
            .with_jitter(false);
        assert_eq!(config.delay_for(0), Duration::from_secs(1));
        assert_eq!(config.delay_for(3), Duration::from_secs(8));
    }

    #[test]
    fn linear_grows_by_base() {
        let config = RetryConfig::default()
            .with_strategy(RetryStrategy::Linear)
            .with_base_delay(Duration::from_secs(3))
            .with_jitter(false);
        assert_eq!(config.delay_for(2), Duration::from_secs(9));
    }

    #[test]
    fn custom_strategy_is_still_capped() {
        let config = RetryConfig::default()
            .with_strategy(RetryStrategy::Custom(Arc::new(|n: u32| {
                Duration::from_secs(u64::from(n) * 100)
            })))
            .with_max_delay(Duration::from_secs(150))
            .with_jitter(false);
        assert_eq!(config.delay_for(1), Duration::from_secs(100));
        assert_eq!(config.delay_for(2), Duration::from_secs(150));
    }

    #[test]
    fn every_delay_respects_max_delay() {
        let max = Duration::from_secs(20);
        for strategy in [
            RetryStrategy::Fixed,
            RetryStrategy::Exponential,
            RetryStrategy::Linear,
        ] {
            let config = RetryConfig::default()
                .with_strategy(strategy)
                .with_base_delay(Duration::from_secs(7))
                .with_max_delay(max);
            for n in 0..40 {
                assert!(config.delay_for(n) <= max, "retry {n} exceeded max");
            }
        }
    }

    #[test]
    fn manager_uses_type_policy() {
        let manager = RetryManager::with_builtin_defaults();
        let report = failed(TaskType::ReportGeneration, 0, 2);
        assert_eq!(
            manager.config_for(&TaskType::ReportGeneration).base_delay,
            Duration::from_secs(5)
        );
        assert!(manager.calculate_delay(&report) <= Duration::from_secs(300));
        assert!(manager.type_config(&TaskType::Custom("x".into())).is_none());
    }
}

// ─── Eligibility ────────────────────────────────────────────────────────────

mod eligibility {
    use super::*;

    #[test]
    fn budget_is_the_tasks_own() {
        let manager = RetryManager::default();
        assert!(manager.should_retry(&failed(TaskType::DocumentAnalysis, 1, 2), None));
        assert!(!manager.should_retry(&failed(TaskType::DocumentAnalysis, 2, 2), None));
    }

    #[test]
    fn only_failures_are_eligible() {
        let manager = RetryManager::default();
        let mut task = failed(TaskType::DocumentAnalysis, 0, 3);
        for status in [TaskStatus::Completed, TaskStatus::Running, TaskStatus::Cancelled] {
            task.status = status;
            assert!(!manager.should_retry(&task, None), "{status}");
        }
        task.status = TaskStatus::Timeout;
        assert!(!manager.should_retry(&task, None));

        let on_timeout =
            RetryManager::new(RetryConfig::default().with_condition(RetryCondition::OnTimeout));
        assert!(on_timeout.should_retry(&task, None));
    }

    #[test]
    fn on_failure_skips_fatal_errors() {
        let manager = RetryManager::default();
        let task = failed(TaskType::DocumentAnalysis, 0, 3);
        assert!(!manager.should_retry(&task, Some(&HandlerError::fatal("parse", "bad"))));
        assert!(manager.should_retry(&task, Some(&HandlerError::retryable("io", "eof"))));
    }

    #[test]
    fn stored_error_info_is_consulted() {
        let manager = RetryManager::default();
        let mut task = failed(TaskType::DocumentAnalysis, 0, 3);
        task.error_info = Some(HandlerError::fatal("parse", "bad").to_error_info(0));
        assert!(!manager.should_retry(&task, None));
    }

    #[test]
    fn specific_errors_only() {
        let manager = RetryManager::new(
            RetryConfig::default()
                .with_condition(RetryCondition::OnSpecificError)
                .with_retryable_error("connection"),
        );
        let task = failed(TaskType::TestExecution, 0, 3);
        assert!(manager.should_retry(
            &task,
            Some(&HandlerError::fatal("connection", "refused"))
        ));
        assert!(!manager.should_retry(&task, Some(&HandlerError::retryable("io", "eof"))));
    }

    #[test]
    fn never_and_no_retry() {
        let manager = RetryManager::new(RetryConfig::no_retry());
        assert!(!manager.should_retry(&failed(TaskType::TestExecution, 0, 3), None));
    }
}

// ─── Timeouts ───────────────────────────────────────────────────────────────

mod timeouts {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn resolution_order() {
        let manager = TimeoutManager::new(
            TimeoutConfig::default()
                .with_default_timeout(Duration::from_secs(100))
                .with_type_timeout(TaskType::TestExecution, Duration::from_secs(40)),
        );

        let plain = Task::from_request(TaskRequest::new(TaskType::DocumentAnalysis));
        let typed = Task::from_request(TaskRequest::new(TaskType::TestExecution));
        let pinned = Task::from_request(
            TaskRequest::new(TaskType::TestExecution).with_timeout_seconds(5),
        );
        assert_eq!(manager.get_timeout_for_task(&plain), Duration::from_secs(100));
        assert_eq!(manager.get_timeout_for_task(&typed), Duration::from_secs(40));
        assert_eq!(manager.get_timeout_for_task(&pinned), Duration::from_secs(5));
    }

    #[test]
    fn presets() {
        let fast = TimeoutConfig::fast();
        assert_eq!(fast.default_timeout, Duration::from_secs(60));
        assert_eq!(
            fast.type_timeouts[&TaskType::TestExecution],
            Duration::from_secs(120)
        );
        assert_eq!(
            TimeoutConfig::long_running().type_timeouts[&TaskType::TestExecution],
            Duration::from_secs(3600)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_operation_times_out_and_fires_callbacks() {
        let manager = TimeoutManager::new(TimeoutConfig::default().with_soft_timeout(0.5));
        let soft = Arc::new(AtomicUsize::new(0));
        let hard = Arc::new(AtomicUsize::new(0));
        let (s, h) = (Arc::clone(&soft), Arc::clone(&hard));
        manager.on_soft_timeout(move |_, _| {
            s.fetch_add(1, Ordering::SeqCst);
        });
        manager.on_timeout(move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let err = manager
            .execute_with_timeout(
                "slow",
                Duration::from_secs(10),
                CancellationToken::new(),
                tokio::time::sleep(Duration::from_secs(60)),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "timeout");
        assert_eq!(soft.load(Ordering::SeqCst), 1);
        assert_eq!(hard.load(Ordering::SeqCst), 1);
        assert!(manager.running_tasks().is_empty());
        assert_eq!(manager.statistics().timeouts_total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fast_operation_returns_value() {
        let manager = TimeoutManager::default();
        let value = manager
            .execute_with_timeout("quick", Duration::from_secs(10), CancellationToken::new(), async {
                42
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(manager.statistics().timeouts_total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins_over_the_deadline() {
        let manager = TimeoutManager::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = manager
            .execute_with_timeout(
                "c",
                Duration::from_secs(10),
                cancel,
                tokio::time::sleep(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "cancelled");
    }
}
