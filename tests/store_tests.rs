//! Integration tests for the task stores.
//!
//! Every contract check is written against `Arc<dyn TaskStore>` and run
//! for the in-memory store, and for the sqlite store when the `sqlite`
//! feature is enabled.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use taskmill::store::memory::InMemoryTaskStore;
use taskmill::store::{ListOptions, OrderBy, TaskStore, TimeRange};
use taskmill::{StatusUpdate, Task, TaskError, TaskPriority, TaskRequest, TaskStatus, TaskType};

fn memory_store() -> Arc<dyn TaskStore> {
    Arc::new(InMemoryTaskStore::default())
}

#[cfg(feature = "sqlite")]
fn sqlite_store() -> Arc<dyn TaskStore> {
    Arc::new(taskmill::store::sqlite::SqliteTaskStore::open_in_memory().unwrap())
}

/// Ten pending tasks `t00`..`t09`, one second apart.
async fn seed_pending(store: &Arc<dyn TaskStore>) {
    let base = Utc::now() - ChronoDuration::minutes(10);
    for i in 0..10 {
        let mut task = Task::from_request(
            TaskRequest::new(TaskType::DocumentAnalysis).with_task_id(format!("t{i:02}")),
        );
        task.created_at = base + ChronoDuration::seconds(i);
        store.create(task).await.unwrap();
    }
}

async fn drive_to(store: &Arc<dyn TaskStore>, task_id: &str, path: &[TaskStatus]) -> Task {
    let mut last = None;
    for status in path {
        last = Some(
            store
                .update_status(task_id, StatusUpdate::to(*status))
                .await
                .unwrap(),
        );
    }
    last.unwrap()
}

// ─── Contract ───────────────────────────────────────────────────────────────

mod contract {
    use super::*;
    use pretty_assertions::assert_eq;

    pub(super) async fn duplicate_and_missing(store: Arc<dyn TaskStore>) {
        let task = Task::from_request(TaskRequest::new(TaskType::TestGeneration).with_task_id("dup"));
        store.create(task.clone()).await.unwrap();

        let err = store.create(task).await.unwrap_err();
        assert!(matches!(err, TaskError::AlreadyExists { ref task_id } if task_id == "dup"));
        assert!(store.get("nobody").await.unwrap().is_none());
    }

    pub(super) async fn list_windows_and_totals(store: Arc<dyn TaskStore>) {
        seed_pending(&store).await;

        let page = store
            .list(ListOptions::default().with_window(3, 3).ordered_by(OrderBy::CreatedAt, false))
            .await
            .unwrap();
        let ids: Vec<&str> = page.items.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["t03", "t04", "t05"]);
        assert_eq!(page.total, 10);

        let past_end = store
            .list(ListOptions::default().with_window(5, 50))
            .await
            .unwrap();
        assert!(past_end.items.is_empty());
        assert_eq!(past_end.total, 10);
    }

    pub(super) async fn list_filters_by_status(store: Arc<dyn TaskStore>) {
        seed_pending(&store).await;
        for id in ["t01", "t04"] {
            drive_to(&store, id, &[TaskStatus::Running, TaskStatus::Completed]).await;
        }
        drive_to(&store, "t07", &[TaskStatus::Running, TaskStatus::Failed]).await;

        let done = store
            .list(ListOptions::default().with_status(TaskStatus::Completed))
            .await
            .unwrap();
        assert_eq!(done.total, 2);
        assert!(done.items.iter().all(|t| t.status == TaskStatus::Completed));

        let pending = store
            .list(ListOptions::default().with_status(TaskStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.total, 7);
    }

    pub(super) async fn pending_queue_order(store: Arc<dyn TaskStore>) {
        let base = Utc::now() - ChronoDuration::minutes(1);
        for (i, (id, priority)) in [
            ("low", TaskPriority::Low),
            ("urgent-late", TaskPriority::Urgent),
            ("normal", TaskPriority::Normal),
            ("urgent-early", TaskPriority::Urgent),
        ]
        .into_iter()
        .enumerate()
        {
            let mut task = Task::from_request(
                TaskRequest::new(TaskType::ReportGeneration)
                    .with_task_id(id)
                    .with_priority(priority),
            );
            // urgent-early is created before urgent-late
            task.created_at = match id {
                "urgent-early" => base,
                _ => base + ChronoDuration::seconds(i as i64 + 1),
            };
            store.create(task).await.unwrap();
        }

        let ids: Vec<String> = store
            .get_pending(10)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.task_id)
            .collect();
        assert_eq!(ids, vec!["urgent-early", "urgent-late", "normal", "low"]);
        assert_eq!(store.get_pending(1).await.unwrap().len(), 1);
    }

    pub(super) async fn conditional_writes(store: Arc<dyn TaskStore>) {
        store
            .create(Task::from_request(TaskRequest::new(TaskType::TestExecution).with_task_id("c")))
            .await
            .unwrap();

        let running = store
            .update_status(
                "c",
                StatusUpdate::to(TaskStatus::Running).expecting(TaskStatus::Pending),
            )
            .await
            .unwrap();
        assert!(running.started_at.is_some());

        let stale = store
            .update_status(
                "c",
                StatusUpdate::to(TaskStatus::Cancelled).expecting(TaskStatus::Pending),
            )
            .await
            .unwrap_err();
        assert_eq!(stale.kind(), "concurrent_modification");

        let illegal = store
            .update_status("c", StatusUpdate::to(TaskStatus::Pending))
            .await
            .unwrap_err();
        assert_eq!(illegal.kind(), "invalid_transition");

        let mut result = taskmill::Payload::new();
        result.insert("passed".into(), json!(12));
        let done = store
            .update_status("c", StatusUpdate::to(TaskStatus::Completed).with_result(result))
            .await
            .unwrap();
        assert_eq!(done.result_data.unwrap()["passed"], 12);
        assert!(done.completed_at.is_some());
        assert!(done.error_info.is_none());

        let missing = store
            .update_status("ghost", StatusUpdate::to(TaskStatus::Running))
            .await
            .unwrap_err();
        assert_eq!(missing.kind(), "not_found");
    }

    pub(super) async fn retry_reset(store: Arc<dyn TaskStore>) {
        let task = Task::from_request(
            TaskRequest::new(TaskType::TestExecution)
                .with_task_id("r")
                .with_max_retries(1),
        );
        store.create(task).await.unwrap();
        drive_to(&store, "r", &[TaskStatus::Running, TaskStatus::Timeout]).await;

        let retrying = store.update_retry("r", TaskStatus::Timeout).await.unwrap();
        assert_eq!(retrying.status, TaskStatus::Retrying);
        assert_eq!(retrying.retry_count, 1);
        assert!(retrying.started_at.is_none());
        assert!(retrying.completed_at.is_none());
        assert!(retrying.error_info.is_none());

        drive_to(&store, "r", &[TaskStatus::Running, TaskStatus::Failed]).await;
        let exhausted = store.update_retry("r", TaskStatus::Failed).await.unwrap_err();
        assert_eq!(exhausted.kind(), "validation");
        assert_eq!(
            store.get("r").await.unwrap().unwrap().status,
            TaskStatus::Failed
        );
    }

    pub(super) async fn statistics_and_retention(store: Arc<dyn TaskStore>) {
        seed_pending(&store).await;
        drive_to(&store, "t00", &[TaskStatus::Running, TaskStatus::Completed]).await;
        drive_to(&store, "t01", &[TaskStatus::Running, TaskStatus::Completed]).await;
        drive_to(&store, "t02", &[TaskStatus::Running, TaskStatus::Completed]).await;
        drive_to(&store, "t03", &[TaskStatus::Running, TaskStatus::Failed]).await;
        drive_to(&store, "t04", &[TaskStatus::Cancelled]).await;

        let stats = store.get_statistics(None).await.unwrap();
        assert_eq!(stats.total, 10);
        assert_eq!(stats.by_status["completed"], 3);
        assert_eq!(stats.by_status["pending"], 5);
        assert_eq!(stats.by_type["document_analysis"], 10);
        assert!((stats.success_rate - 75.0).abs() < 1e-9);
        assert_eq!(stats.recent.last_hour, 10);

        let empty_window = TimeRange {
            start: Utc::now() - ChronoDuration::days(30),
            end: Utc::now() - ChronoDuration::days(20),
        };
        assert_eq!(store.get_statistics(Some(empty_window)).await.unwrap().total, 0);

        let deleted = store
            .delete_old(
                Utc::now(),
                &[TaskStatus::Completed, TaskStatus::Cancelled],
            )
            .await
            .unwrap();
        assert_eq!(deleted, 4);
        assert_eq!(store.list(ListOptions::default()).await.unwrap().total, 6);
        assert!(store.delete("t09").await.unwrap());
        assert!(!store.delete("t09").await.unwrap());
    }

    pub(super) async fn timeout_candidates(store: Arc<dyn TaskStore>) {
        seed_pending(&store).await;
        drive_to(&store, "t00", &[TaskStatus::Running]).await;
        drive_to(&store, "t01", &[TaskStatus::Running, TaskStatus::Completed]).await;

        let later = Utc::now() + ChronoDuration::seconds(1);
        let candidates = store.get_timeout_candidates(later).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].task_id, "t00");

        let earlier = Utc::now() - ChronoDuration::hours(1);
        assert!(store.get_timeout_candidates(earlier).await.unwrap().is_empty());
        assert_eq!(store.get_running().await.unwrap().len(), 1);
    }

    pub(super) async fn bulk_updates(store: Arc<dyn TaskStore>) {
        seed_pending(&store).await;
        drive_to(&store, "t02", &[TaskStatus::Running, TaskStatus::Completed]).await;

        let ids: Vec<String> = ["t00", "t01", "t02", "ghost"]
            .into_iter()
            .map(String::from)
            .collect();
        let updated = store
            .bulk_update_status(&ids, TaskStatus::Cancelled)
            .await
            .unwrap();
        assert_eq!(updated, 2);
        assert_eq!(
            store.get("t02").await.unwrap().unwrap().status,
            TaskStatus::Completed
        );
    }

    pub(super) async fn transactions(store: Arc<dyn TaskStore>) {
        assert!(store.health_check().await.unwrap());
        store.begin_transaction().await.unwrap();
        assert_eq!(store.begin_transaction().await.unwrap_err().kind(), "transaction");

        store
            .create(Task::from_request(TaskRequest::new(TaskType::TestExecution).with_task_id("tx")))
            .await
            .unwrap();
        store.rollback().await.unwrap();
        assert!(store.get("tx").await.unwrap().is_none());

        assert_eq!(store.commit().await.unwrap_err().kind(), "transaction");
        store.begin_transaction().await.unwrap();
        store
            .create(Task::from_request(TaskRequest::new(TaskType::TestExecution).with_task_id("tx")))
            .await
            .unwrap();
        store.commit().await.unwrap();
        assert!(store.get("tx").await.unwrap().is_some());
    }
}

// ─── In-Memory ──────────────────────────────────────────────────────────────

mod memory {
    use super::*;

    #[tokio::test]
    async fn duplicate_and_missing() {
        contract::duplicate_and_missing(memory_store()).await;
    }

    #[tokio::test]
    async fn list_windows_and_totals() {
        contract::list_windows_and_totals(memory_store()).await;
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        contract::list_filters_by_status(memory_store()).await;
    }

    #[tokio::test]
    async fn pending_queue_order() {
        contract::pending_queue_order(memory_store()).await;
    }

    #[tokio::test]
    async fn conditional_writes() {
        contract::conditional_writes(memory_store()).await;
    }

    #[tokio::test]
    async fn retry_reset() {
        contract::retry_reset(memory_store()).await;
    }

    #[tokio::test]
    async fn statistics_and_retention() {
        contract::statistics_and_retention(memory_store()).await;
    }

    #[tokio::test]
    async fn timeout_candidates() {
        contract::timeout_candidates(memory_store()).await;
    }

    #[tokio::test]
    async fn bulk_updates() {
        contract::bulk_updates(memory_store()).await;
    }

    #[tokio::test]
    async fn transactions() {
        contract::transactions(memory_store()).await;
    }
}

// ─── Sqlite ─────────────────────────────────────────────────────────────────

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;

    #[tokio::test]
    async fn duplicate_and_missing() {
        contract::duplicate_and_missing(sqlite_store()).await;
    }

    #[tokio::test]
    async fn list_windows_and_totals() {
        contract::list_windows_and_totals(sqlite_store()).await;
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        contract::list_filters_by_status(sqlite_store()).await;
    }

    #[tokio::test]
    async fn pending_queue_order() {
        contract::pending_queue_order(sqlite_store()).await;
    }

    #[tokio::test]
    async fn conditional_writes() {
        contract::conditional_writes(sqlite_store()).await;
    }

    #[tokio::test]
    async fn retry_reset() {
        contract::retry_reset(sqlite_store()).await;
    }

    #[tokio::test]
    async fn statistics_and_retention() {
        contract::statistics_and_retention(sqlite_store()).await;
    }

    #[tokio::test]
    async fn timeout_candidates() {
        contract::timeout_candidates(sqlite_store()).await;
    }

    #[tokio::test]
    async fn bulk_updates() {
        contract::bulk_updates(sqlite_store()).await;
    }

    #[tokio::test]
    async fn transactions() {
        contract::transactions(sqlite_store()).await;
    }

    #[tokio::test]
    async fn survives_reopen() {
        use taskmill::store::sqlite::{SqliteConfig, SqliteTaskStore};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        {
            let store = SqliteTaskStore::open(SqliteConfig::with_path(&path)).unwrap();
            store
                .create(Task::from_request(
                    TaskRequest::new(TaskType::ReportGeneration)
                        .with_task_id("kept")
                        .with_input("pages", json!(4)),
                ))
                .await
                .unwrap();
        }
        let store = SqliteTaskStore::open(SqliteConfig::with_path(&path)).unwrap();
        let task = store.get("kept").await.unwrap().unwrap();
        assert_eq!(task.input_data["pages"], 4);
        assert_eq!(task.task_type, TaskType::ReportGeneration);
    }
}
