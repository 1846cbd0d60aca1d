//! Task semantics over any versioned key-value [`StorageBackend`].
//!
//! [`GenericTaskStore`] implements every [`TaskStore`](super::TaskStore)
//! operation (transition validation, conditional writes, filtering,
//! ordering, statistics, retention, transactions, JSON serialization) on top
//! of any [`StorageBackend`] implementation.
//!
//! A backend only moves bytes; every rule about tasks is enforced here.
//!
//! # CAS Semantics
//!
//! Every mutation of an existing task reads the record and its version,
//! checks the caller's expected status, validates the transition, and writes
//! back with [`StorageBackend::put_if_version`]. A version conflict means
//! another writer got there first: the store re-reads and re-checks, so a
//! stale expectation surfaces as [`TaskError::ConcurrentModification`]
//! instead of silently overwriting.
//!
//! # Transactions
//!
//! While a transaction is open, every write records the key's previous
//! bytes in an undo journal. `rollback` replays the journal in reverse;
//! `commit` discards it.
//!
//! There is one journal per store, so a transaction is not isolated from
//! other writers: their writes are journaled too and a rollback undoes them.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::domain::{StatusUpdate, Task};
use crate::error::TaskError;
use crate::store::backend::{make_key, StorageBackend, StorageError, TASK_KEY_PREFIX};
use crate::store::{ListOptions, OrderBy, TaskPage, TaskStatistics, TimeRange};
use crate::types::task::TaskStatus;

/// Attempts made before a persistent version conflict is reported.
const MAX_CAS_ATTEMPTS: usize = 5;

#[derive(Debug)]
struct UndoEntry {
    key: String,
    previous: Option<Vec<u8>>,
}

/// [`TaskStore`](super::TaskStore) implementation parameterized by its backend.
///
/// # Type Parameters
///
/// * `B` - A [`StorageBackend`] implementation.
///
/// # Examples
///
/// ```
/// use taskmill::store::generic::GenericTaskStore;
/// use taskmill::store::memory::InMemoryBackend;
///
/// let store = GenericTaskStore::new(InMemoryBackend::new());
/// assert!(!store.in_transaction());
/// ```
#[derive(Debug)]
pub struct GenericTaskStore<B: StorageBackend> {
    backend: B,
    journal: Mutex<Option<Vec<UndoEntry>>>,
}

impl<B: StorageBackend> GenericTaskStore<B> {
    /// Creates a new generic task store backed by the given backend.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            journal: Mutex::new(None),
        }
    }

    /// Returns a reference to the underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns `true` while a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.journal.lock().is_some()
    }

    // ---- Serialization helpers (private) ----

    fn serialize_task(task: &Task) -> Result<Vec<u8>, TaskError> {
        serde_json::to_vec(task)
            .map_err(|e| TaskError::Storage(format!("failed to serialize Task: {e}")))
    }

    fn deserialize_task(data: &[u8]) -> Result<Task, TaskError> {
        serde_json::from_slice(data)
            .map_err(|e| TaskError::Storage(format!("failed to deserialize Task: {e}")))
    }

    fn map_storage_error(err: StorageError, task_id: &str) -> TaskError {
        match err {
            StorageError::NotFound { .. } => TaskError::not_found(task_id),
            StorageError::AlreadyExists { .. } => TaskError::AlreadyExists {
                task_id: task_id.to_string(),
            },
            StorageError::VersionConflict {
                expected, actual, ..
            } => TaskError::ConcurrentModification {
                task_id: task_id.to_string(),
                expected: format!("version {expected}"),
                actual: format!("version {actual}"),
            },
            StorageError::Backend { message, .. } => TaskError::Storage(message),
        }
    }

    fn record_undo(&self, key: &str, previous: Option<Vec<u8>>) {
        if let Some(journal) = self.journal.lock().as_mut() {
            journal.push(UndoEntry {
                key: key.to_string(),
                previous,
            });
        }
    }

    async fn load_all(&self) -> Result<Vec<Task>, TaskError> {
        let records = self
            .backend
            .list_by_prefix(TASK_KEY_PREFIX)
            .await
            .map_err(|e| Self::map_storage_error(e, ""))?;
        records
            .iter()
            .map(|(_, record)| Self::deserialize_task(&record.data))
            .collect()
    }

    /// Read-check-mutate-CAS loop shared by every single-task mutation.
    async fn mutate<F>(&self, task_id: &str, mut apply: F) -> Result<Task, TaskError>
    where
        F: FnMut(&mut Task) -> Result<(), TaskError> + Send,
    {
        let key = make_key(task_id);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let versioned = self
                .backend
                .get(&key)
                .await
                .map_err(|e| Self::map_storage_error(e, task_id))?;
            let mut task = Self::deserialize_task(&versioned.data)?;
            apply(&mut task)?;

            let bytes = Self::serialize_task(&task)?;
            match self
                .backend
                .put_if_version(&key, &bytes, versioned.version)
                .await
            {
                Ok(_) => {
                    self.record_undo(&key, Some(versioned.data));
                    return Ok(task);
                },
                Err(StorageError::VersionConflict { .. }) if attempt < MAX_CAS_ATTEMPTS => {
                    tracing::debug!(task_id, attempt, "version conflict, re-reading task");
                },
                Err(e) => return Err(Self::map_storage_error(e, task_id)),
            }
        }
    }

    // ---- Domain operations (public) ----

    /// Persists a new task. Fails with `AlreadyExists` on a duplicate id.
    pub async fn create(&self, task: Task) -> Result<Task, TaskError> {
        let key = make_key(&task.task_id);
        let bytes = Self::serialize_task(&task)?;
        self.backend
            .put_if_absent(&key, &bytes)
            .await
            .map_err(|e| Self::map_storage_error(e, &task.task_id))?;
        self.record_undo(&key, None);
        tracing::debug!(task_id = %task.task_id, task_type = %task.task_type, "task created");
        Ok(task)
    }

    /// Fetches a task, returning `None` when the id is unknown.
    pub async fn get(&self, task_id: &str) -> Result<Option<Task>, TaskError> {
        match self.backend.get(&make_key(task_id)).await {
            Ok(versioned) => Self::deserialize_task(&versioned.data).map(Some),
            Err(StorageError::NotFound { .. }) => Ok(None),
            Err(e) => Err(Self::map_storage_error(e, task_id)),
        }
    }

    /// Applies a conditional status transition.
    pub async fn update_status(
        &self,
        task_id: &str,
        update: StatusUpdate,
    ) -> Result<Task, TaskError> {
        let now = Utc::now();
        self.mutate(task_id, |task| {
            if let Some(expected) = update.expected {
                if task.status != expected {
                    return Err(TaskError::ConcurrentModification {
                        task_id: task_id.to_string(),
                        expected: expected.to_string(),
                        actual: task.status.to_string(),
                    });
                }
            }
            task.status.validate_transition(task_id, &update.status)?;

            task.status = update.status;
            task.stamp_for(update.status, now);
            if let Some(result) = &update.result_data {
                task.result_data = Some(result.clone());
            }
            if let Some(error) = &update.error_info {
                task.error_info = Some(error.clone());
            }
            Ok(())
        })
        .await
    }

    /// Moves a `Failed`/`Timeout` task into `Retrying` and resets it for a
    /// new attempt.
    pub async fn update_retry(
        &self,
        task_id: &str,
        expected: TaskStatus,
    ) -> Result<Task, TaskError> {
        self.mutate(task_id, |task| {
            if task.status != expected {
                return Err(TaskError::ConcurrentModification {
                    task_id: task_id.to_string(),
                    expected: expected.to_string(),
                    actual: task.status.to_string(),
                });
            }
            if task.retry_count >= task.max_retries {
                return Err(TaskError::validation(format!(
                    "task {task_id} exhausted its retry budget ({} of {})",
                    task.retry_count, task.max_retries
                )));
            }
            task.status
                .validate_transition(task_id, &TaskStatus::Retrying)?;
            task.status = TaskStatus::Retrying;
            task.reset_for_retry();
            Ok(())
        })
        .await
    }

    /// Lists tasks matching the filter, ordered and windowed.
    pub async fn list(&self, options: ListOptions) -> Result<TaskPage, TaskError> {
        let mut tasks: Vec<Task> = self
            .load_all()
            .await?
            .into_iter()
            .filter(|task| options.filter.matches(task))
            .collect();

        tasks.sort_by(|a, b| {
            let primary = match options.order_by {
                OrderBy::CreatedAt => a.created_at.cmp(&b.created_at),
                OrderBy::Priority => a.priority.cmp(&b.priority),
                OrderBy::Status => a.status.as_str().cmp(b.status.as_str()),
            };
            let ordered = primary.then_with(|| a.task_id.cmp(&b.task_id));
            if options.descending {
                ordered.reverse()
            } else {
                ordered
            }
        });

        let total = tasks.len();
        let items = tasks
            .into_iter()
            .skip(options.offset)
            .take(options.effective_limit())
            .collect();
        Ok(TaskPage { items, total })
    }

    /// Pending tasks by priority descending, then creation ascending.
    pub async fn get_pending(&self, limit: usize) -> Result<Vec<Task>, TaskError> {
        let mut pending: Vec<Task> = self
            .load_all()
            .await?
            .into_iter()
            .filter(|task| task.status == TaskStatus::Pending)
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    /// Every running task.
    pub async fn get_running(&self) -> Result<Vec<Task>, TaskError> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|task| task.status == TaskStatus::Running)
            .collect())
    }

    /// Running tasks that started before `started_before`.
    pub async fn get_timeout_candidates(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Task>, TaskError> {
        Ok(self
            .get_running()
            .await?
            .into_iter()
            .filter(|task| task.started_at.is_some_and(|at| at < started_before))
            .collect())
    }

    /// Aggregate statistics, optionally windowed by creation time.
    pub async fn get_statistics(
        &self,
        range: Option<TimeRange>,
    ) -> Result<TaskStatistics, TaskError> {
        let tasks = self.load_all().await?;
        let in_range = tasks
            .iter()
            .filter(|task| range.is_none_or(|r| r.contains(task.created_at)));
        Ok(TaskStatistics::from_tasks(in_range, Utc::now()))
    }

    /// Deletes a task.
    pub async fn delete(&self, task_id: &str) -> Result<bool, TaskError> {
        let key = make_key(task_id);
        let previous = match self.backend.get(&key).await {
            Ok(versioned) => versioned.data,
            Err(StorageError::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(Self::map_storage_error(e, task_id)),
        };
        let existed = self
            .backend
            .delete(&key)
            .await
            .map_err(|e| Self::map_storage_error(e, task_id))?;
        if existed {
            self.record_undo(&key, Some(previous));
        }
        Ok(existed)
    }

    /// Deletes tasks in `statuses` created before `older_than`.
    pub async fn delete_old(
        &self,
        older_than: DateTime<Utc>,
        statuses: &[TaskStatus],
    ) -> Result<usize, TaskError> {
        let stale: Vec<String> = self
            .load_all()
            .await?
            .into_iter()
            .filter(|task| task.created_at < older_than && statuses.contains(&task.status))
            .map(|task| task.task_id)
            .collect();

        let mut deleted = 0;
        for task_id in &stale {
            if self.delete(task_id).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Transitions each listed task, skipping missing ids and illegal moves.
    pub async fn bulk_update_status(
        &self,
        task_ids: &[String],
        status: TaskStatus,
    ) -> Result<usize, TaskError> {
        let mut updated = 0;
        for task_id in task_ids {
            match self.update_status(task_id, StatusUpdate::to(status)).await {
                Ok(_) => updated += 1,
                Err(
                    e @ (TaskError::NotFound { .. }
                    | TaskError::InvalidTransition { .. }
                    | TaskError::ConcurrentModification { .. }),
                ) => {
                    tracing::debug!(task_id = %task_id, error = %e, "bulk update skipped task");
                },
                Err(e) => return Err(e),
            }
        }
        Ok(updated)
    }

    /// Pings the backend.
    pub async fn health_check(&self) -> Result<bool, TaskError> {
        match self.backend.ping().await {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!(error = %e, "storage health check failed");
                Ok(false)
            },
        }
    }

    /// Opens a transaction.
    pub fn begin_transaction(&self) -> Result<(), TaskError> {
        let mut journal = self.journal.lock();
        if journal.is_some() {
            return Err(TaskError::Transaction(
                "a transaction is already open".to_string(),
            ));
        }
        *journal = Some(Vec::new());
        Ok(())
    }

    /// Commits the open transaction.
    pub fn commit(&self) -> Result<(), TaskError> {
        self.journal
            .lock()
            .take()
            .map(|_| ())
            .ok_or_else(|| TaskError::Transaction("no transaction is open".to_string()))
    }

    /// Undoes every write made since `begin_transaction`.
    pub async fn rollback(&self) -> Result<(), TaskError> {
        let entries = self
            .journal
            .lock()
            .take()
            .ok_or_else(|| TaskError::Transaction("no transaction is open".to_string()))?;

        for entry in entries.into_iter().rev() {
            let restored = match &entry.previous {
                Some(data) => self.backend.put(&entry.key, data).await.map(|_| ()),
                None => self.backend.delete(&entry.key).await.map(|_| ()),
            };
            restored.map_err(|e| TaskError::Transaction(format!("rollback failed: {e}")))?;
        }
        tracing::debug!("transaction rolled back");
        Ok(())
    }
}
