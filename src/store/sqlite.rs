//! SQLite task store.
//!
//! [`SqliteTaskStore`] implements [`TaskStore`] directly in SQL over a single
//! shared connection. Blocking database calls run on tokio's blocking pool.
//!
//! Single-task writes are guarded with `UPDATE ... WHERE id = ? AND status = ?`,
//! so a writer holding a stale view of the task changes zero rows and gets
//! [`TaskError::ConcurrentModification`], even when several processes share
//! the database file.
//!
//! Transactions run on the shared connection, so every write issued while
//! one is open joins it and is undone by a rollback, whoever made it.
//!
//! Timestamps are stored as fixed-width RFC 3339 strings (microsecond
//! precision, `Z` suffix) so that lexicographic comparison in SQL matches
//! chronological order.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OpenFlags, OptionalExtension};

use crate::domain::{Payload, StatusUpdate, Task};
use crate::error::TaskError;
use crate::store::{
    success_rate, ListOptions, OrderBy, RecentActivity, TaskPage, TaskStatistics, TaskStore,
    TimeRange,
};
use crate::types::task::{ExecutionMode, TaskPriority, TaskStatus};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id              TEXT PRIMARY KEY,
    task_type       TEXT NOT NULL,
    status          TEXT NOT NULL,
    priority        INTEGER NOT NULL,
    execution_mode  TEXT,
    created_at      TEXT NOT NULL,
    started_at      TEXT,
    completed_at    TEXT,
    input_data      TEXT NOT NULL,
    result_data     TEXT,
    error_info      TEXT,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    max_retries     INTEGER NOT NULL,
    timeout_seconds INTEGER NOT NULL,
    metadata        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_pending ON tasks(status, priority DESC, created_at ASC);
CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at);
";

const COLUMNS: &str = "id, task_type, status, priority, execution_mode, created_at, started_at, \
     completed_at, input_data, result_data, error_info, retry_count, max_retries, \
     timeout_seconds, metadata";

impl From<rusqlite::Error> for TaskError {
    fn from(err: rusqlite::Error) -> Self {
        TaskError::Storage(format!("sqlite: {err}"))
    }
}

/// Connection settings for [`SqliteTaskStore`].
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database file path, or `:memory:`.
    pub path: PathBuf,
    /// Enable WAL journaling.
    pub wal_mode: bool,
    /// How long SQLite waits on a locked database before failing.
    pub busy_timeout: Duration,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("taskmill.db"),
            wal_mode: true,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl SqliteConfig {
    /// Config for a private in-memory database.
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::from(":memory:"),
            // WAL not supported for in-memory
            wal_mode: false,
            ..Self::default()
        }
    }

    /// Config for a database file at `path`.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// Relational [`TaskStore`] backed by SQLite.
///
/// # Examples
///
/// ```
/// use taskmill::store::sqlite::SqliteTaskStore;
///
/// let store = SqliteTaskStore::open_in_memory().unwrap();
/// assert_eq!(store.path().to_str(), Some(":memory:"));
/// ```
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
    config: SqliteConfig,
}

impl fmt::Debug for SqliteTaskStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteTaskStore")
            .field("path", &self.config.path)
            .finish_non_exhaustive()
    }
}

impl SqliteTaskStore {
    /// Opens (creating if needed) the database and applies the schema.
    pub fn open(config: SqliteConfig) -> Result<Self, TaskError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    TaskError::Storage(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let conn = Connection::open_with_flags(&config.path, flags)?;
        Self::configure_connection(&conn, &config)?;
        conn.execute_batch(SCHEMA)?;

        tracing::info!(path = %config.path.display(), "sqlite task store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self, TaskError> {
        Self::open(SqliteConfig::in_memory())
    }

    /// Database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn configure_connection(conn: &Connection, config: &SqliteConfig) -> rusqlite::Result<()> {
        conn.busy_timeout(config.busy_timeout)?;
        if config.wal_mode {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }
        conn.execute_batch(
            "
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            ",
        )
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_connection<F, T>(&self, f: F) -> Result<T, TaskError>
    where
        F: FnOnce(&Connection) -> Result<T, TaskError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .map_err(|e| TaskError::Storage(format!("sqlite worker failed: {e}")))?
    }
}

// ---- Row mapping ----

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, TaskError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| TaskError::Storage(format!("bad timestamp {raw:?}: {e}")))
}

fn to_json(payload: &Payload) -> Result<String, TaskError> {
    serde_json::to_string(payload)
        .map_err(|e| TaskError::Storage(format!("failed to serialize payload: {e}")))
}

fn from_json(raw: &str) -> Result<Payload, TaskError> {
    serde_json::from_str(raw)
        .map_err(|e| TaskError::Storage(format!("failed to deserialize payload: {e}")))
}

struct TaskRow {
    id: String,
    task_type: String,
    status: String,
    priority: i64,
    execution_mode: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    input_data: String,
    result_data: Option<String>,
    error_info: Option<String>,
    retry_count: u32,
    max_retries: u32,
    timeout_seconds: u64,
    metadata: String,
}

impl TaskRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_type: row.get(1)?,
            status: row.get(2)?,
            priority: row.get(3)?,
            execution_mode: row.get(4)?,
            created_at: row.get(5)?,
            started_at: row.get(6)?,
            completed_at: row.get(7)?,
            input_data: row.get(8)?,
            result_data: row.get(9)?,
            error_info: row.get(10)?,
            retry_count: row.get(11)?,
            max_retries: row.get(12)?,
            timeout_seconds: row.get(13)?,
            metadata: row.get(14)?,
        })
    }

    fn into_task(self) -> Result<Task, TaskError> {
        let priority = TaskPriority::from_value(self.priority).ok_or_else(|| {
            TaskError::Storage(format!("unknown priority {} for {}", self.priority, self.id))
        })?;
        Ok(Task {
            task_type: self.task_type.into(),
            status: self.status.parse()?,
            priority,
            execution_mode: self
                .execution_mode
                .as_deref()
                .map(str::parse::<ExecutionMode>)
                .transpose()?,
            created_at: parse_ts(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            input_data: from_json(&self.input_data)?,
            result_data: self.result_data.as_deref().map(from_json).transpose()?,
            error_info: self.error_info.as_deref().map(from_json).transpose()?,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            timeout_seconds: self.timeout_seconds,
            metadata: from_json(&self.metadata)?,
            task_id: self.id,
        })
    }
}

fn fetch(conn: &Connection, task_id: &str) -> Result<Option<Task>, TaskError> {
    let row = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM tasks WHERE id = ?1"),
            params![task_id],
            TaskRow::read,
        )
        .optional()?;
    row.map(TaskRow::into_task).transpose()
}

fn query_tasks(conn: &Connection, sql: &str, args: Vec<SqlValue>) -> Result<Vec<Task>, TaskError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(args), TaskRow::read)?;
    rows.map(|row| row.map_err(TaskError::from).and_then(TaskRow::into_task))
        .collect()
}

/// Writes back the mutable columns of `task`, guarded on `previous` status.
fn write_guarded(conn: &Connection, task: &Task, previous: TaskStatus) -> Result<(), TaskError> {
    let changed = conn.execute(
        "UPDATE tasks SET status = ?1, started_at = ?2, completed_at = ?3, result_data = ?4, \
         error_info = ?5, retry_count = ?6 WHERE id = ?7 AND status = ?8",
        params![
            task.status.as_str(),
            task.started_at.map(ts),
            task.completed_at.map(ts),
            task.result_data.as_ref().map(to_json).transpose()?,
            task.error_info.as_ref().map(to_json).transpose()?,
            task.retry_count,
            task.task_id,
            previous.as_str(),
        ],
    )?;
    if changed == 0 {
        return Err(TaskError::ConcurrentModification {
            task_id: task.task_id.clone(),
            expected: previous.to_string(),
            actual: "changed by another writer".to_string(),
        });
    }
    Ok(())
}

fn apply_status(conn: &Connection, task_id: &str, update: &StatusUpdate) -> Result<Task, TaskError> {
    let mut task = fetch(conn, task_id)?.ok_or_else(|| TaskError::not_found(task_id))?;
    let previous = task.status;
    if let Some(expected) = update.expected {
        if previous != expected {
            return Err(TaskError::ConcurrentModification {
                task_id: task_id.to_string(),
                expected: expected.to_string(),
                actual: previous.to_string(),
            });
        }
    }
    previous.validate_transition(task_id, &update.status)?;

    task.status = update.status;
    task.stamp_for(update.status, Utc::now());
    if let Some(result) = &update.result_data {
        task.result_data = Some(result.clone());
    }
    if let Some(error) = &update.error_info {
        task.error_info = Some(error.clone());
    }
    write_guarded(conn, &task, previous)?;
    Ok(task)
}

fn grouped_counts(
    conn: &Connection,
    column: &str,
    where_sql: &str,
    args: &[SqlValue],
) -> Result<Vec<(SqlValue, usize)>, TaskError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {column}, COUNT(*) FROM tasks {where_sql} GROUP BY {column}"
    ))?;
    let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
        Ok((row.get::<_, SqlValue>(0)?, row.get::<_, i64>(1)? as usize))
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn sql_text(value: SqlValue) -> String {
    match value {
        SqlValue::Text(s) => s,
        SqlValue::Integer(i) => i.to_string(),
        other => format!("{other:?}"),
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, task: Task) -> Result<Task, TaskError> {
        self.with_connection(move |conn| {
            let inserted = conn.execute(
                &format!(
                    "INSERT INTO tasks ({COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    task.task_id,
                    task.task_type.as_str(),
                    task.status.as_str(),
                    task.priority.value(),
                    task.execution_mode.map(|m| m.as_str()),
                    ts(task.created_at),
                    task.started_at.map(ts),
                    task.completed_at.map(ts),
                    to_json(&task.input_data)?,
                    task.result_data.as_ref().map(to_json).transpose()?,
                    task.error_info.as_ref().map(to_json).transpose()?,
                    task.retry_count,
                    task.max_retries,
                    task.timeout_seconds,
                    to_json(&task.metadata)?,
                ],
            );
            match inserted {
                Ok(_) => Ok(task),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    Err(TaskError::AlreadyExists {
                        task_id: task.task_id.clone(),
                    })
                },
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn get(&self, task_id: &str) -> Result<Option<Task>, TaskError> {
        let task_id = task_id.to_string();
        self.with_connection(move |conn| fetch(conn, &task_id))
            .await
    }

    async fn update_status(
        &self,
        task_id: &str,
        update: StatusUpdate,
    ) -> Result<Task, TaskError> {
        let task_id = task_id.to_string();
        self.with_connection(move |conn| apply_status(conn, &task_id, &update))
            .await
    }

    async fn update_retry(&self, task_id: &str, expected: TaskStatus) -> Result<Task, TaskError> {
        let task_id = task_id.to_string();
        self.with_connection(move |conn| {
            let mut task = fetch(conn, &task_id)?.ok_or_else(|| TaskError::not_found(&task_id))?;
            if task.status != expected {
                return Err(TaskError::ConcurrentModification {
                    task_id: task_id.clone(),
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
                .validate_transition(&task_id, &TaskStatus::Retrying)?;
            task.status = TaskStatus::Retrying;
            task.reset_for_retry();
            write_guarded(conn, &task, expected)?;
            Ok(task)
        })
        .await
    }

    async fn list(&self, options: ListOptions) -> Result<TaskPage, TaskError> {
        self.with_connection(move |conn| {
            let mut clauses = Vec::new();
            let mut args: Vec<SqlValue> = Vec::new();
            if let Some(task_type) = &options.filter.task_type {
                clauses.push("task_type = ?");
                args.push(SqlValue::Text(task_type.to_string()));
            }
            if let Some(status) = options.filter.status {
                clauses.push("status = ?");
                args.push(SqlValue::Text(status.to_string()));
            }
            if let Some(priority) = options.filter.priority {
                clauses.push("priority = ?");
                args.push(SqlValue::Integer(priority.value()));
            }
            let where_sql = if clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", clauses.join(" AND "))
            };

            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM tasks {where_sql}"),
                params_from_iter(args.iter()),
                |row| row.get(0),
            )?;

            let column = match options.order_by {
                OrderBy::CreatedAt => "created_at",
                OrderBy::Priority => "priority",
                OrderBy::Status => "status",
            };
            let direction = if options.descending { "DESC" } else { "ASC" };
            let sql = format!(
                "SELECT {COLUMNS} FROM tasks {where_sql} \
                 ORDER BY {column} {direction}, id {direction} LIMIT ? OFFSET ?"
            );
            args.push(SqlValue::Integer(options.effective_limit() as i64));
            args.push(SqlValue::Integer(options.offset as i64));

            Ok(TaskPage {
                items: query_tasks(conn, &sql, args)?,
                total: total as usize,
            })
        })
        .await
    }

    async fn get_pending(&self, limit: usize) -> Result<Vec<Task>, TaskError> {
        self.with_connection(move |conn| {
            query_tasks(
                conn,
                &format!(
                    "SELECT {COLUMNS} FROM tasks WHERE status = 'pending' \
                     ORDER BY priority DESC, created_at ASC LIMIT ?1"
                ),
                vec![SqlValue::Integer(limit as i64)],
            )
        })
        .await
    }

    async fn get_running(&self) -> Result<Vec<Task>, TaskError> {
        self.with_connection(|conn| {
            query_tasks(
                conn,
                &format!("SELECT {COLUMNS} FROM tasks WHERE status = 'running'"),
                Vec::new(),
            )
        })
        .await
    }

    async fn get_timeout_candidates(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Task>, TaskError> {
        self.with_connection(move |conn| {
            query_tasks(
                conn,
                &format!(
                    "SELECT {COLUMNS} FROM tasks WHERE status = 'running' \
                     AND started_at IS NOT NULL AND started_at < ?1"
                ),
                vec![SqlValue::Text(ts(started_before))],
            )
        })
        .await
    }

    async fn get_statistics(&self, range: Option<TimeRange>) -> Result<TaskStatistics, TaskError> {
        self.with_connection(move |conn| {
            let (where_sql, args) = match range {
                Some(r) => (
                    "WHERE created_at >= ?1 AND created_at <= ?2".to_string(),
                    vec![SqlValue::Text(ts(r.start)), SqlValue::Text(ts(r.end))],
                ),
                None => (String::new(), Vec::new()),
            };

            let mut stats = TaskStatistics::default();
            for (status, count) in grouped_counts(conn, "status", &where_sql, &args)? {
                stats.total += count;
                stats.by_status.insert(sql_text(status), count);
            }
            stats.by_type = grouped_counts(conn, "task_type", &where_sql, &args)?
                .into_iter()
                .map(|(t, count)| (sql_text(t), count))
                .collect::<BTreeMap<_, _>>();
            for (priority, count) in grouped_counts(conn, "priority", &where_sql, &args)? {
                let name = match priority {
                    SqlValue::Integer(v) => TaskPriority::from_value(v)
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| v.to_string()),
                    other => sql_text(other),
                };
                stats.by_priority.insert(name, count);
            }

            stats.success_rate = success_rate(
                stats.count(TaskStatus::Completed),
                stats.count(TaskStatus::Failed),
            );

            let completed_filter = if where_sql.is_empty() {
                "WHERE".to_string()
            } else {
                format!("{where_sql} AND")
            };
            stats.average_execution_time = conn.query_row(
                &format!(
                    "SELECT AVG((julianday(completed_at) - julianday(started_at)) * 86400.0) \
                     FROM tasks {completed_filter} status = 'completed' \
                     AND started_at IS NOT NULL AND completed_at IS NOT NULL"
                ),
                params_from_iter(args.iter()),
                |row| row.get::<_, Option<f64>>(0),
            )?;

            let now = Utc::now();
            let recent_since = |span: ChronoDuration| -> Result<usize, TaskError> {
                let mut scoped = args.clone();
                scoped.push(SqlValue::Text(ts(now - span)));
                let n = scoped.len();
                let count: i64 = conn.query_row(
                    &format!("SELECT COUNT(*) FROM tasks {completed_filter} created_at >= ?{n}"),
                    params_from_iter(scoped.iter()),
                    |row| row.get(0),
                )?;
                Ok(count as usize)
            };
            stats.recent = RecentActivity {
                last_hour: recent_since(ChronoDuration::hours(1))?,
                last_day: recent_since(ChronoDuration::days(1))?,
                last_week: recent_since(ChronoDuration::weeks(1))?,
            };
            Ok(stats)
        })
        .await
    }

    async fn delete(&self, task_id: &str) -> Result<bool, TaskError> {
        let task_id = task_id.to_string();
        self.with_connection(move |conn| {
            Ok(conn.execute("DELETE FROM tasks WHERE id = ?1", params![task_id])? > 0)
        })
        .await
    }

    async fn delete_old(
        &self,
        older_than: DateTime<Utc>,
        statuses: &[TaskStatus],
    ) -> Result<usize, TaskError> {
        if statuses.is_empty() {
            return Ok(0);
        }
        let statuses = statuses.to_vec();
        self.with_connection(move |conn| {
            let placeholders = (2..statuses.len() + 2)
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let mut args = vec![SqlValue::Text(ts(older_than))];
            args.extend(statuses.iter().map(|s| SqlValue::Text(s.to_string())));
            let deleted = conn.execute(
                &format!(
                    "DELETE FROM tasks WHERE created_at < ?1 AND status IN ({placeholders})"
                ),
                params_from_iter(args),
            )?;
            Ok(deleted)
        })
        .await
    }

    async fn bulk_update_status(
        &self,
        task_ids: &[String],
        status: TaskStatus,
    ) -> Result<usize, TaskError> {
        let task_ids = task_ids.to_vec();
        self.with_connection(move |conn| {
            let update = StatusUpdate::to(status);
            let mut updated = 0;
            for task_id in &task_ids {
                match apply_status(conn, task_id, &update) {
                    Ok(_) => updated += 1,
                    Err(
                        TaskError::NotFound { .. }
                        | TaskError::InvalidTransition { .. }
                        | TaskError::ConcurrentModification { .. },
                    ) => {},
                    Err(e) => return Err(e),
                }
            }
            Ok(updated)
        })
        .await
    }

    async fn health_check(&self) -> Result<bool, TaskError> {
        let healthy = self
            .with_connection(|conn| Ok(conn.execute_batch("SELECT 1;").is_ok()))
            .await?;
        if !healthy {
            tracing::warn!(path = %self.config.path.display(), "sqlite health check failed");
        }
        Ok(healthy)
    }

    async fn begin_transaction(&self) -> Result<(), TaskError> {
        self.with_connection(|conn| {
            if !conn.is_autocommit() {
                return Err(TaskError::Transaction(
                    "a transaction is already open".to_string(),
                ));
            }
            conn.execute_batch("BEGIN IMMEDIATE")?;
            Ok(())
        })
        .await
    }

    async fn commit(&self) -> Result<(), TaskError> {
        self.with_connection(|conn| {
            if conn.is_autocommit() {
                return Err(TaskError::Transaction("no transaction is open".to_string()));
            }
            conn.execute_batch("COMMIT")
                .map_err(|e| TaskError::Transaction(format!("commit failed: {e}")))
        })
        .await
    }

    async fn rollback(&self) -> Result<(), TaskError> {
        self.with_connection(|conn| {
            if conn.is_autocommit() {
                return Err(TaskError::Transaction("no transaction is open".to_string()));
            }
            conn.execute_batch("ROLLBACK")
                .map_err(|e| TaskError::Transaction(format!("rollback failed: {e}")))
        })
        .await
    }
}
