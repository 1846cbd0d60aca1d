//! Byte-level persistence for [`GenericTaskStore`](crate::store::generic::GenericTaskStore).
//!
//! A [`StorageBackend`] maps string keys to opaque byte blobs and a version
//! counter. It knows nothing about tasks: the state machine, filtering,
//! ordering and statistics all sit one layer up. Tasks live under
//! `task:{task_id}`, so loading every task is one prefix scan.
//!
//! Versions start at 1 and grow by one per write. Conditional writes
//! ([`put_if_absent`](StorageBackend::put_if_absent) and
//! [`put_if_version`](StorageBackend::put_if_version)) are what turn a
//! read-modify-write on a task into a compare-and-swap.

use async_trait::async_trait;
use thiserror::Error;

/// Prefix shared by every task key.
pub const TASK_KEY_PREFIX: &str = "task:";

/// Bytes as stored, plus the version they were stored at.
///
/// ```
/// use taskmill::store::backend::VersionedRecord;
///
/// let record = VersionedRecord { data: br#"{"status":"pending"}"#.to_vec(), version: 3 };
/// assert_eq!(record.version, 3);
/// ```
#[derive(Debug, Clone)]
pub struct VersionedRecord {
    /// JSON produced by the task store.
    pub data: Vec<u8>,
    /// Write counter for this key.
    pub version: u64,
}

/// Backend failure, translated into [`TaskError`](crate::error::TaskError)
/// by the task store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No value under `key`.
    #[error("key not found: {key}")]
    NotFound {
        /// Missing key.
        key: String,
    },

    /// A create-only write hit an occupied key.
    #[error("key already exists: {key}")]
    AlreadyExists {
        /// Occupied key.
        key: String,
    },

    /// A conditional write lost a race.
    ///
    /// ```
    /// use taskmill::store::backend::StorageError;
    ///
    /// let err = StorageError::VersionConflict { key: "task:9".into(), expected: 4, actual: 5 };
    /// assert!(err.to_string().contains("expected 4, found 5"));
    /// ```
    #[error("version conflict on key {key}: expected {expected}, found {actual}")]
    VersionConflict {
        /// Contended key.
        key: String,
        /// Version the writer read.
        expected: u64,
        /// Version now stored.
        actual: u64,
    },

    /// IO, driver or serialization trouble inside the backend.
    #[error("backend error: {message}")]
    Backend {
        /// What went wrong.
        message: String,
        /// Underlying cause.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl StorageError {
    /// A [`StorageError::Backend`] with no underlying cause.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }
}

/// Versioned key-value storage shared by every task driver in the process.
///
/// Implementations store and return bytes verbatim; they never decode,
/// validate, filter or sort records.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Reads `key`. Fails with [`StorageError::NotFound`] when absent.
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError>;

    /// Writes `key` unconditionally and returns its new version.
    async fn put(&self, key: &str, data: &[u8]) -> Result<u64, StorageError>;

    /// Writes `key` at version 1, failing with
    /// [`StorageError::AlreadyExists`] if anything is there.
    async fn put_if_absent(&self, key: &str, data: &[u8]) -> Result<u64, StorageError>;

    /// Writes `key` only while it is still at `expected_version`.
    ///
    /// # Errors
    ///
    /// - [`StorageError::NotFound`] if `key` is gone.
    /// - [`StorageError::VersionConflict`] if another writer got there first.
    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError>;

    /// Removes `key`; `true` if it was present.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Every `(key, record)` whose key starts with `prefix`, in no
    /// particular order.
    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, VersionedRecord)>, StorageError>;

    /// Reachability probe behind [`TaskStore::health_check`](crate::store::TaskStore::health_check).
    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// `task:{task_id}`.
///
/// ```
/// assert_eq!(taskmill::store::backend::make_key("7f3a"), "task:7f3a");
/// ```
pub fn make_key(task_id: &str) -> String {
    format!("{TASK_KEY_PREFIX}{task_id}")
}

/// Inverse of [`make_key`]; `None` for keys outside the task namespace.
pub fn parse_key(key: &str) -> Option<&str> {
    key.strip_prefix(TASK_KEY_PREFIX)
}
