//! The process-local store.
//!
//! [`InMemoryBackend`] keeps each key in a `DashMap` slot; conditional
//! writes hold the shard lock for the compare and the write, so two drivers
//! racing on one task serialize there and nowhere else.
//!
//! ```
//! use taskmill::store::memory::InMemoryTaskStore;
//!
//! let store = InMemoryTaskStore::default();
//! assert!(store.backend().is_empty());
//! ```

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::store::backend::{StorageBackend, StorageError, VersionedRecord};
use crate::store::generic::GenericTaskStore;

#[derive(Debug)]
struct Slot {
    bytes: Vec<u8>,
    version: u64,
}

impl Slot {
    fn record(&self) -> VersionedRecord {
        VersionedRecord {
            data: self.bytes.clone(),
            version: self.version,
        }
    }
}

/// [`StorageBackend`] over a sharded concurrent map. Contents vanish with
/// the process.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    slots: DashMap<String, Slot>,
}

impl InMemoryBackend {
    /// An empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored key count.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// `true` when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn missing(key: &str) -> StorageError {
        StorageError::NotFound {
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<VersionedRecord, StorageError> {
        self.slots
            .get(key)
            .map(|slot| slot.record())
            .ok_or_else(|| Self::missing(key))
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<u64, StorageError> {
        let version = match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                slot.version += 1;
                slot.bytes = data.to_vec();
                slot.version
            },
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    bytes: data.to_vec(),
                    version: 1,
                });
                1
            },
        };
        Ok(version)
    }

    async fn put_if_absent(&self, key: &str, data: &[u8]) -> Result<u64, StorageError> {
        let Entry::Vacant(vacant) = self.slots.entry(key.to_string()) else {
            return Err(StorageError::AlreadyExists {
                key: key.to_string(),
            });
        };
        vacant.insert(Slot {
            bytes: data.to_vec(),
            version: 1,
        });
        Ok(1)
    }

    async fn put_if_version(
        &self,
        key: &str,
        data: &[u8],
        expected_version: u64,
    ) -> Result<u64, StorageError> {
        let mut slot = self.slots.get_mut(key).ok_or_else(|| Self::missing(key))?;
        if slot.version != expected_version {
            return Err(StorageError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual: slot.version,
            });
        }
        slot.version += 1;
        slot.bytes = data.to_vec();
        Ok(slot.version)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.slots.remove(key).is_some())
    }

    async fn list_by_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, VersionedRecord)>, StorageError> {
        let mut out = Vec::new();
        for entry in self.slots.iter() {
            if entry.key().starts_with(prefix) {
                out.push((entry.key().clone(), entry.value().record()));
            }
        }
        Ok(out)
    }
}

/// Task store over [`InMemoryBackend`]; the engine's default.
pub type InMemoryTaskStore = GenericTaskStore<InMemoryBackend>;

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        GenericTaskStore::new(InMemoryBackend::new())
    }
}
