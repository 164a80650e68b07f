//! Document storage for ledgers and snapshots.
//!
//! Two tiers serve different roles:
//!
//! - [`MemStore`]: hot copy in a concurrent hashmap (DashMap)
//! - [`DurableStore`]: source of truth in ACID transactions (redb)
//!
//! [`DocumentStore`] composes them: reads go to the durable tier and fall
//! back to the hot copy only when the durable read itself fails; writes
//! commit durably first and are then mirrored into the hot tier.

pub mod durable;
pub mod mem;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

pub use durable::DurableStore;
pub use mem::MemStore;

use crate::error::StoreError;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Documents addressed in one read-modify-write pass; `None` means absent.
pub type DocumentSet = BTreeMap<String, Option<Vec<u8>>>;

/// Tiered document store: durable (redb) when configured, plus a hot mirror.
pub struct DocumentStore {
    hot: MemStore,
    durable: Option<DurableStore>,
    // Serializes read-modify-write passes in memory-only mode.
    write_lock: Mutex<()>,
}

impl DocumentStore {
    /// Create a memory-only store (no persistence).
    pub fn memory_only() -> Self {
        Self {
            hot: MemStore::new(),
            durable: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Create a store persisted under `data_dir`.
    pub fn with_persistence(data_dir: &Path) -> StoreResult<Self> {
        let durable = DurableStore::open(data_dir)?;
        Ok(Self {
            hot: MemStore::new(),
            durable: Some(durable),
            write_lock: Mutex::new(()),
        })
    }

    /// Whether writes survive the process.
    pub fn is_durable(&self) -> bool {
        self.durable.is_some()
    }

    /// Read a document, preferring the durable tier.
    pub fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        match &self.durable {
            Some(d) => match d.get(key.as_bytes()) {
                Ok(v) => Ok(v),
                Err(e) => match self.hot.get(key) {
                    Some(cached) => {
                        tracing::warn!(key, error = %e, "durable read failed, using in-memory copy");
                        Ok(Some(cached))
                    }
                    None => Err(e),
                },
            },
            None => Ok(self.hot.get(key)),
        }
    }

    /// Write a document.
    pub fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        if let Some(d) = &self.durable {
            d.put(key.as_bytes(), value)?;
        }
        self.hot.put(key, value.to_vec());
        Ok(())
    }

    /// Keys of every stored document, sorted.
    pub fn keys(&self) -> StoreResult<Vec<String>> {
        match &self.durable {
            Some(d) => d.keys(),
            None => Ok(self.hot.keys()),
        }
    }

    /// Delete a document. Returns whether it existed.
    pub fn remove(&self, key: &str) -> StoreResult<bool> {
        let existed_hot = self.hot.remove(key).is_some();
        match &self.durable {
            Some(d) => d.remove(key.as_bytes()),
            None => Ok(existed_hot),
        }
    }

    /// Read-modify-write several documents atomically.
    ///
    /// See [`DurableStore::update_many`]. In memory-only mode the pass holds
    /// an in-process lock instead of a redb write transaction.
    pub fn update_many<R>(
        &self,
        keys: &[&str],
        f: impl FnOnce(&mut DocumentSet) -> R,
    ) -> StoreResult<R> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (result, changed) = match &self.durable {
            Some(d) => d.update_many(keys, f)?,
            None => {
                let mut docs: DocumentSet = keys
                    .iter()
                    .map(|k| ((*k).to_string(), self.hot.get(k)))
                    .collect();
                let before = docs.clone();
                let result = f(&mut docs);
                let changed: DocumentSet = docs
                    .into_iter()
                    .filter(|(k, v)| before.get(k) != Some(v))
                    .collect();
                (result, changed)
            }
        };
        for (key, value) in changed {
            match value {
                Some(bytes) => self.hot.put(&key, bytes),
                None => {
                    self.hot.remove(&key);
                }
            }
        }
        Ok(result)
    }
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("durable", &self.durable.is_some())
            .field("hot_entries", &self.hot.len())
            .finish()
    }
}
