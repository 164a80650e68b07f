//! ACID-durable key-value store backed by redb.
//!
//! Holds every ledger document so scheduling state survives process death.
//! A background wake-up may run in a fresh process, so nothing here is
//! cached: each call opens its own transaction.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};

use crate::error::StoreError;
use crate::store::{DocumentSet, StoreResult};

/// Table for ledger documents (string keys → JSON bytes).
const META_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("meta");

/// File name of the ledger database inside the data directory.
pub const LEDGER_FILE: &str = "nudge-ledger.redb";

fn redb_err<E: Display>(op: &'static str) -> impl FnOnce(E) -> StoreError {
    move |e| StoreError::Redb {
        message: format!("{op} failed: {e}"),
    }
}

/// ACID-durable store using redb.
///
/// All writes go through transactions. Reads use MVCC snapshots.
pub struct DurableStore {
    db: Arc<Database>,
}

impl DurableStore {
    /// Open or create a durable store in the given directory.
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| StoreError::Io { source: e })?;
        let db_path = data_dir.join(LEDGER_FILE);
        let db = Database::create(&db_path).map_err(|e| StoreError::Redb {
            message: format!("failed to open redb at {}: {e}", db_path.display()),
        })?;

        // Create the table up front so read transactions never see it missing.
        let txn = db.begin_write().map_err(redb_err("begin_write"))?;
        txn.open_table(META_TABLE).map_err(redb_err("open_table"))?;
        txn.commit().map_err(redb_err("commit"))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Store a key-value pair with full ACID guarantees.
    pub fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(redb_err("begin_write"))?;
        {
            let mut table = txn.open_table(META_TABLE).map_err(redb_err("open_table"))?;
            table.insert(key, value).map_err(redb_err("insert"))?;
        }
        txn.commit().map_err(redb_err("commit"))?;
        Ok(())
    }

    /// Read a value by key. Returns `Ok(None)` if the key doesn't exist.
    pub fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn.open_table(META_TABLE).map_err(redb_err("open_table"))?;
        let result = table.get(key).map_err(redb_err("get"))?;
        Ok(result.map(|guard| guard.value().to_vec()))
    }

    /// Delete a key. Returns whether the key existed.
    pub fn remove(&self, key: &[u8]) -> StoreResult<bool> {
        let txn = self.db.begin_write().map_err(redb_err("begin_write"))?;
        let existed = {
            let mut table = txn.open_table(META_TABLE).map_err(redb_err("open_table"))?;
            let result = table.remove(key).map_err(redb_err("remove"))?;
            result.is_some()
        };
        txn.commit().map_err(redb_err("commit"))?;
        Ok(existed)
    }

    /// All keys currently stored, in byte order.
    pub fn keys(&self) -> StoreResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(redb_err("begin_read"))?;
        let table = txn.open_table(META_TABLE).map_err(redb_err("open_table"))?;
        let mut keys = Vec::new();
        for entry in table.iter().map_err(redb_err("iter"))? {
            let (key, _) = entry.map_err(redb_err("iter"))?;
            keys.push(String::from_utf8_lossy(key.value()).into_owned());
        }
        Ok(keys)
    }

    /// Read-modify-write several documents inside one write transaction.
    ///
    /// `f` sees the current bytes of every key (`None` when absent) and may
    /// replace or clear them. Only keys whose bytes changed are written, and
    /// nothing is committed until `f` returns. Returns the keys that changed.
    pub fn update_many<R>(
        &self,
        keys: &[&str],
        f: impl FnOnce(&mut DocumentSet) -> R,
    ) -> StoreResult<(R, DocumentSet)> {
        let txn = self.db.begin_write().map_err(redb_err("begin_write"))?;
        let (result, changed) = {
            let mut table = txn.open_table(META_TABLE).map_err(redb_err("open_table"))?;
            let mut docs: DocumentSet = BTreeMap::new();
            for key in keys {
                let value = table
                    .get(key.as_bytes())
                    .map_err(redb_err("get"))?
                    .map(|guard| guard.value().to_vec());
                docs.insert((*key).to_string(), value);
            }
            let before = docs.clone();
            let result = f(&mut docs);

            let mut changed: DocumentSet = BTreeMap::new();
            for (key, value) in docs {
                if before.get(&key) == Some(&value) {
                    continue;
                }
                match &value {
                    Some(bytes) => {
                        table
                            .insert(key.as_bytes(), bytes.as_slice())
                            .map_err(redb_err("insert"))?;
                    }
                    None => {
                        table.remove(key.as_bytes()).map_err(redb_err("remove"))?;
                    }
                }
                changed.insert(key, value);
            }
            (result, changed)
        };
        txn.commit().map_err(redb_err("commit"))?;
        Ok((result, changed))
    }
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore").finish()
    }
}
