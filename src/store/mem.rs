//! In-memory hot tier backed by DashMap.
//!
//! In memory-only mode this is the whole store. With a durable backend it
//! mirrors every committed write and serves as the fallback when a durable
//! read fails. All data is lost on process exit.

use dashmap::DashMap;

/// Concurrent in-memory document map.
#[derive(Debug, Default)]
pub struct MemStore {
    data: DashMap<String, Vec<u8>>,
}

impl MemStore {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }

    /// Insert or replace a value.
    pub fn put(&self, key: &str, value: Vec<u8>) {
        self.data.insert(key.to_string(), value);
    }

    /// Get a clone of the stored value.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.data.get(key).map(|v| v.value().clone())
    }

    /// Remove a key and return its value.
    pub fn remove(&self, key: &str) -> Option<Vec<u8>> {
        self.data.remove(key).map(|(_, v)| v)
    }

    /// Number of entries.
    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    /// Every key, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_remove() {
        let store = MemStore::new();
        store.put("ledger:system", vec![1, 2, 3]);
        store.put("state:snapshot", vec![4]);
        assert_eq!(store.get("ledger:system"), Some(vec![1, 2, 3]));
        assert_eq!(store.keys(), vec!["ledger:system", "state:snapshot"]);

        assert_eq!(store.remove("ledger:system"), Some(vec![1, 2, 3]));
        assert_eq!(store.keys(), vec!["state:snapshot"]);
    }

    #[test]
    fn overwrite_replaces() {
        let store = MemStore::new();
        store.put("k", vec![1]);
        store.put("k", vec![2]);
        assert_eq!(store.get("k"), Some(vec![2]));
        assert_eq!(store.len(), 1);
    }
}
