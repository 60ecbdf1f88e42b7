// In-memory key/value store

use dashmap::DashMap;
use std::sync::Arc;

use super::{LegacyStore, SecureStore};
use crate::error::StorageResult;

/// Thread-safe in-memory store
///
/// Used for `--store memory`, ephemeral sessions and tests. Implements both
/// the secure and the legacy store contracts.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `entries`
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let store = Self::new();
        for (key, value) in entries {
            store.entries.insert(key.into(), value.into());
        }
        store
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SecureStore for MemoryStore {
    fn put(&self, key: &str, value: &str) -> StorageResult<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

impl LegacyStore for MemoryStore {
    fn read(&self, key: &str) -> StorageResult<Option<String>> {
        SecureStore::get(self, key)
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        SecureStore::delete(self, key)
    }
}
