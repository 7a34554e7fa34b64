//! Persistence collaborators for finished runs.
//!
//! The runner only ever calls `save` on terminal success and callers use
//! `require` to read artifacts back. Both stores are last-write-wins.

pub mod trace_store;

use dashmap::DashMap;
use vizflow_common::DatasetProfile;

use crate::errors::StoreError;

pub use trace_store::TraceStore;

pub trait ArtifactStore<V>: Send + Sync {
    fn save(&self, key: &str, value: V) -> Result<(), StoreError>;

    /// Fails with `StoreError::NotFound` when nothing was saved under `key`.
    fn require(&self, key: &str) -> Result<V, StoreError>;
}

/// In-memory store keyed by string.
pub struct MemoryStore<V> {
    kind: &'static str,
    entries: DashMap<String, V>,
}

impl<V> MemoryStore<V> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V: Clone + Send + Sync> ArtifactStore<V> for MemoryStore<V> {
    fn save(&self, key: &str, value: V) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn require(&self, key: &str) -> Result<V, StoreError> {
        self.entries
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound {
                kind: self.kind,
                key: key.to_string(),
            })
    }
}

/// Dataset profiles, keyed by dataset id.
pub type ProfileStore = MemoryStore<DatasetProfile>;

impl Default for ProfileStore {
    fn default() -> Self {
        MemoryStore::new("dataset profile")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_last_write_wins() {
        let store: MemoryStore<u32> = MemoryStore::new("counter");
        store.save("a", 1).unwrap();
        store.save("a", 2).unwrap();
        assert_eq!(store.require("a").unwrap(), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_memory_store_missing_key() {
        let store = ProfileStore::default();
        assert!(store.is_empty());
        match store.require("ds_1") {
            Err(StoreError::NotFound { kind, key }) => {
                assert_eq!(kind, "dataset profile");
                assert_eq!(key, "ds_1");
            }
            other => panic!("Expected NotFound, got {:?}", other.map(|p| p.dataset_id)),
        }
    }
}
