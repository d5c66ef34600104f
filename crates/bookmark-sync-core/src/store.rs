//! KeyValueStore trait for the small amount of state the engine persists locally.
//!
//! Implementations:
//! - `InMemoryStore` - For testing
//! - `JsonFileStore` (in bookmark-sync-daemon) - A single JSON file on disk
//!
//! Keys in use: `bookmarkMirror`, `deletedUrls`, `syncVersion`.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Persisted key/value state owned by the sync engine.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `None` if the key was never written
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Write a value, replacing any previous one
    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Remove a key (no-op if missing)
    async fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory store for testing
#[derive(Default)]
pub struct InMemoryStore {
    values: RwLock<HashMap<String, Value>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peek at a value without going through the async trait
    pub fn snapshot(&self, key: &str) -> Option<Value> {
        self.values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.snapshot(key))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_in_memory_store_roundtrip() {
        let store = InMemoryStore::new();

        assert!(store.get("syncVersion").await.unwrap().is_none());

        store.set("syncVersion", json!({ "version": 3 })).await.unwrap();
        assert_eq!(
            store.get("syncVersion").await.unwrap(),
            Some(json!({ "version": 3 }))
        );

        store.remove("syncVersion").await.unwrap();
        assert!(store.get("syncVersion").await.unwrap().is_none());

        // Removing a missing key is fine
        store.remove("syncVersion").await.unwrap();
    }
}
