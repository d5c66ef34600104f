//! Persistence for the sync engine's local state.
//!
//! The mirror, the tombstones and the last known version all live in one JSON
//! object file (by default `state.json` next to the bookmarks file) so they
//! survive restarts.

use async_trait::async_trait;
use bookmark_sync_core::store::{self, KeyValueStore, StoreError};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// KeyValueStore backed by a single pretty-printed JSON object file.
pub struct JsonFileStore {
    /// Path to the storage file.
    path: PathBuf,
    /// In-memory cache, written through on every change.
    values: Mutex<Map<String, Value>>,
}

impl JsonFileStore {
    /// Open the store at `path`. A missing file starts out empty and is
    /// created on the first write.
    pub async fn open(path: impl Into<PathBuf>) -> store::Result<Self> {
        let path = path.into();
        let values = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<Value>(&contents)? {
                Value::Object(map) => map,
                other => {
                    warn!(
                        "Ignoring {}: expected a JSON object, found {}",
                        path.display(),
                        other
                    );
                    Map::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(StoreError::Io(e.to_string())),
        };
        debug!("Loaded {} key(s) from {}", values.len(), path.display());

        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn save(&self, values: &Map<String, Value>) -> store::Result<()> {
        let contents = serde_json::to_string_pretty(values)?;
        write_atomically(&self.path, &contents)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))
    }
}

/// Replace `path` through a hidden temp file in the same directory, so readers
/// and watchers never see a half-written file.
pub(crate) async fn write_atomically(path: &Path, contents: &str) -> std::io::Result<()> {
    let file_name = path.file_name().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} has no file name", path.display()),
        )
    })?;
    let temp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&temp, contents).await?;
    tokio::fs::rename(&temp, path).await
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> store::Result<Option<Value>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> store::Result<()> {
        let mut values = self.values.lock().await;
        values.insert(key.to_string(), value);
        self.save(&values).await
    }

    async fn remove(&self, key: &str) -> store::Result<()> {
        let mut values = self.values.lock().await;
        if values.remove(key).is_some() {
            self.save(&values).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(temp_dir.path().join("state.json"))
            .await
            .unwrap();

        assert!(store.get("syncVersion").await.unwrap().is_none());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("state.json");

        let store = JsonFileStore::open(&path).await.unwrap();
        store
            .set("syncVersion", json!({ "version": 2, "timestamp": 10 }))
            .await
            .unwrap();
        store.set("deletedUrls", json!(["https://a.com"])).await.unwrap();
        store.remove("deletedUrls").await.unwrap();

        let reopened = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(
            reopened.get("syncVersion").await.unwrap(),
            Some(json!({ "version": 2, "timestamp": 10 }))
        );
        assert!(reopened.get("deletedUrls").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            JsonFileStore::open(&path).await,
            Err(StoreError::Serialization(_))
        ));
    }
}
