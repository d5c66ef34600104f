//! Version ledger deciding sync direction.
//!
//! Every write to the remote store carries a `VersionMetadata` record; the last
//! one this device saw or wrote is cached locally under `syncVersion`.
//! Records are ordered by `version` first and `timestamp` second.

use crate::store::{self, KeyValueStore};
use crate::tree::ItemCount;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

/// Store key of the cached metadata
pub const VERSION_KEY: &str = "syncVersion";

/// Which client produced a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncSource {
    Web,
    Browser,
    Import,
}

/// Version record stored next to the remote tree and cached locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionMetadata {
    /// Monotonic version (milliseconds since epoch when issued)
    pub version: u64,
    /// Wall-clock time of the write, in milliseconds since epoch
    pub timestamp: u64,
    pub source: SyncSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_count: Option<ItemCount>,
}

impl VersionMetadata {
    /// The record assumed before anything was ever synced.
    pub fn initial() -> Self {
        Self {
            version: 0,
            timestamp: 0,
            source: SyncSource::Browser,
            item_count: None,
        }
    }

    /// Total order used for every direction decision.
    pub fn authority_cmp(&self, other: &Self) -> Ordering {
        self.version
            .cmp(&other.version)
            .then(self.timestamp.cmp(&other.timestamp))
    }

    /// Same version and same timestamp: nothing happened in between.
    pub fn same_sync_as(&self, other: &Self) -> bool {
        self.version == other.version && self.timestamp == other.timestamp
    }
}

/// Current time in milliseconds since epoch.
pub fn now_millis() -> u64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Reads and writes the locally cached version record.
#[derive(Clone)]
pub struct VersionManager {
    store: Arc<dyn KeyValueStore>,
}

impl VersionManager {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Cached record, or `VersionMetadata::initial()` if none was stored.
    pub async fn local_version(&self) -> store::Result<VersionMetadata> {
        match self.store.get(VERSION_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(VersionMetadata::initial()),
        }
    }

    pub async fn update_local_version(&self, metadata: &VersionMetadata) -> store::Result<()> {
        self.store
            .set(VERSION_KEY, serde_json::to_value(metadata)?)
            .await?;
        debug!(
            "Updated local version: {} ({:?})",
            metadata.version, metadata.source
        );
        Ok(())
    }

    /// Timestamp of the last sync this device took part in.
    pub async fn last_sync_time(&self) -> store::Result<u64> {
        Ok(self.local_version().await?.timestamp)
    }

    /// False only when `remote` is exactly the record we already have.
    pub async fn should_sync(&self, remote: &VersionMetadata) -> store::Result<bool> {
        let local = self.local_version().await?;
        Ok(!local.same_sync_as(remote))
    }

    /// Build a record for a new write. The version never goes backwards, even
    /// if the clock does.
    pub async fn create_metadata(
        &self,
        source: SyncSource,
        item_count: Option<ItemCount>,
    ) -> store::Result<VersionMetadata> {
        let last = self.local_version().await?;
        let now = now_millis();
        Ok(VersionMetadata {
            version: now.max(last.version.saturating_add(1)),
            timestamp: now,
            source,
            item_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn record(version: u64, timestamp: u64) -> VersionMetadata {
        VersionMetadata {
            version,
            timestamp,
            source: SyncSource::Web,
            item_count: None,
        }
    }

    #[test]
    fn test_authority_order_version_first() {
        assert_eq!(record(2, 1).authority_cmp(&record(1, 9)), Ordering::Greater);
        assert_eq!(record(1, 9).authority_cmp(&record(1, 3)), Ordering::Greater);
        assert_eq!(record(1, 3).authority_cmp(&record(1, 3)), Ordering::Equal);
    }

    #[test]
    fn test_metadata_wire_format() {
        let metadata = VersionMetadata {
            item_count: Some(ItemCount { folders: 2, links: 5 }),
            ..record(7, 8)
        };
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(
            value,
            json!({ "version": 7, "timestamp": 8, "source": "web", "itemCount": { "folders": 2, "links": 5 } })
        );
    }

    #[tokio::test]
    async fn test_local_version_defaults() {
        let versions = VersionManager::new(Arc::new(InMemoryStore::new()));
        assert_eq!(versions.local_version().await.unwrap(), VersionMetadata::initial());
        assert_eq!(versions.last_sync_time().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_should_sync() {
        let versions = VersionManager::new(Arc::new(InMemoryStore::new()));
        versions.update_local_version(&record(5, 100)).await.unwrap();

        assert!(!versions.should_sync(&record(5, 100)).await.unwrap());
        assert!(versions.should_sync(&record(5, 101)).await.unwrap());
        assert!(versions.should_sync(&record(6, 100)).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_metadata_is_monotonic() {
        let versions = VersionManager::new(Arc::new(InMemoryStore::new()));
        let far_future = u64::MAX / 2;
        versions.update_local_version(&record(far_future, 0)).await.unwrap();

        let next = versions
            .create_metadata(SyncSource::Browser, None)
            .await
            .unwrap();
        assert_eq!(next.version, far_future + 1);
        assert_eq!(next.source, SyncSource::Browser);
    }

    #[tokio::test]
    async fn test_create_metadata_at_max_version_does_not_wrap() {
        let versions = VersionManager::new(Arc::new(InMemoryStore::new()));
        versions.update_local_version(&record(u64::MAX, 0)).await.unwrap();

        let next = versions
            .create_metadata(SyncSource::Browser, None)
            .await
            .unwrap();
        assert_eq!(next.version, u64::MAX);
    }
}
