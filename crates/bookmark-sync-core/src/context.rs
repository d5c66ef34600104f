//! Handles shared by the coordinator and the pipelines.

use crate::bookmarks::BookmarkStore;
use crate::config::SyncConfig;
use crate::events::{EventBus, SyncEvent};
use crate::flags::SyncFlags;
use crate::mirror::Mirror;
use crate::observer::Observers;
use crate::remote::{RemotePaths, RemoteStore};
use crate::session::SessionProvider;
use crate::store::{self, KeyValueStore};
use crate::version::VersionManager;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Everything a sync component needs, cheap to clone.
#[derive(Clone)]
pub struct SyncContext {
    pub host: Arc<dyn BookmarkStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub session: Arc<dyn SessionProvider>,
    pub store: Arc<dyn KeyValueStore>,
    pub config: SyncConfig,
    pub flags: Arc<SyncFlags>,
    pub events: Arc<EventBus>,
    pub mirror: Arc<Mutex<Mirror>>,
    pub observers: Arc<Observers>,
    pub versions: VersionManager,
}

impl SyncContext {
    /// Build a context, loading the persisted mirror from `store`.
    pub async fn new(
        host: Arc<dyn BookmarkStore>,
        remote: Arc<dyn RemoteStore>,
        session: Arc<dyn SessionProvider>,
        store: Arc<dyn KeyValueStore>,
        config: SyncConfig,
    ) -> store::Result<Self> {
        let mirror = Mirror::load(Arc::clone(&store)).await?;
        Ok(Self {
            host,
            remote,
            session,
            versions: VersionManager::new(Arc::clone(&store)),
            store,
            flags: Arc::new(SyncFlags::new(config.echo_ttl)),
            config,
            events: Arc::new(EventBus::new()),
            mirror: Arc::new(Mutex::new(mirror)),
            observers: Arc::new(Observers::new()),
        })
    }

    pub fn paths(&self, uid: &str) -> RemotePaths {
        RemotePaths::new(&self.config.namespace, uid)
    }

    pub fn emit(&self, event: SyncEvent) {
        self.events.emit(event);
    }
}
