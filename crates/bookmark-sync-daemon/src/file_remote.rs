//! Remote store backed by one JSON document file.
//!
//! Point every device at the same file (a synced folder, a network share) and
//! it behaves like the hosted document store: paths address into the
//! document, writes are all-or-nothing and subscribers hear about changes made
//! by this process as well as by others.

use crate::persistence::write_atomically;
use crate::watcher::FileWatcher;
use anyhow::Result as AnyResult;
use async_trait::async_trait;
use bookmark_sync_core::remote::{
    self, RemoteError, RemoteStore, SnapshotCallback, SubscriptionToken, paths_overlap,
    set_value_at, value_at,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Subscriber {
    token: SubscriptionToken,
    path: String,
    callback: SnapshotCallback,
}

struct Shared {
    path: PathBuf,
    /// Last document written or observed. Held across writes so they serialize.
    doc: Mutex<Value>,
    subscribers: RwLock<Vec<Subscriber>>,
    next_token: AtomicU64,
}

/// RemoteStore over a JSON file on disk.
pub struct FileRemote {
    shared: Arc<Shared>,
    watch_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl FileRemote {
    /// Open the document at `path`. A missing file is an empty document.
    pub async fn open(path: impl Into<PathBuf>) -> remote::Result<Self> {
        let path = path.into();
        let doc = read_doc(&path).await?;
        debug!("Opened remote document {}", path.display());

        Ok(Self {
            shared: Arc::new(Shared {
                path,
                doc: Mutex::new(doc),
                subscribers: RwLock::new(Vec::new()),
                next_token: AtomicU64::new(1),
            }),
            watch_task: std::sync::Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Watch the file for edits made by other processes and notify
    /// subscribers when its content changes.
    pub fn start_watching(&self, debounce: Duration) -> AnyResult<()> {
        let mut task = self.watch_task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return Ok(());
        }

        let mut watcher = FileWatcher::new(self.shared.path.clone(), debounce)?;
        let shared = Arc::clone(&self.shared);
        *task = Some(tokio::spawn(async move {
            while watcher.event_rx().recv().await.is_some() {
                // One reload covers everything queued so far
                while watcher.event_rx().try_recv().is_ok() {}
                if let Err(e) = shared.reload().await {
                    warn!("Failed to reload {}: {}", shared.path.display(), e);
                }
            }
        }));
        info!("Watching remote document {}", self.shared.path.display());
        Ok(())
    }

    /// Number of subscriptions still registered
    pub fn active_subscriptions(&self) -> usize {
        self.shared
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Drop for FileRemote {
    fn drop(&mut self) {
        if let Some(task) = self
            .watch_task
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

impl Shared {
    /// Apply `updates` on top of the current file content and replace the file.
    async fn apply(&self, updates: BTreeMap<String, Value>) -> remote::Result<()> {
        let touched: Vec<String> = updates.keys().cloned().collect();
        let notifications = {
            let mut doc = self.doc.lock().await;
            let mut next = read_doc(&self.path).await?;
            for (path, value) in updates {
                set_value_at(&mut next, &path, value)?;
            }
            write_doc(&self.path, &next).await?;
            *doc = next;
            self.collect(&doc, |sub| {
                touched.iter().any(|path| paths_overlap(&sub.path, path))
            })
        };

        for (callback, value) in notifications {
            callback(value);
        }
        Ok(())
    }

    /// Re-read the file after an outside edit. Only subscribers whose value
    /// changed are notified.
    async fn reload(&self) -> remote::Result<()> {
        let notifications = {
            let mut doc = self.doc.lock().await;
            let current = match read_doc(&self.path).await {
                Ok(current) => current,
                // Another writer may be halfway through; its rename will fire again
                Err(RemoteError::Serialization(e)) => {
                    debug!("Skipping unreadable {}: {}", self.path.display(), e);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            if current == *doc {
                return Ok(());
            }
            let previous = std::mem::replace(&mut *doc, current);
            info!("Remote document changed on disk");
            self.collect(&doc, |sub| {
                value_at(&previous, &sub.path) != value_at(&doc, &sub.path)
            })
        };

        for (callback, value) in notifications {
            callback(value);
        }
        Ok(())
    }

    fn collect(
        &self,
        doc: &Value,
        wants: impl Fn(&Subscriber) -> bool,
    ) -> Vec<(SnapshotCallback, Option<Value>)> {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|sub| wants(sub))
            .map(|sub| (Arc::clone(&sub.callback), value_at(doc, &sub.path).cloned()))
            .collect()
    }
}

async fn read_doc(path: &Path) -> remote::Result<Value> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) if contents.trim().is_empty() => Ok(Value::Object(Map::new())),
        Ok(contents) => Ok(serde_json::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Value::Object(Map::new())),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(RemoteError::PermissionDenied(e.to_string()))
        }
        Err(e) => Err(RemoteError::Unavailable(e.to_string())),
    }
}

async fn write_doc(path: &Path, doc: &Value) -> remote::Result<()> {
    let contents = serde_json::to_string_pretty(doc)?;
    write_atomically(path, &contents).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => RemoteError::PermissionDenied(e.to_string()),
        std::io::ErrorKind::InvalidInput => RemoteError::InvalidPath(e.to_string()),
        _ => RemoteError::Unavailable(e.to_string()),
    })
}

#[async_trait]
impl RemoteStore for FileRemote {
    async fn read(&self, path: &str) -> remote::Result<Option<Value>> {
        let doc = self.shared.doc.lock().await;
        Ok(value_at(&doc, path).cloned())
    }

    async fn write(&self, path: &str, value: Value) -> remote::Result<()> {
        self.shared
            .apply(BTreeMap::from([(path.to_string(), value)]))
            .await
    }

    async fn atomic_update(&self, updates: BTreeMap<String, Value>) -> remote::Result<()> {
        self.shared.apply(updates).await
    }

    async fn subscribe(
        &self,
        path: &str,
        callback: SnapshotCallback,
    ) -> remote::Result<SubscriptionToken> {
        let token = SubscriptionToken(self.shared.next_token.fetch_add(1, Ordering::SeqCst));
        self.shared
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber {
                token,
                path: path.to_string(),
                callback,
            });
        debug!("Subscribed to {} ({:?})", path, token);
        Ok(token)
    }

    fn unsubscribe(&self, token: SubscriptionToken) {
        self.shared
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|sub| sub.token != token);
    }
}
