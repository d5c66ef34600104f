//! RemoteStore trait abstraction for the shared per-user document store.
//!
//! Implementations:
//! - `InMemoryRemote` - For testing, one JSON document addressed by `/` paths
//! - `FileRemote` (in bookmark-sync-daemon) - One JSON document file, e.g. in a
//!   folder shared between devices
//!
//! Layout under `{namespace}/{uid}`:
//! - `tree` - the transport tree (array, or index-keyed object)
//! - `metadata` - the `VersionMetadata` of the last write

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Remote unavailable: {0}")]
    Unavailable(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Called with the full value at the subscribed path (`None` if absent).
pub type SnapshotCallback = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// Handle returned by `subscribe`, passed back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(pub u64);

/// Shared document store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Read the value at `path`
    async fn read(&self, path: &str) -> Result<Option<Value>>;

    /// Replace the value at `path`. Writing `Value::Null` removes it.
    async fn write(&self, path: &str, value: Value) -> Result<()>;

    /// Write several paths so that no reader sees some without the others
    async fn atomic_update(&self, updates: BTreeMap<String, Value>) -> Result<()>;

    /// Get notified after every write that touches `path` or anything below it.
    ///
    /// The callback does not fire for the value present at subscription time.
    async fn subscribe(&self, path: &str, callback: SnapshotCallback) -> Result<SubscriptionToken>;

    /// Stop a subscription. Unknown tokens are ignored.
    fn unsubscribe(&self, token: SubscriptionToken);
}

/// Paths of one user's data in the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePaths {
    root: String,
}

impl RemotePaths {
    pub fn new(namespace: &str, uid: &str) -> Self {
        Self {
            root: format!("{}/{}", namespace.trim_matches('/'), uid),
        }
    }

    /// Parent of both `tree` and `metadata`; subscriptions go here
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn tree(&self) -> String {
        format!("{}/tree", self.root)
    }

    pub fn metadata(&self) -> String {
        format!("{}/metadata", self.root)
    }
}

/// Split a path into its non-empty segments.
pub fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// True when one path is an ancestor of (or equal to) the other.
pub fn paths_overlap(a: &str, b: &str) -> bool {
    let a = path_segments(a);
    let b = path_segments(b);
    a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

struct Subscriber {
    token: SubscriptionToken,
    path: String,
    callback: SnapshotCallback,
}

/// In-memory remote store for testing
pub struct InMemoryRemote {
    doc: RwLock<Value>,
    subscribers: RwLock<Vec<Subscriber>>,
    next_token: AtomicU64,
    writes: AtomicUsize,
    subscribe_calls: AtomicUsize,
    fail_next: AtomicUsize,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self {
            doc: RwLock::new(Value::Object(Map::new())),
            subscribers: RwLock::new(Vec::new()),
            next_token: AtomicU64::new(1),
            writes: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
        }
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value at `path`, read synchronously
    pub fn get(&self, path: &str) -> Option<Value> {
        let doc = self.doc.read().unwrap_or_else(|e| e.into_inner());
        value_at(&doc, path).cloned()
    }

    /// Number of successful writes (an atomic update counts once)
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of `subscribe` calls so far
    pub fn subscribe_count(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Number of subscriptions still registered
    pub fn active_subscriptions(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Make the next `count` writes fail with `RemoteError::Unavailable`
    pub fn fail_next_writes(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> Result<()> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(RemoteError::Unavailable("injected failure".into())),
            Err(_) => Ok(()),
        }
    }

    fn apply(&self, updates: BTreeMap<String, Value>) -> Result<()> {
        self.take_injected_failure()?;

        let touched: Vec<String> = updates.keys().cloned().collect();
        {
            let mut doc = self.doc.write().unwrap_or_else(|e| e.into_inner());
            let mut next = doc.clone();
            for (path, value) in updates {
                set_value_at(&mut next, &path, value)?;
            }
            *doc = next;
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.notify(&touched);
        Ok(())
    }

    /// Fire every subscriber whose path overlaps a touched path, once each.
    fn notify(&self, touched: &[String]) {
        let targets: Vec<(String, SnapshotCallback)> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|sub| touched.iter().any(|path| paths_overlap(&sub.path, path)))
            .map(|sub| (sub.path.clone(), Arc::clone(&sub.callback)))
            .collect();

        for (path, callback) in targets {
            callback(self.get(&path));
        }
    }
}

/// Value at `path` inside a JSON document. Null counts as absent.
pub fn value_at<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path_segments(path) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    if current.is_null() { None } else { Some(current) }
}

/// Set the value at `path`, creating objects along the way. Null removes it.
pub fn set_value_at(doc: &mut Value, path: &str, value: Value) -> Result<()> {
    let segments = path_segments(path);
    let Some((last, parents)) = segments.split_last() else {
        return Err(RemoteError::InvalidPath(path.to_string()));
    };

    let mut current = doc;
    for segment in parents {
        if !current.is_object() {
            if value.is_null() {
                return Ok(());
            }
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return Err(RemoteError::InvalidPath(path.to_string()));
        };
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        if value.is_null() {
            map.remove(*last);
        } else {
            map.insert(last.to_string(), value);
        }
    }
    Ok(())
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn read(&self, path: &str) -> Result<Option<Value>> {
        Ok(self.get(path))
    }

    async fn write(&self, path: &str, value: Value) -> Result<()> {
        self.apply(BTreeMap::from([(path.to_string(), value)]))
    }

    async fn atomic_update(&self, updates: BTreeMap<String, Value>) -> Result<()> {
        self.apply(updates)
    }

    async fn subscribe(&self, path: &str, callback: SnapshotCallback) -> Result<SubscriptionToken> {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber {
                token,
                path: path.to_string(),
                callback,
            });
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        debug!("Subscribed to {} ({:?})", path, token);
        Ok(token)
    }

    fn unsubscribe(&self, token: SubscriptionToken) {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|sub| sub.token != token);
    }
}
