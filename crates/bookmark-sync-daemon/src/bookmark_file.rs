//! Host bookmark store kept in a JSON file.
//!
//! The file holds the host root node (as `get_tree()[0]` reports it) with the
//! anchor folders as its children. Changes made through the store are written
//! back immediately. Edits made to the file by hand or by another program are
//! picked up by the watcher and reported as `changed` events on the anchors.

use crate::persistence::write_atomically;
use crate::watcher::FileWatcher;
use anyhow::Result as AnyResult;
use async_trait::async_trait;
use bookmark_sync_core::bookmarks::{
    self, BookmarkError, BookmarkStore, ChangedEvent, CreatedEvent, InMemoryBookmarks, MovedEvent,
    RemovedEvent,
};
use bookmark_sync_core::tree::TreeNode;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct JsonBookmarkFile {
    path: PathBuf,
    inner: InMemoryBookmarks,
    /// Exact file content we last wrote or loaded
    last_saved: Mutex<String>,
    watch_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl JsonBookmarkFile {
    /// Load the bookmarks at `path`, creating a fresh tree with the three
    /// empty anchors if the file doesn't exist.
    pub async fn open(path: impl Into<PathBuf>) -> bookmarks::Result<Self> {
        let path = path.into();
        let (inner, contents) = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let root = parse_root(&contents)?;
                (InMemoryBookmarks::from_root(root), contents)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Creating bookmarks file {}", path.display());
                (InMemoryBookmarks::new(), String::new())
            }
            Err(e) => return Err(BookmarkError::Host(e.to_string())),
        };

        let store = Self {
            path,
            inner,
            last_saved: Mutex::new(contents),
            watch_task: std::sync::Mutex::new(None),
        };
        store.save().await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current root, cloned
    pub fn root(&self) -> TreeNode {
        self.inner.root()
    }

    /// Rename a node or change its URL, then persist.
    pub async fn change_node(&self, id: &str, title: &str, url: Option<&str>) -> bookmarks::Result<()> {
        self.inner.change_node(id, title, url)?;
        self.save().await
    }

    /// Move a node, then persist.
    pub async fn move_node(&self, id: &str, parent_id: &str, index: u32) -> bookmarks::Result<()> {
        self.inner.move_node(id, parent_id, index)?;
        self.save().await
    }

    /// Pick up edits made to the file outside this process.
    pub fn start_watching(self: &Arc<Self>, debounce: Duration) -> AnyResult<()> {
        let mut task = self.watch_task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return Ok(());
        }

        let mut watcher = FileWatcher::new(self.path.clone(), debounce)?;
        // Weak so the task doesn't keep the store alive
        let store = Arc::downgrade(self);
        *task = Some(tokio::spawn(async move {
            while watcher.event_rx().recv().await.is_some() {
                while watcher.event_rx().try_recv().is_ok() {}
                let Some(store) = store.upgrade() else {
                    break;
                };
                if let Err(e) = store.reload().await {
                    warn!("Failed to reload {}: {}", store.path.display(), e);
                }
            }
        }));
        info!("Watching bookmarks file {}", self.path.display());
        Ok(())
    }

    /// Write the current tree unless the file already holds it.
    async fn save(&self) -> bookmarks::Result<()> {
        let mut last_saved = self.last_saved.lock().await;
        let contents = serde_json::to_string_pretty(&self.inner.root())
            .map_err(|e| BookmarkError::Host(e.to_string()))?;
        if contents == *last_saved {
            return Ok(());
        }
        write_atomically(&self.path, &contents)
            .await
            .map_err(|e| BookmarkError::Host(e.to_string()))?;
        *last_saved = contents;
        Ok(())
    }

    async fn reload(&self) -> bookmarks::Result<()> {
        let mut last_saved = self.last_saved.lock().await;
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Bookmarks file removed, keeping the loaded tree");
                return Ok(());
            }
            Err(e) => return Err(BookmarkError::Host(e.to_string())),
        };
        if contents == *last_saved {
            return Ok(());
        }

        let root = parse_root(&contents)?;
        info!("Bookmarks file changed on disk");
        self.inner.replace_root(root);
        *last_saved = contents;
        Ok(())
    }
}

impl Drop for JsonBookmarkFile {
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

fn parse_root(contents: &str) -> bookmarks::Result<TreeNode> {
    let root: TreeNode = serde_json::from_str(contents)
        .map_err(|e| BookmarkError::Host(format!("invalid bookmarks file: {}", e)))?;
    if root.is_link() {
        return Err(BookmarkError::NotAFolder(root.id));
    }
    Ok(root)
}

#[async_trait]
impl BookmarkStore for JsonBookmarkFile {
    async fn get_tree(&self) -> bookmarks::Result<Vec<TreeNode>> {
        self.inner.get_tree().await
    }

    async fn get_children(&self, parent_id: &str) -> bookmarks::Result<Vec<TreeNode>> {
        self.inner.get_children(parent_id).await
    }

    async fn create_node(
        &self,
        parent_id: &str,
        title: &str,
        url: Option<&str>,
    ) -> bookmarks::Result<TreeNode> {
        let node = self.inner.create_node(parent_id, title, url).await?;
        self.save().await?;
        Ok(node)
    }

    async fn remove_subtree(&self, id: &str) -> bookmarks::Result<()> {
        self.inner.remove_subtree(id).await?;
        self.save().await
    }

    fn on_created(&self) -> broadcast::Receiver<CreatedEvent> {
        self.inner.on_created()
    }

    fn on_removed(&self) -> broadcast::Receiver<RemovedEvent> {
        self.inner.on_removed()
    }

    fn on_changed(&self) -> broadcast::Receiver<ChangedEvent> {
        self.inner.on_changed()
    }

    fn on_moved(&self) -> broadcast::Receiver<MovedEvent> {
        self.inner.on_moved()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookmark_sync_core::tree::find_node;
    use tempfile::TempDir;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_missing_file_gets_default_anchors() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bookmarks.json");
        let store = JsonBookmarkFile::open(&path).await.unwrap();

        let titles: Vec<String> = store
            .root()
            .children()
            .iter()
            .map(|anchor| anchor.title.clone())
            .collect();
        assert_eq!(titles, ["Bookmarks Bar", "Other Bookmarks", "Mobile Bookmarks"]);

        let on_disk: TreeNode = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk, store.root());
    }

    #[tokio::test]
    async fn test_mutations_are_persisted() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bookmarks.json");
        let store = JsonBookmarkFile::open(&path).await.unwrap();

        let dev = store.create_node("1", "Dev", None).await.unwrap();
        let link = store
            .create_node(&dev.id, "Docs", Some("https://docs.rs"))
            .await
            .unwrap();
        store
            .change_node(&link.id, "Rust docs", Some("https://docs.rs"))
            .await
            .unwrap();
        store.move_node(&dev.id, "2", 0).await.unwrap();

        let reopened = JsonBookmarkFile::open(&path).await.unwrap();
        let root = reopened.root();
        let moved = find_node(std::slice::from_ref(&root), &dev.id).unwrap();
        assert_eq!(moved.parent_id.as_deref(), Some("2"));
        assert_eq!(moved.children()[0].title, "Rust docs");

        reopened.remove_subtree(&dev.id).await.unwrap();
        let again = JsonBookmarkFile::open(&path).await.unwrap();
        assert!(find_node(std::slice::from_ref(&again.root()), &dev.id).is_none());
    }

    #[tokio::test]
    async fn test_new_ids_continue_after_reload() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bookmarks.json");
        let first = JsonBookmarkFile::open(&path)
            .await
            .unwrap()
            .create_node("1", "A", Some("https://a.com"))
            .await
            .unwrap();

        let store = JsonBookmarkFile::open(&path).await.unwrap();
        let second = store
            .create_node("1", "B", Some("https://b.com"))
            .await
            .unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_outside_edit_emits_changed_events() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bookmarks.json");
        let store = Arc::new(JsonBookmarkFile::open(&path).await.unwrap());
        let mut changed = store.on_changed();
        store.start_watching(Duration::from_millis(50)).unwrap();

        let mut edited = store.root();
        edited.children.as_mut().unwrap()[0].children =
            Some(vec![TreeNode::link("40", "Added by hand", "https://hand.com")]);
        std::fs::write(&path, serde_json::to_string(&edited).unwrap()).unwrap();

        let event = timeout(Duration::from_secs(5), changed.recv())
            .await
            .expect("no change event within 5s")
            .unwrap();
        assert_eq!(event.id, "1");
        assert_eq!(store.root(), edited);
    }

    #[tokio::test]
    async fn test_invalid_file_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bookmarks.json");
        std::fs::write(&path, r#"{ "id": "0", "title": "", "url": "https://x.com" }"#).unwrap();

        assert!(matches!(
            JsonBookmarkFile::open(&path).await,
            Err(BookmarkError::NotAFolder(_))
        ));
    }
}
