//! BookmarkStore trait abstraction for the host's local bookmark store.
//!
//! Implementations:
//! - `InMemoryBookmarks` - For testing, mirrors the browser's layout
//! - `JsonBookmarkFile` (in bookmark-sync-daemon) - A bookmarks file on disk
//!
//! The host exposes raw CRUD plus four change channels. Removal only reports
//! the id and the removed node as it was, which is why the engine keeps a mirror.

use crate::tree::{self, TreeNode};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum BookmarkError {
    #[error("Bookmark not found: {0}")]
    NotFound(String),

    #[error("Not a folder: {0}")]
    NotAFolder(String),

    #[error("Can't modify the root bookmark folders: {0}")]
    Protected(String),

    #[error("Host error: {0}")]
    Host(String),
}

pub type Result<T> = std::result::Result<T, BookmarkError>;

/// A node was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedEvent {
    pub id: String,
    pub node: TreeNode,
}

/// A node (and its subtree) was removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovedEvent {
    pub id: String,
    pub parent_id: String,
    pub index: u32,
    /// The removed node as it was, children included when the host reports them
    pub node: TreeNode,
}

/// Title or URL of a node changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangedEvent {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A node moved to another position or folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovedEvent {
    pub id: String,
    pub parent_id: String,
    pub index: u32,
    pub old_parent_id: String,
    pub old_index: u32,
}

/// Host-provided local bookmark store.
#[async_trait]
pub trait BookmarkStore: Send + Sync {
    /// Whole tree: a single invisible root whose children are the anchor folders
    async fn get_tree(&self) -> Result<Vec<TreeNode>>;

    /// Direct children of a folder
    async fn get_children(&self, parent_id: &str) -> Result<Vec<TreeNode>>;

    /// Create a folder (`url` = None) or a link at the end of `parent_id`
    async fn create_node(&self, parent_id: &str, title: &str, url: Option<&str>) -> Result<TreeNode>;

    /// Remove a node and everything below it
    async fn remove_subtree(&self, id: &str) -> Result<()>;

    fn on_created(&self) -> broadcast::Receiver<CreatedEvent>;
    fn on_removed(&self) -> broadcast::Receiver<RemovedEvent>;
    fn on_changed(&self) -> broadcast::Receiver<ChangedEvent>;
    fn on_moved(&self) -> broadcast::Receiver<MovedEvent>;
}

/// Id of the invisible host root
pub const ROOT_ID: &str = "0";

/// Anchor folders every host installation provides, with their stable ids
pub const ANCHORS: [(&str, &str); 3] = [
    ("1", "Bookmarks Bar"),
    ("2", "Other Bookmarks"),
    ("3", "Mobile Bookmarks"),
];

const CHANNEL_CAPACITY: usize = 1024;

struct Channels {
    created: broadcast::Sender<CreatedEvent>,
    removed: broadcast::Sender<RemovedEvent>,
    changed: broadcast::Sender<ChangedEvent>,
    moved: broadcast::Sender<MovedEvent>,
}

impl Channels {
    fn new() -> Self {
        Self {
            created: broadcast::channel(CHANNEL_CAPACITY).0,
            removed: broadcast::channel(CHANNEL_CAPACITY).0,
            changed: broadcast::channel(CHANNEL_CAPACITY).0,
            moved: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }
}

/// In-memory bookmark store for testing
pub struct InMemoryBookmarks {
    root: RwLock<TreeNode>,
    next_id: AtomicU64,
    channels: Channels,
}

impl InMemoryBookmarks {
    /// A fresh host: the root plus the three empty anchors.
    pub fn new() -> Self {
        let mut root = TreeNode::folder(ROOT_ID, "");
        root.children = Some(
            ANCHORS
                .iter()
                .enumerate()
                .map(|(index, (id, title))| {
                    let mut anchor = TreeNode::folder(*id, *title);
                    anchor.parent_id = Some(ROOT_ID.to_string());
                    anchor.index = Some(index as u32);
                    anchor
                })
                .collect(),
        );
        Self::from_root(root)
    }

    /// Wrap an existing host root (as returned by `get_tree()[0]`).
    pub fn from_root(root: TreeNode) -> Self {
        let next_id = max_numeric_id(&root) + 1;
        Self {
            root: RwLock::new(root),
            next_id: AtomicU64::new(next_id),
            channels: Channels::new(),
        }
    }

    /// Current root, cloned
    pub fn root(&self) -> TreeNode {
        self.root.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Swap in a tree edited outside of this store.
    ///
    /// The host has no event for "everything changed", so one `changed` event is
    /// emitted per anchor.
    pub fn replace_root(&self, root: TreeNode) {
        let anchors: Vec<TreeNode> = root.children().to_vec();
        let next_id = max_numeric_id(&root) + 1;
        *self.root.write().unwrap_or_else(|e| e.into_inner()) = root;
        self.next_id.fetch_max(next_id, Ordering::Relaxed);

        for anchor in anchors {
            let _ = self.channels.changed.send(ChangedEvent {
                id: anchor.id,
                title: anchor.title,
                url: None,
            });
        }
    }

    /// Rename a node or change its URL.
    pub fn change_node(&self, id: &str, title: &str, url: Option<&str>) -> Result<()> {
        {
            let mut root = self.root.write().unwrap_or_else(|e| e.into_inner());
            let node = tree::find_node_mut(std::slice::from_mut(&mut *root), id)
                .ok_or_else(|| BookmarkError::NotFound(id.to_string()))?;
            if node.is_link() != url.is_some() {
                return Err(BookmarkError::Host(format!("can't change kind of {}", id)));
            }
            node.title = title.to_string();
            node.url = url.map(str::to_string);
        }

        let _ = self.channels.changed.send(ChangedEvent {
            id: id.to_string(),
            title: title.to_string(),
            url: url.map(str::to_string),
        });
        Ok(())
    }

    /// Move a node into `parent_id` at `index` (clamped to the end).
    pub fn move_node(&self, id: &str, parent_id: &str, index: u32) -> Result<()> {
        let event = {
            let mut root = self.root.write().unwrap_or_else(|e| e.into_inner());
            if is_protected(id) {
                return Err(BookmarkError::Protected(id.to_string()));
            }
            let (mut node, old_parent_id, old_index) = detach(&mut root, id)?;

            let parent = tree::find_node_mut(std::slice::from_mut(&mut *root), parent_id)
                .ok_or_else(|| BookmarkError::NotFound(parent_id.to_string()))?;
            let children = parent
                .children
                .as_mut()
                .ok_or_else(|| BookmarkError::NotAFolder(parent_id.to_string()))?;
            let index = (index as usize).min(children.len());
            node.parent_id = Some(parent_id.to_string());
            children.insert(index, node);
            reindex(children);

            MovedEvent {
                id: id.to_string(),
                parent_id: parent_id.to_string(),
                index: index as u32,
                old_parent_id,
                old_index,
            }
        };

        let _ = self.channels.moved.send(event);
        Ok(())
    }
}

impl Default for InMemoryBookmarks {
    fn default() -> Self {
        Self::new()
    }
}

fn is_protected(id: &str) -> bool {
    id == ROOT_ID || ANCHORS.iter().any(|(anchor_id, _)| *anchor_id == id)
}

fn max_numeric_id(node: &TreeNode) -> u64 {
    let own = node.id.parse::<u64>().unwrap_or(0);
    node.children()
        .iter()
        .map(max_numeric_id)
        .fold(own, u64::max)
}

fn reindex(children: &mut [TreeNode]) {
    for (index, child) in children.iter_mut().enumerate() {
        child.index = Some(index as u32);
    }
}

fn parent_of(node: &TreeNode, id: &str) -> Option<String> {
    if node.children().iter().any(|child| child.id == id) {
        return Some(node.id.clone());
    }
    node.children().iter().find_map(|child| parent_of(child, id))
}

/// Take a node out of the tree, returning it with its old parent and position.
fn detach(root: &mut TreeNode, id: &str) -> Result<(TreeNode, String, u32)> {
    let node = tree::find_node(std::slice::from_ref(&*root), id)
        .ok_or_else(|| BookmarkError::NotFound(id.to_string()))?
        .clone();
    let parent_id = parent_of(root, id)
        .ok_or_else(|| BookmarkError::Protected(id.to_string()))?;

    let parent = tree::find_node_mut(std::slice::from_mut(root), &parent_id)
        .ok_or_else(|| BookmarkError::NotFound(parent_id.clone()))?;
    let siblings = parent.children.take().unwrap_or_default();
    let old_index = siblings
        .iter()
        .position(|child| child.id == id)
        .unwrap_or_default() as u32;
    let mut remaining = tree::remove_node(&siblings, id);
    reindex(&mut remaining);
    parent.children = Some(remaining);

    Ok((node, parent_id, old_index))
}

#[async_trait]
impl BookmarkStore for InMemoryBookmarks {
    async fn get_tree(&self) -> Result<Vec<TreeNode>> {
        Ok(vec![self.root()])
    }

    async fn get_children(&self, parent_id: &str) -> Result<Vec<TreeNode>> {
        let root = self.root.read().unwrap_or_else(|e| e.into_inner());
        let parent = tree::find_node(std::slice::from_ref(&*root), parent_id)
            .ok_or_else(|| BookmarkError::NotFound(parent_id.to_string()))?;
        Ok(parent.children().to_vec())
    }

    async fn create_node(&self, parent_id: &str, title: &str, url: Option<&str>) -> Result<TreeNode> {
        let node = {
            let mut root = self.root.write().unwrap_or_else(|e| e.into_inner());
            let parent = tree::find_node_mut(std::slice::from_mut(&mut *root), parent_id)
                .ok_or_else(|| BookmarkError::NotFound(parent_id.to_string()))?;
            if parent.is_link() {
                return Err(BookmarkError::NotAFolder(parent_id.to_string()));
            }

            let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
            let children = parent.children.get_or_insert_with(Vec::new);
            let mut node = match url {
                Some(url) => TreeNode::link(id, title, url),
                None => TreeNode::folder(id, title),
            };
            node.parent_id = Some(parent_id.to_string());
            node.index = Some(children.len() as u32);
            node.date_added = Some(crate::version::now_millis());
            children.push(node.clone());
            node
        };

        let _ = self.channels.created.send(CreatedEvent {
            id: node.id.clone(),
            node: node.clone(),
        });
        Ok(node)
    }

    async fn remove_subtree(&self, id: &str) -> Result<()> {
        if is_protected(id) {
            return Err(BookmarkError::Protected(id.to_string()));
        }

        let event = {
            let mut root = self.root.write().unwrap_or_else(|e| e.into_inner());
            let (node, parent_id, index) = detach(&mut root, id)?;
            RemovedEvent {
                id: id.to_string(),
                parent_id,
                index,
                node,
            }
        };

        let _ = self.channels.removed.send(event);
        Ok(())
    }

    fn on_created(&self) -> broadcast::Receiver<CreatedEvent> {
        self.channels.created.subscribe()
    }

    fn on_removed(&self) -> broadcast::Receiver<RemovedEvent> {
        self.channels.removed.subscribe()
    }

    fn on_changed(&self) -> broadcast::Receiver<ChangedEvent> {
        self.channels.changed.subscribe()
    }

    fn on_moved(&self) -> broadcast::Receiver<MovedEvent> {
        self.channels.moved.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_store_has_anchors() {
        let host = InMemoryBookmarks::new();
        let tree = host.get_tree().await.unwrap();

        assert_eq!(tree.len(), 1);
        let anchors: Vec<_> = tree[0].children().iter().map(|a| a.id.as_str()).collect();
        assert_eq!(anchors, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_create_and_remove_emit_events() {
        let host = InMemoryBookmarks::new();
        let mut created = host.on_created();
        let mut removed = host.on_removed();

        let folder = host.create_node("1", "Dev", None).await.unwrap();
        let link = host
            .create_node(&folder.id, "Github", Some("https://github.com"))
            .await
            .unwrap();

        assert_eq!(created.recv().await.unwrap().id, folder.id);
        assert_eq!(created.recv().await.unwrap().node.url.as_deref(), Some("https://github.com"));

        host.remove_subtree(&folder.id).await.unwrap();
        let event = removed.recv().await.unwrap();
        assert_eq!(event.id, folder.id);
        assert_eq!(event.parent_id, "1");
        assert_eq!(event.node.children()[0].id, link.id);
        assert!(host.get_children("1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_anchors_are_protected() {
        let host = InMemoryBookmarks::new();
        assert!(matches!(
            host.remove_subtree("1").await,
            Err(BookmarkError::Protected(_))
        ));
        assert!(matches!(
            host.remove_subtree("999").await,
            Err(BookmarkError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cannot_create_under_link() {
        let host = InMemoryBookmarks::new();
        let link = host.create_node("1", "A", Some("a.com")).await.unwrap();
        assert!(matches!(
            host.create_node(&link.id, "B", None).await,
            Err(BookmarkError::NotAFolder(_))
        ));
    }

    #[tokio::test]
    async fn test_move_and_change() {
        let host = InMemoryBookmarks::new();
        let mut moved = host.on_moved();
        let mut changed = host.on_changed();

        let a = host.create_node("1", "A", Some("a.com")).await.unwrap();
        host.create_node("1", "B", Some("b.com")).await.unwrap();

        host.move_node(&a.id, "2", 0).unwrap();
        let event = moved.recv().await.unwrap();
        assert_eq!(event.old_parent_id, "1");
        assert_eq!(event.old_index, 0);
        assert_eq!(event.parent_id, "2");

        let bar = host.get_children("1").await.unwrap();
        assert_eq!(bar.len(), 1);
        assert_eq!(bar[0].index, Some(0));

        host.change_node(&a.id, "A2", Some("a2.com")).unwrap();
        assert_eq!(changed.recv().await.unwrap().title, "A2");
        assert_eq!(host.get_children("2").await.unwrap()[0].url.as_deref(), Some("a2.com"));
    }

    #[tokio::test]
    async fn test_from_root_continues_ids() {
        let host = InMemoryBookmarks::new();
        host.create_node("1", "A", Some("a.com")).await.unwrap();
        let reopened = InMemoryBookmarks::from_root(host.root());

        let node = reopened.create_node("1", "B", Some("b.com")).await.unwrap();
        assert_eq!(node.id, "5");
    }
}
