//! Persisted shadow of the local tree plus the tombstone set.
//!
//! The host's removal event only identifies what was removed, and the node it
//! reports may come without its subtree. The mirror remembers every node by its
//! host id so a removal can be turned into tombstones (deleted link URLs) that
//! the merge step honors.
//!
//! Event updates only touch memory; `flush` writes them out, so a burst of host
//! events costs one store write.

use crate::store::{self, KeyValueStore};
use crate::tree::TreeNode;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

pub const MIRROR_KEY: &str = "bookmarkMirror";
pub const TOMBSTONES_KEY: &str = "deletedUrls";

/// Last-known state of one host node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl MirrorEntry {
    fn from_node(node: &TreeNode, parent_id: Option<&str>) -> Self {
        Self {
            id: node.id.clone(),
            parent_id: parent_id
                .map(str::to_string)
                .or_else(|| node.parent_id.clone()),
            title: node.title.clone(),
            url: node.url.clone(),
        }
    }
}

pub struct Mirror {
    entries: HashMap<String, MirrorEntry>,
    /// Parent id to the ids of its known children
    children: HashMap<String, HashSet<String>>,
    tombstones: Vec<String>,
    store: Arc<dyn KeyValueStore>,
    entries_unsaved: bool,
    tombstones_unsaved: bool,
}

impl Mirror {
    /// Load the persisted mirror and tombstones (both empty on first run).
    pub async fn load(store: Arc<dyn KeyValueStore>) -> store::Result<Self> {
        let entries: HashMap<String, MirrorEntry> = match store.get(MIRROR_KEY).await? {
            Some(value) => serde_json::from_value(value)?,
            None => HashMap::new(),
        };
        let tombstones = match store.get(TOMBSTONES_KEY).await? {
            Some(value) => serde_json::from_value(value)?,
            None => Vec::new(),
        };

        let mut mirror = Self {
            entries: HashMap::with_capacity(entries.len()),
            children: HashMap::new(),
            tombstones,
            store,
            entries_unsaved: false,
            tombstones_unsaved: false,
        };
        for entry in entries.into_values() {
            mirror.insert_entry(entry);
        }
        Ok(mirror)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, id: &str) -> Option<&MirrorEntry> {
        self.entries.get(id)
    }

    pub fn tombstones(&self) -> &[String] {
        &self.tombstones
    }

    /// Whether changes are waiting for `flush`
    pub fn has_unsaved_changes(&self) -> bool {
        self.entries_unsaved || self.tombstones_unsaved
    }

    /// Populate from the host tree on first run. No-op once populated.
    pub async fn init_from_tree(&mut self, host_tree: &[TreeNode]) -> store::Result<()> {
        if !self.entries.is_empty() {
            return Ok(());
        }
        for node in host_tree {
            self.insert_subtree(node, None);
        }
        debug!("Mirror initialized with {} nodes", self.entries.len());
        self.entries_unsaved = true;
        self.flush().await
    }

    /// Replace all entries with the current host tree. Tombstones are kept.
    pub async fn rebuild(&mut self, host_tree: &[TreeNode]) -> store::Result<()> {
        self.entries.clear();
        self.children.clear();
        for node in host_tree {
            self.insert_subtree(node, None);
        }
        self.entries_unsaved = true;
        self.flush().await
    }

    pub fn record_created(&mut self, node: &TreeNode) {
        self.insert_subtree(node, None);
        self.entries_unsaved = true;
    }

    pub fn apply_change(&mut self, id: &str, title: &str, url: Option<&str>) {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.title = title.to_string();
                if url.is_some() {
                    entry.url = url.map(str::to_string);
                }
            }
            None => self.insert_entry(MirrorEntry {
                id: id.to_string(),
                parent_id: None,
                title: title.to_string(),
                url: url.map(str::to_string),
            }),
        }
        self.entries_unsaved = true;
    }

    pub fn apply_move(&mut self, id: &str, parent_id: &str) {
        if let Some(mut entry) = self.remove_entry(id) {
            entry.parent_id = Some(parent_id.to_string());
            self.insert_entry(entry);
            self.entries_unsaved = true;
        }
    }

    /// Forget a removed node and everything known below it.
    ///
    /// With `record_tombstones`, the URL of every removed link is added to the
    /// tombstone set. Returns the URLs that were newly tombstoned.
    pub fn forget(&mut self, removed: &TreeNode, record_tombstones: bool) -> Vec<String> {
        let mut urls = Vec::new();
        self.purge(removed, &mut urls);
        self.entries_unsaved = true;

        let mut added = Vec::new();
        if record_tombstones {
            for url in urls {
                if !self.tombstones.contains(&url) {
                    self.tombstones.push(url.clone());
                    added.push(url);
                }
            }
        }
        if !added.is_empty() {
            debug!("Tombstoned {} deleted link(s)", added.len());
            self.tombstones_unsaved = true;
        }
        added
    }

    /// Persist whatever changed since the last flush.
    pub async fn flush(&mut self) -> store::Result<()> {
        if self.entries_unsaved {
            self.store
                .set(MIRROR_KEY, serde_json::to_value(&self.entries)?)
                .await?;
            self.entries_unsaved = false;
        }
        if self.tombstones_unsaved {
            self.store
                .set(TOMBSTONES_KEY, serde_json::to_value(&self.tombstones)?)
                .await?;
            self.tombstones_unsaved = false;
        }
        Ok(())
    }

    /// Drop all tombstones after a successful sync consumed them.
    pub async fn clear_tombstones(&mut self) -> store::Result<()> {
        self.tombstones_unsaved = false;
        if self.tombstones.is_empty() {
            return Ok(());
        }
        self.tombstones.clear();
        self.store.remove(TOMBSTONES_KEY).await
    }

    fn insert_subtree(&mut self, node: &TreeNode, parent_id: Option<&str>) {
        self.insert_entry(MirrorEntry::from_node(node, parent_id));
        for child in node.children() {
            self.insert_subtree(child, Some(&node.id));
        }
    }

    fn insert_entry(&mut self, entry: MirrorEntry) {
        self.remove_entry(&entry.id);
        if let Some(parent_id) = &entry.parent_id {
            self.children
                .entry(parent_id.clone())
                .or_default()
                .insert(entry.id.clone());
        }
        self.entries.insert(entry.id.clone(), entry);
    }

    fn remove_entry(&mut self, id: &str) -> Option<MirrorEntry> {
        let entry = self.entries.remove(id)?;
        if let Some(parent_id) = &entry.parent_id {
            if let Some(siblings) = self.children.get_mut(parent_id) {
                siblings.remove(id);
                if siblings.is_empty() {
                    self.children.remove(parent_id);
                }
            }
        }
        Some(entry)
    }

    /// Remove `node`, its reported children and its mirrored children,
    /// collecting link URLs. The mirror's URL wins over the event's.
    fn purge(&mut self, node: &TreeNode, urls: &mut Vec<String>) {
        let entry = self.remove_entry(&node.id);
        let url = entry
            .as_ref()
            .and_then(|e| e.url.clone())
            .or_else(|| node.url.clone());
        if let Some(url) = url {
            urls.push(url);
        }

        for child in node.children() {
            self.purge(child, urls);
        }

        let known_children = self.children.remove(&node.id).unwrap_or_default();
        for id in known_children {
            if let Some(entry) = self.entries.get(&id).cloned() {
                let stub = match entry.url {
                    Some(url) => TreeNode::link(entry.id, entry.title, url),
                    None => TreeNode {
                        children: None,
                        ..TreeNode::folder(entry.id, entry.title)
                    },
                };
                self.purge(&stub, urls);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn host_root() -> TreeNode {
        let mut dev = TreeNode::folder("10", "Dev");
        dev.children = Some(vec![
            TreeNode::link("11", "Github", "https://github.com"),
            TreeNode::link("12", "Docs", "https://docs.rs"),
        ]);
        let mut bar = TreeNode::folder("1", "Bookmarks Bar");
        bar.children = Some(vec![dev, TreeNode::link("13", "News", "https://news.com")]);
        let mut root = TreeNode::folder("0", "");
        root.children = Some(vec![bar]);
        root
    }

    async fn loaded(store: &Arc<InMemoryStore>) -> Mirror {
        let mut mirror = Mirror::load(store.clone()).await.unwrap();
        mirror.init_from_tree(&[host_root()]).await.unwrap();
        mirror
    }

    #[tokio::test]
    async fn test_init_flattens_tree() {
        let store = Arc::new(InMemoryStore::new());
        let mirror = loaded(&store).await;

        assert_eq!(mirror.len(), 6);
        assert_eq!(mirror.get("11").unwrap().parent_id.as_deref(), Some("10"));
        assert!(store.snapshot(MIRROR_KEY).unwrap().get("13").is_some());
    }

    #[tokio::test]
    async fn test_forget_link_uses_mirrored_url() {
        let store = Arc::new(InMemoryStore::new());
        let mut mirror = loaded(&store).await;

        // The host reports the removed node without its URL
        let reported = TreeNode {
            url: None,
            children: None,
            ..TreeNode::folder("13", "News")
        };
        let added = mirror.forget(&reported, true);

        assert_eq!(added, vec!["https://news.com"]);
        assert!(mirror.get("13").is_none());
        assert!(store.snapshot(TOMBSTONES_KEY).is_none());

        mirror.flush().await.unwrap();
        assert_eq!(store.snapshot(TOMBSTONES_KEY), Some(json!(["https://news.com"])));
        assert!(store.snapshot(MIRROR_KEY).unwrap().get("13").is_none());
    }

    #[tokio::test]
    async fn test_forget_folder_purges_known_children() {
        let store = Arc::new(InMemoryStore::new());
        let mut mirror = loaded(&store).await;

        let reported = TreeNode {
            children: None,
            ..TreeNode::folder("10", "Dev")
        };
        let mut added = mirror.forget(&reported, true);
        added.sort();

        assert_eq!(added, vec!["https://docs.rs", "https://github.com"]);
        assert!(mirror.get("11").is_none());
        assert!(mirror.get("12").is_none());
        assert_eq!(mirror.len(), 3);
    }

    #[tokio::test]
    async fn test_forget_without_tombstones() {
        let store = Arc::new(InMemoryStore::new());
        let mut mirror = loaded(&store).await;

        let added = mirror.forget(&TreeNode::link("13", "News", "https://news.com"), false);

        assert!(added.is_empty());
        assert!(mirror.tombstones().is_empty());
        assert!(mirror.get("13").is_none());
    }

    #[tokio::test]
    async fn test_tombstones_survive_reload_and_clear() {
        let store = Arc::new(InMemoryStore::new());
        let mut mirror = loaded(&store).await;
        mirror.forget(&TreeNode::link("13", "News", "https://news.com"), true);
        mirror.forget(&TreeNode::link("99", "News again", "https://news.com"), true);
        mirror.flush().await.unwrap();

        let mut reloaded = Mirror::load(store.clone()).await.unwrap();
        assert_eq!(reloaded.tombstones(), ["https://news.com".to_string()]);

        reloaded.clear_tombstones().await.unwrap();
        assert!(reloaded.tombstones().is_empty());
        assert!(store.snapshot(TOMBSTONES_KEY).is_none());
    }

    #[tokio::test]
    async fn test_change_and_move_update_entries() {
        let store = Arc::new(InMemoryStore::new());
        let mut mirror = loaded(&store).await;

        mirror.apply_change("13", "Headlines", Some("https://news.org"));
        mirror.apply_move("13", "10");

        let entry = mirror.get("13").unwrap();
        assert_eq!(entry.title, "Headlines");
        assert_eq!(entry.url.as_deref(), Some("https://news.org"));
        assert_eq!(entry.parent_id.as_deref(), Some("10"));

        // Moved under Dev, so removing Dev takes it along
        let reported = TreeNode {
            children: None,
            ..TreeNode::folder("10", "Dev")
        };
        let added = mirror.forget(&reported, true);
        assert_eq!(added.len(), 3);
        assert!(added.contains(&"https://news.org".to_string()));
        assert!(mirror.get("13").is_none());
    }

    #[tokio::test]
    async fn test_event_updates_wait_for_flush() {
        let store = Arc::new(InMemoryStore::new());
        let mut mirror = loaded(&store).await;
        assert!(!mirror.has_unsaved_changes());

        for i in 0..50 {
            mirror.record_created(&TreeNode::link(
                format!("{}", 100 + i),
                "Link",
                format!("https://{}.com", i),
            ));
        }
        assert!(mirror.has_unsaved_changes());
        assert_eq!(store.snapshot(MIRROR_KEY).unwrap().as_object().unwrap().len(), 6);

        mirror.flush().await.unwrap();
        assert!(!mirror.has_unsaved_changes());
        assert_eq!(store.snapshot(MIRROR_KEY).unwrap().as_object().unwrap().len(), 56);

        let reloaded = Mirror::load(store.clone()).await.unwrap();
        assert_eq!(reloaded.len(), 56);
    }

    #[tokio::test]
    async fn test_reloaded_mirror_still_knows_children() {
        let store = Arc::new(InMemoryStore::new());
        loaded(&store).await;

        let mut reloaded = Mirror::load(store.clone()).await.unwrap();
        let reported = TreeNode {
            children: None,
            ..TreeNode::folder("1", "Bookmarks Bar")
        };
        let mut added = reloaded.forget(&reported, true);
        added.sort();

        assert_eq!(
            added,
            vec!["https://docs.rs", "https://github.com", "https://news.com"]
        );
        assert_eq!(reloaded.len(), 1);
    }
}
