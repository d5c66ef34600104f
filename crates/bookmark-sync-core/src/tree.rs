//! Bookmark tree shapes and the codec between them.
//!
//! - `TreeNode` - the host's native shape, including host-local ids, ordering
//!   and modification stamps.
//! - `CleanNode` - the transport shape written to the remote store. Only anchor
//!   folders (the fixed top-level folders every host provides) keep their id.
//!
//! The host's `get_tree()` returns a single invisible root whose children are the
//! anchor folders. Encoding drops that root and starts at the anchors.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("Invalid tree snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TreeError>;

/// A node as the host bookmark store reports it.
///
/// A node with `url` is a link and never has children. A node without `url`
/// is a folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Creation time in milliseconds since epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_added: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_group_modified: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<TreeNode>>,
}

impl TreeNode {
    /// Create an empty folder node.
    pub fn folder(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            index: None,
            title: title.into(),
            url: None,
            date_added: None,
            date_group_modified: None,
            children: Some(Vec::new()),
        }
    }

    /// Create a link node.
    pub fn link(id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            index: None,
            title: title.into(),
            url: Some(url.into()),
            date_added: None,
            date_group_modified: None,
            children: None,
        }
    }

    pub fn is_link(&self) -> bool {
        self.url.is_some()
    }

    pub fn children(&self) -> &[TreeNode] {
        self.children.as_deref().unwrap_or_default()
    }
}

/// Transport form of a bookmark node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanNode {
    /// Only set on anchor folders
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_added: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<CleanNode>>,
}

impl CleanNode {
    /// Anchor folder with its stable cross-device id.
    pub fn anchor(id: impl Into<String>, title: impl Into<String>, children: Vec<CleanNode>) -> Self {
        Self {
            id: Some(id.into()),
            title: title.into(),
            url: None,
            date_added: None,
            children: Some(children),
        }
    }

    pub fn folder(title: impl Into<String>, children: Vec<CleanNode>) -> Self {
        Self {
            id: None,
            title: title.into(),
            url: None,
            date_added: None,
            children: Some(children),
        }
    }

    pub fn link(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: None,
            title: title.into(),
            url: Some(url.into()),
            date_added: None,
            children: None,
        }
    }

    pub fn is_link(&self) -> bool {
        self.url.is_some()
    }

    pub fn children(&self) -> &[CleanNode] {
        self.children.as_deref().unwrap_or_default()
    }
}

/// Folder and link totals, recorded in version metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCount {
    pub folders: usize,
    pub links: usize,
}

// ============================================================================
// Codec
// ============================================================================

/// Encode the output of the host's `get_tree()` into transport form.
///
/// The invisible host root is skipped; its children are the anchors.
pub fn encode_tree(host_tree: &[TreeNode]) -> Vec<CleanNode> {
    let anchors: Vec<&TreeNode> = host_tree.iter().flat_map(|root| root.children()).collect();
    anchors.into_iter().map(encode_anchor).collect()
}

/// Encode a single anchor folder, keeping its id.
pub fn encode_anchor(anchor: &TreeNode) -> CleanNode {
    let mut clean = encode_node(anchor);
    clean.id = Some(anchor.id.clone());
    clean
}

/// Encode an ordinary node. Host-local ids, parent ids and ordering are dropped.
pub fn encode_node(node: &TreeNode) -> CleanNode {
    let children = if node.is_link() {
        None
    } else {
        node.children
            .as_ref()
            .map(|children| children.iter().map(encode_node).collect())
    };

    CleanNode {
        id: None,
        title: node.title.clone(),
        url: node.url.clone(),
        date_added: node.date_added,
        children,
    }
}

/// Decode a remote tree value.
///
/// Accepts `null` (no data yet), a JSON array, or an object keyed by array
/// indices, which is how document stores persist sparse arrays.
pub fn decode_tree(value: Option<Value>) -> Result<Vec<CleanNode>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .into_iter()
            .filter(|item| !item.is_null())
            .map(decode_node)
            .collect(),
        Some(Value::Object(map)) => {
            let mut indexed = Vec::with_capacity(map.len());
            for (key, item) in map {
                let index: usize = key
                    .parse()
                    .map_err(|_| TreeError::InvalidSnapshot(format!("non-index key '{}'", key)))?;
                indexed.push((index, item));
            }
            indexed.sort_by_key(|(index, _)| *index);
            indexed
                .into_iter()
                .filter(|(_, item)| !item.is_null())
                .map(|(_, item)| decode_node(item))
                .collect()
        }
        Some(other) => Err(TreeError::InvalidSnapshot(format!(
            "expected array, got {}",
            other
        ))),
    }
}

fn decode_node(value: Value) -> Result<CleanNode> {
    let mut node: CleanNode = serde_json::from_value(strip_children(value.clone()))?;
    if let Some(children) = value.get("children") {
        let decoded = decode_tree(Some(children.clone()))?;
        // Links never carry children, whatever the remote says
        node.children = if node.is_link() { None } else { Some(decoded) };
    }
    Ok(node)
}

fn strip_children(mut value: Value) -> Value {
    if let Value::Object(map) = &mut value {
        map.remove("children");
    }
    value
}

/// Serialize a transport tree for a remote write.
pub fn to_value(tree: &[CleanNode]) -> Result<Value> {
    Ok(serde_json::to_value(tree)?)
}

// ============================================================================
// Inspection helpers
// ============================================================================

/// Recursive node count (every folder and link, anchors included).
pub fn count_nodes(nodes: &[CleanNode]) -> usize {
    nodes.iter().map(|node| 1 + count_nodes(node.children())).sum()
}

/// Folder and link totals below the anchors.
pub fn count_items(tree: &[CleanNode]) -> ItemCount {
    fn walk(nodes: &[CleanNode], count: &mut ItemCount) {
        for node in nodes {
            if node.is_link() {
                count.links += 1;
            } else {
                count.folders += 1;
                walk(node.children(), count);
            }
        }
    }

    let mut count = ItemCount::default();
    for anchor in tree {
        walk(anchor.children(), &mut count);
    }
    count
}

/// True when any anchor has at least one child.
///
/// A tree made only of empty anchors counts as no data.
pub fn has_significant_data(tree: &[CleanNode]) -> bool {
    tree.iter().any(|anchor| !anchor.children().is_empty())
}

/// Number of nodes below the anchors.
pub fn content_count(tree: &[CleanNode]) -> usize {
    tree.iter().map(|anchor| count_nodes(anchor.children())).sum()
}

/// True when writing `after` over `before` would wipe a non-trivial collection.
pub fn is_destructive(before: &[CleanNode], after: &[CleanNode]) -> bool {
    content_count(before) > 1 && !has_significant_data(after)
}

/// Find a host node by id at any depth.
pub fn find_node<'a>(nodes: &'a [TreeNode], id: &str) -> Option<&'a TreeNode> {
    for node in nodes {
        if node.id == id {
            return Some(node);
        }
        if let Some(found) = find_node(node.children(), id) {
            return Some(found);
        }
    }
    None
}

/// Find a host node by id at any depth, mutably.
pub fn find_node_mut<'a>(nodes: &'a mut [TreeNode], id: &str) -> Option<&'a mut TreeNode> {
    for node in nodes {
        if node.id == id {
            return Some(node);
        }
        if let Some(children) = node.children.as_mut() {
            if let Some(found) = find_node_mut(children, id) {
                return Some(found);
            }
        }
    }
    None
}

/// Remove the node with `id` (and its subtree) at any depth.
///
/// Sibling order of everything else is preserved. An unknown id returns the
/// tree unchanged.
pub fn remove_node(nodes: &[TreeNode], id: &str) -> Vec<TreeNode> {
    nodes
        .iter()
        .filter(|node| node.id != id)
        .map(|node| {
            let mut node = node.clone();
            if let Some(children) = node.children.take() {
                node.children = Some(remove_node(&children, id));
            }
            node
        })
        .collect()
}
