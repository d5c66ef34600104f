//! Structural union of two bookmark trees.
//!
//! Anchors match by id, then by title. Below the anchors, links match by exact
//! URL and folders match by exact title among non-link siblings. Matched
//! folders are merged recursively; a matched link keeps the local copy as-is,
//! title included. Unmatched remote nodes are appended after the local ones.
//!
//! Remote nodes whose URL is in the tombstone list are dropped wherever they
//! appear, so a local deletion wins over the stale remote copy.

use crate::tree::CleanNode;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Merge `local` and `remote`, honoring `tombstones` (deleted link URLs).
///
/// Pure: neither input is modified. Output order is local first, then
/// unmatched remote nodes in remote order.
pub fn merge(local: &[CleanNode], remote: &[CleanNode], tombstones: &[String]) -> Vec<CleanNode> {
    let tombstones: HashSet<&str> = tombstones.iter().map(String::as_str).collect();
    let mut merged = local.to_vec();

    for remote_root in remote {
        let matched = remote_root
            .id
            .as_deref()
            .and_then(|id| merged.iter().position(|l| l.id.as_deref() == Some(id)))
            .or_else(|| merged.iter().position(|l| l.title == remote_root.title));

        match matched {
            Some(index) => {
                let local_root = &mut merged[index];
                let children = merge_children(local_root.children(), remote_root.children(), &tombstones);
                local_root.children = Some(children);
            }
            None => {
                if let Some(node) = without_tombstoned(remote_root, &tombstones) {
                    merged.push(node);
                }
            }
        }
    }

    merged
}

/// Sibling-list lookup for matching remote nodes against merged ones.
#[derive(Default)]
struct SiblingIndex {
    by_url: HashMap<String, usize>,
    folders_by_title: HashMap<String, usize>,
}

impl SiblingIndex {
    fn build(nodes: &[CleanNode]) -> Self {
        let mut index = Self::default();
        for (position, node) in nodes.iter().enumerate() {
            index.insert(node, position);
        }
        index
    }

    /// Record a node. The first node with a given key wins, like a linear scan would.
    fn insert(&mut self, node: &CleanNode, position: usize) {
        match &node.url {
            Some(url) => {
                self.by_url.entry(url.clone()).or_insert(position);
            }
            None => {
                self.folders_by_title
                    .entry(node.title.clone())
                    .or_insert(position);
            }
        }
    }

    fn find(&self, node: &CleanNode) -> Option<usize> {
        match &node.url {
            Some(url) => self.by_url.get(url).copied(),
            None => self.folders_by_title.get(&node.title).copied(),
        }
    }
}

fn merge_children(
    local: &[CleanNode],
    remote: &[CleanNode],
    tombstones: &HashSet<&str>,
) -> Vec<CleanNode> {
    let mut merged = local.to_vec();
    let mut index = SiblingIndex::build(&merged);

    for remote_node in remote {
        if is_tombstoned(remote_node, tombstones) {
            debug!(
                "Skipping locally deleted bookmark: {} ({})",
                remote_node.title,
                remote_node.url.as_deref().unwrap_or_default()
            );
            continue;
        }

        match index.find(remote_node) {
            Some(position) if !remote_node.is_link() => {
                let local_folder = &mut merged[position];
                let children =
                    merge_children(local_folder.children(), remote_node.children(), tombstones);
                local_folder.children = Some(children);
            }
            // Same URL: the local copy stands, title included
            Some(_) => {}
            None => {
                if let Some(node) = without_tombstoned(remote_node, tombstones) {
                    index.insert(&node, merged.len());
                    merged.push(node);
                }
            }
        }
    }

    merged
}

fn is_tombstoned(node: &CleanNode, tombstones: &HashSet<&str>) -> bool {
    node.url
        .as_deref()
        .is_some_and(|url| tombstones.contains(url))
}

/// Copy of a remote subtree with tombstoned links removed.
fn without_tombstoned(node: &CleanNode, tombstones: &HashSet<&str>) -> Option<CleanNode> {
    if is_tombstoned(node, tombstones) {
        return None;
    }

    let mut node = node.clone();
    if let Some(children) = node.children.take() {
        node.children = Some(
            children
                .iter()
                .filter_map(|child| without_tombstoned(child, tombstones))
                .collect(),
        );
    }
    Some(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::trees_are_equal;
    use crate::tree::count_nodes;

    fn bar(children: Vec<CleanNode>) -> CleanNode {
        CleanNode::anchor("1", "Bar", children)
    }

    fn titles(nodes: &[CleanNode]) -> Vec<&str> {
        nodes.iter().map(|n| n.title.as_str()).collect()
    }

    #[test]
    fn test_merge_disjoint_links_local_first() {
        let local = vec![bar(vec![CleanNode::link("Google", "http://google.com")])];
        let remote = vec![bar(vec![CleanNode::link("Bing", "http://bing.com")])];

        let result = merge(&local, &remote, &[]);

        assert_eq!(result.len(), 1);
        assert_eq!(titles(result[0].children()), vec!["Google", "Bing"]);
    }

    #[test]
    fn test_merge_deduplicates_by_url() {
        let local = vec![bar(vec![CleanNode::link("Google", "http://google.com")])];
        let remote = vec![bar(vec![CleanNode::link("Google", "http://google.com")])];

        let result = merge(&local, &remote, &[]);
        assert_eq!(result[0].children().len(), 1);
    }

    #[test]
    fn test_merge_folders_by_title_recursively() {
        let local = vec![bar(vec![CleanNode::folder(
            "Dev",
            vec![CleanNode::link("Github", "gh.com")],
        )])];
        let remote = vec![bar(vec![CleanNode::folder(
            "Dev",
            vec![CleanNode::link("Gitlab", "gl.com")],
        )])];

        let result = merge(&local, &remote, &[]);
        let dev = &result[0].children()[0];

        assert_eq!(dev.title, "Dev");
        assert_eq!(titles(dev.children()), vec!["Github", "Gitlab"]);
    }

    #[test]
    fn test_merge_appends_unmatched_anchor() {
        let local = vec![bar(vec![])];
        let remote = vec![
            bar(vec![]),
            CleanNode::anchor("2", "Other", vec![CleanNode::folder("Stuff", vec![])]),
        ];

        let result = merge(&local, &remote, &[]);
        assert_eq!(result.len(), 2);
        assert_eq!(result[1].id.as_deref(), Some("2"));
    }

    #[test]
    fn test_merge_anchor_falls_back_to_title() {
        let local = vec![CleanNode::anchor("1", "Bar", vec![CleanNode::link("A", "a.com")])];
        let remote = vec![CleanNode::folder("Bar", vec![CleanNode::link("B", "b.com")])];

        let result = merge(&local, &remote, &[]);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id.as_deref(), Some("1"));
        assert_eq!(result[0].children().len(), 2);
    }

    #[test]
    fn test_merge_anchor_id_beats_title() {
        let local = vec![
            CleanNode::anchor("1", "Other", vec![]),
            CleanNode::anchor("2", "Bar", vec![]),
        ];
        let remote = vec![CleanNode::anchor("2", "Other", vec![CleanNode::link("X", "x.com")])];

        let result = merge(&local, &remote, &[]);
        assert!(result[0].children().is_empty());
        assert_eq!(result[1].children().len(), 1);
    }

    #[test]
    fn test_merge_skips_tombstoned_remote_links() {
        let local = vec![bar(vec![
            CleanNode::link("Google", "https://google.com"),
            CleanNode::link("Local Only", "https://local.com"),
        ])];
        let remote = vec![bar(vec![
            CleanNode::link("Google", "https://google.com"),
            CleanNode::link("Remote Only", "https://remote.com"),
            CleanNode::link("Deleted Remote", "https://deleted.com"),
        ])];

        let result = merge(&local, &remote, &["https://deleted.com".to_string()]);

        assert_eq!(
            titles(result[0].children()),
            vec!["Google", "Local Only", "Remote Only"]
        );
    }

    #[test]
    fn test_merge_tombstones_apply_inside_unmatched_subtrees() {
        let local = vec![bar(vec![])];
        let remote = vec![
            bar(vec![CleanNode::folder(
                "New",
                vec![CleanNode::link("Gone", "gone.com"), CleanNode::link("Kept", "kept.com")],
            )]),
            CleanNode::anchor("3", "Mobile", vec![CleanNode::link("Gone", "gone.com")]),
        ];

        let result = merge(&local, &remote, &["gone.com".to_string()]);

        assert_eq!(titles(result[0].children()[0].children()), vec!["Kept"]);
        assert!(result[1].children().is_empty());
    }

    #[test]
    fn test_merge_url_match_keeps_local_title() {
        let local = vec![bar(vec![CleanNode::link("Mine", "http://same.com")])];
        let remote = vec![bar(vec![CleanNode::link("Theirs", "http://same.com")])];

        let result = merge(&local, &remote, &[]);
        assert_eq!(titles(result[0].children()), vec!["Mine"]);
    }

    #[test]
    fn test_merge_folder_does_not_match_link_with_same_title() {
        let local = vec![bar(vec![CleanNode::link("Docs", "docs.com")])];
        let remote = vec![bar(vec![CleanNode::folder("Docs", vec![])])];

        let result = merge(&local, &remote, &[]);
        assert_eq!(result[0].children().len(), 2);
    }

    #[test]
    fn test_merge_deduplicates_repeats_within_remote() {
        let local = vec![bar(vec![])];
        let remote = vec![bar(vec![
            CleanNode::link("A", "a.com"),
            CleanNode::link("A again", "a.com"),
        ])];

        let result = merge(&local, &remote, &[]);
        assert_eq!(titles(result[0].children()), vec!["A"]);
    }

    #[test]
    fn test_merge_is_idempotent_on_identical_input() {
        let tree = vec![
            bar(vec![
                CleanNode::folder("Dev", vec![CleanNode::link("Github", "gh.com")]),
                CleanNode::link("Google", "google.com"),
            ]),
            CleanNode::anchor("2", "Other", vec![CleanNode::link("News", "news.com")]),
        ];

        let result = merge(&tree, &tree, &[]);
        assert!(trees_are_equal(&result, &tree));
    }

    #[test]
    fn test_merge_disjoint_counts_add_up() {
        let local = vec![bar(vec![
            CleanNode::link("A", "a.com"),
            CleanNode::folder("F", vec![CleanNode::link("B", "b.com")]),
        ])];
        let remote = vec![bar(vec![
            CleanNode::link("C", "c.com"),
            CleanNode::link("D", "d.com"),
            CleanNode::folder("G", vec![]),
        ])];

        let result = merge(&local, &remote, &[]);
        assert_eq!(result[0].children().len(), 5);
        assert_eq!(count_nodes(&result), 1 + count_nodes(local[0].children()) + count_nodes(remote[0].children()));
    }

    #[test]
    fn test_merge_does_not_modify_inputs() {
        let local = vec![bar(vec![CleanNode::link("A", "a.com")])];
        let remote = vec![bar(vec![CleanNode::link("B", "b.com")])];
        let local_before = local.clone();

        let _ = merge(&local, &remote, &[]);
        assert_eq!(local, local_before);
    }
}
