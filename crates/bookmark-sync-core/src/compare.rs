//! Structural tree equality.
//!
//! Used to tell "same collection on both sides" apart from diverged histories.
//! Volatile timestamps (`date_added`) are ignored; titles, URLs, anchor ids and
//! shape are not.

use crate::tree::CleanNode;

/// Deep structural equality of two transport trees, position by position.
pub fn trees_are_equal(a: &[CleanNode], b: &[CleanNode]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| nodes_are_equal(x, y))
}

fn nodes_are_equal(a: &CleanNode, b: &CleanNode) -> bool {
    // Missing children and an empty child list are the same thing
    a.title == b.title
        && a.url == b.url
        && a.id == b.id
        && trees_are_equal(a.children(), b.children())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link_at(title: &str, url: &str, date_added: u64) -> CleanNode {
        CleanNode {
            date_added: Some(date_added),
            ..CleanNode::link(title, url)
        }
    }

    #[test]
    fn test_identical_simple_trees() {
        let t1 = vec![CleanNode::link("A", "u1")];
        let t2 = vec![CleanNode::link("A", "u1")];
        assert!(trees_are_equal(&t1, &t2));
    }

    #[test]
    fn test_ignores_timestamps() {
        let t1 = vec![link_at("A", "u1", 100)];
        let t2 = vec![link_at("A", "u1", 200)];
        assert!(trees_are_equal(&t1, &t2));
    }

    #[test]
    fn test_different_titles() {
        let t1 = vec![CleanNode::link("A", "u1")];
        let t2 = vec![CleanNode::link("B", "u1")];
        assert!(!trees_are_equal(&t1, &t2));
    }

    #[test]
    fn test_different_urls() {
        let t1 = vec![CleanNode::link("A", "u1")];
        let t2 = vec![CleanNode::link("A", "u2")];
        assert!(!trees_are_equal(&t1, &t2));
    }

    #[test]
    fn test_different_structure() {
        let t1 = vec![CleanNode::folder("Folder", vec![])];
        let t2 = vec![CleanNode::folder("Folder", vec![CleanNode::folder("b", vec![])])];
        assert!(!trees_are_equal(&t1, &t2));
    }

    #[test]
    fn test_different_lengths() {
        let t1 = vec![CleanNode::link("A", "u1")];
        let t2 = vec![CleanNode::link("A", "u1"), CleanNode::link("B", "u2")];
        assert!(!trees_are_equal(&t1, &t2));
    }

    #[test]
    fn test_missing_children_equals_empty() {
        let t1 = vec![CleanNode { children: None, ..CleanNode::folder("F", vec![]) }];
        let t2 = vec![CleanNode::folder("F", vec![])];
        assert!(trees_are_equal(&t1, &t2));
    }

    #[test]
    fn test_reflexive_on_nested_tree() {
        let tree = vec![
            CleanNode::anchor(
                "1",
                "Bar",
                vec![CleanNode::folder("Dev", vec![CleanNode::link("Github", "gh.com")])],
            ),
            CleanNode::anchor("2", "Other", vec![]),
        ];
        assert!(trees_are_equal(&tree, &tree.clone()));
    }
}
