//! Decides whether the monitored surface is on screen.
//!
//! Two depth-first passes over the foreground tree, first hit wins:
//!   1. structural identifiers, exact set membership
//!   2. visible text and accessible labels, case-folded substring match
//!
//! The identifier pass is cheap and precise, so the keyword pass only runs
//! when it comes up empty.

use crate::tree::{TraversalError, UiNode};
use std::collections::HashSet;

/// Deeper trees are treated as a traversal failure.
pub const MAX_TREE_DEPTH: usize = 256;

/// `true` when `root` shows a node whose identifier is in `identifiers`, or
/// whose text or label contains one of `keywords`. Never fails: traversal
/// errors are logged and read as "not displayed".
pub fn detect(root: Option<&dyn UiNode>, identifiers: &HashSet<String>, keywords: &[&str]) -> bool {
    let Some(root) = root else {
        return false;
    };

    match try_detect(root, identifiers, keywords) {
        Ok(found) => found,
        Err(e) => {
            log::warn!("detector: traversal failed, skipping this cycle: {e}");
            false
        }
    }
}

fn try_detect(
    root: &dyn UiNode,
    identifiers: &HashSet<String>,
    keywords: &[&str],
) -> Result<bool, TraversalError> {
    if !identifiers.is_empty() {
        let by_id = any_node(root, 0, &mut |node| {
            Ok(node
                .view_id()?
                .is_some_and(|id| identifiers.contains(&id)))
        })?;
        if by_id {
            log::debug!("detector: matched structural identifier");
            return Ok(true);
        }
    }

    let folded: Vec<String> = keywords
        .iter()
        .filter(|k| !k.is_empty())
        .map(|k| k.to_lowercase())
        .collect();
    if folded.is_empty() {
        return Ok(false);
    }

    let by_text = any_node(root, 0, &mut |node| {
        let text = node.text()?.unwrap_or_default().to_lowercase();
        let label = node.content_description()?.unwrap_or_default().to_lowercase();
        Ok(folded
            .iter()
            .any(|k| text.contains(k.as_str()) || label.contains(k.as_str())))
    })?;
    if by_text {
        log::debug!("detector: matched keyword");
    }
    Ok(by_text)
}

/// Pre-order search. Each child handle is dropped, and so released, before
/// its next sibling is acquired.
fn any_node(
    node: &dyn UiNode,
    depth: usize,
    predicate: &mut dyn FnMut(&dyn UiNode) -> Result<bool, TraversalError>,
) -> Result<bool, TraversalError> {
    if depth > MAX_TREE_DEPTH {
        return Err(TraversalError::TooDeep(MAX_TREE_DEPTH));
    }
    if predicate(node)? {
        return Ok(true);
    }

    for i in 0..node.child_count()? {
        let Some(child) = node.child(i)? else {
            continue;
        };
        if any_node(&*child, depth + 1, predicate)? {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{SnapshotNode, SnapshotProvider, WindowTreeProvider};

    const YT_KEYWORDS: &[&str] = &["shorts", "short", "reel"];

    fn ids(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn run(tree: SnapshotNode, identifiers: &HashSet<String>, keywords: &[&str]) -> (bool, u64) {
        let provider = SnapshotProvider::new(Some(tree));
        let found = {
            let root = provider.root_in_active_window();
            detect(root.as_deref(), identifiers, keywords)
        };
        (found, provider.stats().outstanding())
    }

    #[test]
    fn test_absent_root_is_not_displayed() {
        assert!(!detect(None, &ids(&["a:id/b"]), YT_KEYWORDS));
    }

    #[test]
    fn test_identifier_match_deep_in_tree() {
        let tree = SnapshotNode::default().child(
            SnapshotNode::with_id("com.google.android.youtube:id/toolbar").child(
                SnapshotNode::default()
                    .child(SnapshotNode::with_id("com.google.android.youtube:id/reel_player_page")),
            ),
        );
        let (found, outstanding) = run(
            tree,
            &ids(&["com.google.android.youtube:id/reel_player_page"]),
            &[],
        );
        assert!(found);
        assert_eq!(outstanding, 0);
    }

    #[test]
    fn test_identifier_must_match_exactly() {
        let tree = SnapshotNode::default()
            .child(SnapshotNode::with_id("com.google.android.youtube:id/reel_player_page_x"));
        let (found, _) = run(tree, &ids(&["com.google.android.youtube:id/reel_player_page"]), &[]);
        assert!(!found);
    }

    #[test]
    fn test_keyword_match_is_case_folded() {
        let tree = SnapshotNode::default()
            .child(SnapshotNode::with_text("Home"))
            .child(SnapshotNode::with_text("Watch SHORTS now"));
        let (found, outstanding) = run(tree, &HashSet::new(), YT_KEYWORDS);
        assert!(found);
        assert_eq!(outstanding, 0);
    }

    #[test]
    fn test_keyword_match_on_accessible_label() {
        let tree = SnapshotNode::default().child(SnapshotNode::with_description("Reels tab"));
        let (found, _) = run(tree, &HashSet::new(), &["reels"]);
        assert!(found);
    }

    #[test]
    fn test_no_match() {
        let tree = SnapshotNode::default()
            .child(SnapshotNode::with_id("com.google.android.youtube:id/home"))
            .child(SnapshotNode::with_text("Subscriptions"));
        let (found, outstanding) = run(
            tree,
            &ids(&["com.google.android.youtube:id/reel_player_page"]),
            YT_KEYWORDS,
        );
        assert!(!found);
        assert_eq!(outstanding, 0);
    }

    #[test]
    fn test_traversal_error_degrades_to_false() {
        let mut stale = SnapshotNode::with_text("shorts");
        stale.stale = true;
        let tree = SnapshotNode::default().child(stale);
        let (found, outstanding) = run(tree, &HashSet::new(), YT_KEYWORDS);
        assert!(!found);
        assert_eq!(outstanding, 0);
    }

    #[test]
    fn test_depth_limit() {
        let mut tree = SnapshotNode::with_text("shorts");
        for _ in 0..(MAX_TREE_DEPTH + 5) {
            tree = SnapshotNode::default().child(tree);
        }
        let (found, outstanding) = run(tree, &HashSet::new(), YT_KEYWORDS);
        assert!(!found);
        assert_eq!(outstanding, 0);
    }
}
