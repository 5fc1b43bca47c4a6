//! Execution tree: all session paths of a file merged into one prefix tree.
//!
//! Paths share nodes only along an unbroken common prefix. Once a path leaves
//! the existing tree it never joins it again, even when a later element matches
//! a node elsewhere:
//!
//! ```text
//! s1: start A B C        root
//! s2: start A B D         └─ start
//! s3: start A X B             └─ A
//!                                 ├─ B ─┬─ C
//!                                 │     └─ D
//!                                 └─ X ── B
//! ```
//!
//! Every session therefore stays one contiguous root-to-leaf path below its
//! divergence point, at the cost of duplicating revisited nodes.

use std::collections::BTreeSet;

use incr_graph_core::{FileGraph, NodeId, START_NODE_ID};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::session::{Session, SessionBook};

/// Id of the synthetic, never displayed root.
pub const ROOT_ID: &str = "root";

/// A node of the execution tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    /// Synthetic id, unique within one tree (`node{n}`).
    pub id: String,
    /// Graph node this tree node stands for.
    pub original_id: NodeId,
    /// Display label, `"{label} ({id})"` for known nodes.
    pub label: String,
    #[serde(default)]
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    fn root() -> Self {
        Self {
            id: ROOT_ID.to_string(),
            original_id: NodeId::new(ROOT_ID),
            label: ROOT_ID.to_string(),
            children: Vec::new(),
        }
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(TreeNode::size).sum::<usize>()
    }
}

/// One element of a live session path, as matched against the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathStep {
    pub node_id: NodeId,
    pub label: String,
}

/// Where a new node goes relative to the tree node it is inserted at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    Before,
    After,
}

/// Merge `paths` into a prefix tree. `label_of` names each element.
pub fn build_tree<F>(paths: &[Vec<NodeId>], label_of: F) -> TreeNode
where
    F: Fn(&NodeId) -> String,
{
    let mut root = TreeNode::root();
    let mut counter = 0usize;

    for path in paths {
        let mut cursor = &mut root;
        let mut diverged = false;

        for node_id in path {
            let shared = if diverged {
                None
            } else {
                cursor
                    .children
                    .iter()
                    .position(|c| &c.original_id == node_id)
            };

            let index = match shared {
                Some(index) => index,
                None => {
                    diverged = true;
                    counter += 1;
                    cursor.children.push(TreeNode {
                        id: format!("node{counter}"),
                        original_id: node_id.clone(),
                        label: label_of(node_id),
                        children: Vec::new(),
                    });
                    cursor.children.len() - 1
                }
            };
            cursor = &mut cursor.children[index];
        }
    }

    root
}

/// Root-to-target path (root excluded) via depth-first search.
pub fn find_path_to_node<'a>(tree: &'a TreeNode, target_id: &str) -> Option<Vec<&'a TreeNode>> {
    fn walk<'a>(node: &'a TreeNode, target_id: &str, acc: &mut Vec<&'a TreeNode>) -> bool {
        for child in &node.children {
            acc.push(child);
            if child.id == target_id || walk(child, target_id, acc) {
                return true;
            }
            acc.pop();
        }
        false
    }

    let mut acc = Vec::new();
    walk(tree, target_id, &mut acc).then_some(acc)
}

/// Match a live path against the tree below `node`, depth first with backtracking.
///
/// A step matches a child only if both its node id and its label agree; two
/// graph nodes may share a label.
pub fn find_execution_tree_node_path<'a>(
    node: &'a TreeNode,
    current: &[PathStep],
) -> Option<Vec<&'a TreeNode>> {
    fn walk<'a>(node: &'a TreeNode, current: &[PathStep], acc: &mut Vec<&'a TreeNode>) -> bool {
        let Some((head, rest)) = current.split_first() else {
            return true;
        };
        for child in &node.children {
            if child.original_id == head.node_id && child.label == head.label {
                acc.push(child);
                if walk(child, rest, acc) {
                    return true;
                }
                acc.pop();
            }
        }
        false
    }

    let mut acc = Vec::new();
    walk(node, current, &mut acc).then_some(acc)
}

/// Node-id sequence for a new session branching off `target_id`.
///
/// The original ids from the root to the target are taken, `new_node` is
/// spliced in before or after the target, and the synthetic markers are dropped.
pub fn branch_path(
    tree: &TreeNode,
    target_id: &str,
    new_node: &NodeId,
    placement: Placement,
) -> Option<Vec<NodeId>> {
    let path = find_path_to_node(tree, target_id)?;
    let mut ids: Vec<NodeId> = path.iter().map(|n| n.original_id.clone()).collect();

    match placement {
        Placement::Before => ids.insert(ids.len() - 1, new_node.clone()),
        Placement::After => ids.push(new_node.clone()),
    }

    ids.retain(|id| !matches!(id.as_str(), START_NODE_ID | ROOT_ID | ""));
    Some(ids)
}

// =============================================================================
// File-level tree
// =============================================================================

/// Execution tree of every session of one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTree {
    pub root: TreeNode,
}

/// Parent/child pair of tree node ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TreeEdge {
    pub source: String,
    pub target: String,
}

impl ExecutionTree {
    /// Build the tree from every session path, each prefixed with `start`.
    pub fn from_sessions(graph: &FileGraph, sessions: &SessionBook) -> Self {
        let paths: Vec<Vec<NodeId>> = sessions.iter().map(start_prefixed).collect();
        let root = build_tree(&paths, |id| step_label(graph, id));
        debug!(
            sessions = paths.len(),
            tree_nodes = root.size() - 1,
            "execution_tree_built"
        );
        Self { root }
    }

    /// Number of displayed nodes (root excluded).
    pub fn len(&self) -> usize {
        self.root.size() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }

    pub fn find_path_to_node(&self, target_id: &str) -> Option<Vec<&TreeNode>> {
        find_path_to_node(&self.root, target_id)
    }

    /// Ids of the tree nodes on the path of `session`.
    ///
    /// A path that cannot be matched (stale tree, renamed node) yields an empty set.
    pub fn highlight(&self, graph: &FileGraph, session: &Session) -> BTreeSet<String> {
        let current: Vec<PathStep> = start_prefixed(session)
            .into_iter()
            .map(|node_id| PathStep {
                label: step_label(graph, &node_id),
                node_id,
            })
            .collect();

        match find_execution_tree_node_path(&self.root, &current) {
            Some(path) => path.into_iter().map(|n| n.id.clone()).collect(),
            None => {
                warn!(session = %session.id, steps = current.len(), "execution_path_not_in_tree");
                BTreeSet::new()
            }
        }
    }

    /// See [`branch_path`].
    pub fn branch_path(
        &self,
        target_id: &str,
        new_node: &NodeId,
        placement: Placement,
    ) -> Option<Vec<NodeId>> {
        branch_path(&self.root, target_id, new_node, placement)
    }

    /// Every parent/child link, root links excluded.
    pub fn edges(&self) -> Vec<TreeEdge> {
        fn collect(node: &TreeNode, out: &mut Vec<TreeEdge>) {
            for child in &node.children {
                if node.id != ROOT_ID {
                    out.push(TreeEdge {
                        source: node.id.clone(),
                        target: child.id.clone(),
                    });
                }
                collect(child, out);
            }
        }

        let mut out = Vec::new();
        collect(&self.root, &mut out);
        out
    }
}

fn start_prefixed(session: &Session) -> Vec<NodeId> {
    std::iter::once(NodeId::start())
        .chain(session.path())
        .collect()
}

fn step_label(graph: &FileGraph, id: &NodeId) -> String {
    graph
        .node(id)
        .map(|n| n.display_label())
        .unwrap_or_else(|| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::executed_session;
    use incr_graph_core::{Node, NodeKind};

    fn ids(path: &[&str]) -> Vec<NodeId> {
        path.iter().map(|s| NodeId::new(*s)).collect()
    }

    fn plain(id: &NodeId) -> String {
        id.to_string()
    }

    fn child<'a>(node: &'a TreeNode, original: &str) -> Vec<&'a TreeNode> {
        node.children
            .iter()
            .filter(|c| c.original_id.as_str() == original)
            .collect()
    }

    #[test]
    fn test_shared_prefix_is_merged() {
        let tree = build_tree(&[ids(&["A", "B", "C"]), ids(&["A", "B", "D"])], plain);

        assert_eq!(tree.children.len(), 1);
        let a = &tree.children[0];
        assert_eq!(a.children.len(), 1);
        let b = &a.children[0];
        assert_eq!(b.original_id.as_str(), "B");
        let leaves: Vec<&str> = b.children.iter().map(|c| c.original_id.as_str()).collect();
        assert_eq!(leaves, vec!["C", "D"]);
        assert_eq!(tree.size(), 5);
    }

    #[test]
    fn test_diverged_path_never_remerges() {
        let tree = build_tree(&[ids(&["A", "B"]), ids(&["A", "X", "B"])], plain);

        let a = &tree.children[0];
        assert_eq!(a.children.len(), 2);
        let x = child(a, "X")[0];
        let b_again = &x.children[0];
        assert_eq!(b_again.original_id.as_str(), "B");
        assert_ne!(b_again.id, child(a, "B")[0].id);
    }

    #[test]
    fn test_identical_paths_share_everything() {
        let tree = build_tree(&[ids(&["A", "B"]), ids(&["A", "B"])], plain);
        assert_eq!(tree.size(), 3);
    }

    #[test]
    fn test_find_path_to_node_recovers_original_ids() {
        let tree = build_tree(&[ids(&["A", "B", "C"]), ids(&["A", "B", "D"])], plain);
        let d = child(&tree.children[0].children[0], "D")[0];

        let path = find_path_to_node(&tree, &d.id).unwrap();
        let originals: Vec<&str> = path.iter().map(|n| n.original_id.as_str()).collect();
        assert_eq!(originals, vec!["A", "B", "D"]);

        assert!(find_path_to_node(&tree, "node999").is_none());
    }

    #[test]
    fn test_live_path_matching_backtracks_on_labels() {
        // Two children with the same original id but different labels.
        let mut tree = TreeNode::root();
        for (id, label) in [("node1", "calc (n1) stale"), ("node2", "calc (n1)")] {
            tree.children.push(TreeNode {
                id: id.into(),
                original_id: NodeId::new("n1"),
                label: label.into(),
                children: Vec::new(),
            });
        }

        let current = vec![PathStep {
            node_id: NodeId::new("n1"),
            label: "calc (n1)".into(),
        }];
        let path = find_execution_tree_node_path(&tree, &current).unwrap();
        assert_eq!(path[0].id, "node2");

        let stale = vec![PathStep {
            node_id: NodeId::new("gone"),
            label: "gone".into(),
        }];
        assert!(find_execution_tree_node_path(&tree, &stale).is_none());
    }

    #[test]
    fn test_branch_before_and_after() {
        let tree = build_tree(&[ids(&["start", "A", "B", "C"])], plain);
        let b = &tree.children[0].children[0].children[0];
        assert_eq!(b.original_id.as_str(), "B");

        let before = branch_path(&tree, &b.id, &NodeId::new("N"), Placement::Before).unwrap();
        assert_eq!(before, ids(&["A", "N", "B"]));

        let after = branch_path(&tree, &b.id, &NodeId::new("N"), Placement::After).unwrap();
        assert_eq!(after, ids(&["A", "B", "N"]));

        assert!(branch_path(&tree, "missing", &NodeId::new("N"), Placement::After).is_none());
    }

    #[test]
    fn test_execution_tree_from_sessions_and_highlight() {
        let mut graph = FileGraph::empty();
        graph.upsert_node(Node::start());
        for id in ["A", "B", "C", "D"] {
            graph.upsert_node(Node::new(id, NodeKind::CodeFragment).with_label("step"));
        }

        let mut book = SessionBook::new();
        book.insert(executed_session("s1", &["A", "B", "C"]));
        book.insert(executed_session("s2", &["A", "B", "D"]));

        let tree = ExecutionTree::from_sessions(&graph, &book);
        assert_eq!(tree.len(), 5);
        assert_eq!(tree.root.children[0].label, "start (start)");
        assert_eq!(tree.edges().len(), 4);

        let lit = tree.highlight(&graph, book.get("s2").unwrap());
        assert_eq!(lit.len(), 4);
        let d = tree.root.children[0].children[0].children[0].children[1].clone();
        assert_eq!(d.label, "step (D)");
        assert!(lit.contains(&d.id));
    }

    #[test]
    fn test_highlight_of_unmatched_session_is_empty() {
        let graph = FileGraph::empty();
        let mut book = SessionBook::new();
        book.insert(executed_session("s1", &["A"]));
        let tree = ExecutionTree::from_sessions(&graph, &book);

        let stranger = executed_session("s2", &["Z"]);
        assert!(tree.highlight(&graph, &stranger).is_empty());
    }
}
