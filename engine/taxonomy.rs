// ========================================================================================
//
//                               TAXONOMY ARENA
//
// ========================================================================================
//
// The engine's mirror of the haplogroup hierarchy: an arena of nodes indexed
// by integer id, children as name→id maps, and a single parent back-index
// used only for path reconstruction. Ownership stays single-rooted and the
// structure serializes without any pointer graph.
//
// Paths are inserted convergently: the tree shape does not depend on the
// order labels are processed. Nodes are created lazily the first time a path
// segment is seen and are never removed outside a full retrain.

use crate::family::TrainedLearner;
use crate::preprocess::FittedScaler;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const ROOT_NAME: &str = "ROOT";

pub type NodeId = usize;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxonomyNode {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent: Option<NodeId>,
    /// Child name → child id. Ordered so recursive walks are deterministic.
    pub children: BTreeMap<String, NodeId>,
    /// Attached once by the node trainer; absent on untrained nodes.
    #[serde(skip)]
    pub classifier: Option<TrainedLearner>,
    #[serde(skip)]
    pub scaler: Option<FittedScaler>,
}

impl TaxonomyNode {
    fn new(name: String, parent: Option<NodeId>) -> Self {
        Self {
            name,
            parent,
            children: BTreeMap::new(),
            classifier: None,
            scaler: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn is_trained(&self) -> bool {
        self.classifier.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxonomyArena {
    pub nodes: Vec<TaxonomyNode>,
    /// Training label → the terminal node of its inserted path.
    pub label_nodes: AHashMap<String, NodeId>,
}

impl Default for TaxonomyArena {
    fn default() -> Self {
        Self::new()
    }
}

impl TaxonomyArena {
    pub fn new() -> Self {
        Self {
            nodes: vec![TaxonomyNode::new(ROOT_NAME.to_string(), None)],
            label_nodes: AHashMap::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn get(&self, id: NodeId) -> &TaxonomyNode {
        &self.nodes[id]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut TaxonomyNode {
        &mut self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Walks a label path from the root, creating missing nodes, and records
    /// `label` as terminating at the path's last node. Empty paths attach
    /// the label to the root.
    pub fn insert_path(&mut self, label: &str, path: &[String]) -> NodeId {
        let mut current = self.root();
        for segment in path {
            if segment.is_empty() {
                continue;
            }
            let existing = self.nodes[current].children.get(segment).copied();
            current = match existing {
                Some(child) => child,
                None => {
                    let id = self.nodes.len();
                    self.nodes
                        .push(TaxonomyNode::new(segment.clone(), Some(current)));
                    self.nodes[current].children.insert(segment.clone(), id);
                    id
                }
            };
        }
        self.label_nodes.insert(label.to_string(), current);
        current
    }

    /// Node ids in pre-order (root first, children in name order).
    pub fn preorder(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            out.push(id);
            // Reverse so the lexically-first child is visited first.
            for &child in self.nodes[id].children.values().rev() {
                stack.push(child);
            }
        }
        out
    }

    /// Ancestor names from the root down to `id`, excluding the root.
    pub fn path_to(&self, id: NodeId) -> Vec<String> {
        let mut names = Vec::new();
        let mut at = id;
        while let Some(parent) = self.nodes[at].parent {
            names.push(self.nodes[at].name.clone());
            at = parent;
        }
        names.reverse();
        names
    }

    /// True when `ancestor` is `node` or one of its ancestors.
    pub fn is_ancestor_or_self(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut at = Some(node);
        while let Some(id) = at {
            if id == ancestor {
                return true;
            }
            at = self.nodes[id].parent;
        }
        false
    }

    /// The direct child of `node` on the path toward `descendant`, if
    /// `descendant` lies strictly below `node`.
    pub fn child_toward(&self, node: NodeId, descendant: NodeId) -> Option<NodeId> {
        let mut at = descendant;
        while let Some(parent) = self.nodes[at].parent {
            if parent == node {
                return Some(at);
            }
            at = parent;
        }
        None
    }

    /// Terminal node of a training label, when its path was inserted.
    pub fn label_node(&self, label: &str) -> Option<NodeId> {
        self.label_nodes.get(label).copied()
    }

    /// Count of nodes carrying a trained classifier.
    pub fn trained_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_trained()).count()
    }
}

/// The fallback 2-level path for a label with no resolvable external path:
/// `[prefix-before-separator, full-label]`, collapsed when the label has no
/// separator.
pub fn fallback_path(label: &str) -> Vec<String> {
    let prefix = label
        .split(|c: char| c == '-' || c == '/')
        .next()
        .unwrap_or(label);
    if prefix == label {
        vec![label.to_string()]
    } else {
        vec![prefix.to_string(), label.to_string()]
    }
}

/// Merges the two nomenclature systems' ancestor paths: union, de-duplicated,
/// first-seen order preserved.
pub fn merge_paths(primary: &[String], secondary: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(primary.len() + secondary.len());
    for name in primary.iter().chain(secondary.iter()) {
        if !name.is_empty() && !merged.iter().any(|m| m == name) {
            merged.push(name.clone());
        }
    }
    merged
}
