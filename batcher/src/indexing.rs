//! Dense per-level positions for sparse node ids.

use std::collections::HashMap;

use crate::error::{BatchError, Result};
use crate::types::{NodeId, NodeSet};

/// Bijection between the nodes of one level and `0..n`.
///
/// Positions follow the iteration order of the source `NodeSet` (first-seen
/// order) and are only valid for the batch that built them.
#[derive(Debug, Clone, Default)]
pub struct Indexing {
    level: usize,
    positions: HashMap<NodeId, usize>,
    nodes: Vec<NodeId>,
}

impl Indexing {
    pub fn build(level: usize, nodes: &NodeSet) -> Self {
        let mut positions = HashMap::with_capacity(nodes.len());
        for (pos, &node) in nodes.iter().enumerate() {
            positions.insert(node, pos);
        }
        Self {
            level,
            positions,
            nodes: nodes.to_vec(),
        }
    }

    /// Dense position of `node`, or `NotIndexed` if it was not part of this level.
    pub fn position(&self, node: NodeId) -> Result<usize> {
        self.get(node).ok_or(BatchError::NotIndexed {
            node,
            level: self.level,
        })
    }

    pub fn get(&self, node: NodeId) -> Option<usize> {
        self.positions.get(&node).copied()
    }

    /// Inverse lookup
    pub fn node(&self, position: usize) -> Option<NodeId> {
        self.nodes.get(position).copied()
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Build one `Indexing` per level.
pub fn create_indexings(level_nodes: &[NodeSet]) -> Vec<Indexing> {
    level_nodes
        .iter()
        .enumerate()
        .map(|(level, nodes)| Indexing::build(level, nodes))
        .collect()
}
