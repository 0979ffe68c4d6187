use std::collections::{HashMap, HashSet};
use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};

// ============================================================================
// Identifier Types
// ============================================================================

/// Global node identifier, meaningful only through the graph store
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Archive, Serialize, Deserialize,
)]
#[rkyv(derive(Debug, Hash, PartialEq, Eq))]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        NodeId(id)
    }
}

// ============================================================================
// Weighted Pairs
// ============================================================================

/// A (node, weight) pair returned by neighbor sampling and context lookups
#[derive(Debug, Clone, Copy, PartialEq, Archive, Serialize, Deserialize)]
pub struct WeightedEdge {
    pub node: NodeId,
    /// Non-negative edge weight
    pub weight: f32,
}

impl WeightedEdge {
    pub fn new(node: impl Into<NodeId>, weight: f32) -> Self {
        Self {
            node: node.into(),
            weight,
        }
    }
}

/// A (feature id, weight) pair describing a node or its aggregated neighborhood
#[derive(Debug, Clone, Copy, PartialEq, Archive, Serialize, Deserialize)]
pub struct FeatureEntry {
    pub feature: u64,
    pub weight: f32,
}

impl FeatureEntry {
    pub fn new(feature: u64, weight: f32) -> Self {
        Self { feature, weight }
    }
}

// ============================================================================
// Records
// ============================================================================

/// One training/prediction example as read from the record source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawRecord {
    /// Sequence-typed input (e.g. a random walk)
    Sequence(Vec<NodeId>),
    /// Node-typed input
    Node(NodeId),
}

/// A node drawn from the store together with its label vector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledNode {
    pub node: NodeId,
    pub labels: Vec<i32>,
}

// ============================================================================
// Node Sets
// ============================================================================

/// Duplicate-free node collection that keeps first-insertion order.
///
/// Iteration order is the order in which nodes were first inserted; every
/// downstream index table relies on this to be reproducible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSet {
    order: Vec<NodeId>,
    seen: HashSet<NodeId>,
}

impl NodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            order: Vec::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Insert a node, returning false if it was already present.
    pub fn insert(&mut self, node: NodeId) -> bool {
        if self.seen.insert(node) {
            self.order.push(node);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.seen.contains(node)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, NodeId> {
        self.order.iter()
    }

    pub fn as_slice(&self) -> &[NodeId] {
        &self.order
    }

    pub fn to_vec(&self) -> Vec<NodeId> {
        self.order.clone()
    }
}

impl FromIterator<NodeId> for NodeSet {
    fn from_iter<I: IntoIterator<Item = NodeId>>(iter: I) -> Self {
        let mut set = NodeSet::new();
        for node in iter {
            set.insert(node);
        }
        set
    }
}

impl<'a> IntoIterator for &'a NodeSet {
    type Item = &'a NodeId;
    type IntoIter = std::slice::Iter<'a, NodeId>;

    fn into_iter(self) -> Self::IntoIter {
        self.order.iter()
    }
}

// ============================================================================
// Sampled Subgraph
// ============================================================================

/// Parent node -> sampled out-edges, for one hop
pub type NeighborMap = HashMap<NodeId, Vec<WeightedEdge>>;

/// Result of a multi-hop expansion.
///
/// `level_nodes` has one entry per hop plus the seed level; `level_neighbors[i]`
/// holds the edges drawn from level `i` into level `i + 1`.
#[derive(Debug, Clone, Default)]
pub struct SubGraph {
    pub level_nodes: Vec<NodeSet>,
    pub level_neighbors: Vec<NeighborMap>,
}

impl SubGraph {
    /// Number of hops (fan-out levels)
    pub fn num_hops(&self) -> usize {
        self.level_neighbors.len()
    }

    /// Total number of node slots across all levels (duplicates across levels counted)
    pub fn total_nodes(&self) -> usize {
        self.level_nodes.iter().map(NodeSet::len).sum()
    }
}
