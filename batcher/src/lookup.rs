//! Batched lookup operations over the graph store.
//!
//! Each variant issues exactly one store call per `run` and returns one list
//! per input node, in input order. A store failure or a response of the wrong
//! shape fails the whole call.

use std::sync::Arc;

use crate::error::{BatchError, Result};
use crate::store::GraphStore;
use crate::types::{FeatureEntry, NodeId, WeightedEdge};

/// A vector-in, vector-out lookup against the graph store.
pub trait DistLookup {
    type Entry;

    fn run(&self, nodes: &[NodeId]) -> Result<Vec<Vec<Self::Entry>>>;
}

fn check_shape<T>(op: &str, nodes: &[NodeId], results: Vec<Vec<T>>) -> Result<Vec<Vec<T>>> {
    if results.len() != nodes.len() {
        return Err(BatchError::Lookup(format!(
            "{} returned {} result lists for {} nodes",
            op,
            results.len(),
            nodes.len()
        )));
    }
    Ok(results)
}

/// Graph-context (co-occurrence) pairs per node.
#[derive(Clone)]
pub struct ContextLookup {
    store: Arc<dyn GraphStore>,
}

impl ContextLookup {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }
}

impl DistLookup for ContextLookup {
    type Entry = WeightedEdge;

    fn run(&self, nodes: &[NodeId]) -> Result<Vec<Vec<WeightedEdge>>> {
        if nodes.is_empty() {
            return Ok(Vec::new());
        }
        check_shape("context lookup", nodes, self.store.lookup_context(nodes)?)
    }
}

/// Aggregated neighborhood feature pairs per node.
#[derive(Clone)]
pub struct NeighborFeatureLookup {
    store: Arc<dyn GraphStore>,
}

impl NeighborFeatureLookup {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }
}

impl DistLookup for NeighborFeatureLookup {
    type Entry = FeatureEntry;

    fn run(&self, nodes: &[NodeId]) -> Result<Vec<Vec<FeatureEntry>>> {
        if nodes.is_empty() {
            return Ok(Vec::new());
        }
        check_shape(
            "neighbor feature lookup",
            nodes,
            self.store.lookup_neighbor_features(nodes)?,
        )
    }
}

/// A node's own feature pairs.
#[derive(Clone)]
pub struct NodeFeatureLookup {
    store: Arc<dyn GraphStore>,
}

impl NodeFeatureLookup {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }
}

impl DistLookup for NodeFeatureLookup {
    type Entry = FeatureEntry;

    fn run(&self, nodes: &[NodeId]) -> Result<Vec<Vec<FeatureEntry>>> {
        if nodes.is_empty() {
            return Ok(Vec::new());
        }
        check_shape(
            "node feature lookup",
            nodes,
            self.store.lookup_node_features(nodes)?,
        )
    }
}
