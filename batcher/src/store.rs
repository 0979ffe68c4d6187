//! Graph store collaborator.
//!
//! `GraphStore` is the batched, read-mostly interface the batcher consumes.
//! `MemoryGraphStore` is an in-process implementation used by the CLI, the
//! Python bindings and the tests; it can be persisted as an rkyv snapshot.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use fixedbitset::FixedBitSet;
use rand::distr::weighted::WeightedIndex;
use rand::prelude::*;
use rayon::prelude::*;
use rkyv::{Archive, Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{BatchError, Result};
use crate::types::{FeatureEntry, LabeledNode, NodeId, WeightedEdge};

/// Batched access to a (possibly remote, partitioned) graph.
///
/// Every method is vector-in, vector-out. Implementations must tolerate
/// concurrent calls from several batch-building workers.
pub trait GraphStore: Send + Sync {
    /// Graph-context pairs for each node, in input order.
    fn lookup_context(&self, nodes: &[NodeId]) -> Result<Vec<Vec<WeightedEdge>>>;

    /// Aggregated neighborhood feature pairs for each node, in input order.
    fn lookup_neighbor_features(&self, nodes: &[NodeId]) -> Result<Vec<Vec<FeatureEntry>>>;

    /// The node's own feature pairs, in input order.
    fn lookup_node_features(&self, nodes: &[NodeId]) -> Result<Vec<Vec<FeatureEntry>>>;

    /// Up to `count` sampled out-edges per node, in input order.
    fn sample_neighbors(&self, nodes: &[NodeId], count: usize) -> Result<Vec<Vec<WeightedEdge>>>;

    /// Labeled nodes drawn for supervision.
    fn sample_instances(&self, count: usize) -> Result<Vec<LabeledNode>>;

    /// Nodes drawn from the whole graph, used as global shuffle candidates.
    fn sample_nodes(&self, count: usize) -> Result<Vec<NodeId>>;
}

// ============================================================================
// Sampling Policy
// ============================================================================

/// How `MemoryGraphStore::sample_neighbors` draws edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplingPolicy {
    /// Exactly `k` draws proportional to edge weight (duplicates possible).
    /// Falls back to uniform draws when every weight is zero.
    #[default]
    WeightedWithReplacement,
    /// `min(k, degree)` distinct edges, uniformly chosen.
    UniformWithoutReplacement,
}

// ============================================================================
// Snapshot Types
// ============================================================================

/// Everything the store knows about one node
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    /// Weighted out-edges
    pub neighbors: Vec<WeightedEdge>,
    /// Graph-context pairs (co-occurrence)
    pub contexts: Vec<WeightedEdge>,
    /// Own feature pairs
    pub features: Vec<FeatureEntry>,
    /// Label vector, if this node carries supervision
    pub labels: Option<Vec<i32>>,
}

impl NodeRecord {
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            neighbors: Vec::new(),
            contexts: Vec::new(),
            features: Vec::new(),
            labels: None,
        }
    }
}

#[derive(Debug, Archive, Serialize, Deserialize)]
struct GraphSnapshot {
    nodes: Vec<NodeRecord>,
}

// ============================================================================
// In-memory Store
// ============================================================================

pub struct MemoryGraphStore {
    records: Vec<NodeRecord>,
    index: HashMap<NodeId, usize>,
    /// Record offsets of nodes that carry labels
    labeled: Vec<usize>,
    policy: SamplingPolicy,
    seed: u64,
    /// Bumped on every sampling call so consecutive batches draw differently
    calls: AtomicU64,
}

impl MemoryGraphStore {
    pub fn new(records: Vec<NodeRecord>) -> Result<Self> {
        let mut index = HashMap::with_capacity(records.len());
        let mut labeled = Vec::new();

        for (offset, record) in records.iter().enumerate() {
            if index.insert(record.id, offset).is_some() {
                return Err(BatchError::Snapshot(format!(
                    "duplicate node record {}",
                    record.id
                )));
            }
            if let Some(edge) = record
                .neighbors
                .iter()
                .find(|e| !(e.weight.is_finite() && e.weight >= 0.0))
            {
                return Err(BatchError::Snapshot(format!(
                    "edge {} -> {} has invalid weight {}",
                    record.id, edge.node, edge.weight
                )));
            }
            if record.labels.is_some() {
                labeled.push(offset);
            }
        }

        Ok(Self {
            records,
            index,
            labeled,
            policy: SamplingPolicy::default(),
            seed: 0,
            calls: AtomicU64::new(0),
        })
    }

    pub fn with_policy(mut self, policy: SamplingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn policy(&self) -> SamplingPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn num_labeled(&self) -> usize {
        self.labeled.len()
    }

    pub fn num_edges(&self) -> usize {
        self.records.iter().map(|r| r.neighbors.len()).sum()
    }

    pub fn record(&self, node: NodeId) -> Option<&NodeRecord> {
        self.index.get(&node).map(|&offset| &self.records[offset])
    }

    fn require(&self, node: NodeId) -> Result<&NodeRecord> {
        self.record(node)
            .ok_or_else(|| BatchError::Lookup(format!("unknown node {}", node)))
    }

    fn next_call_seed(&self) -> u64 {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        self.seed
            .wrapping_add(call.wrapping_mul(0x9E37_79B9_7F4A_7C15))
    }

    fn sample_one(&self, record: &NodeRecord, count: usize, call_seed: u64) -> Vec<WeightedEdge> {
        let degree = record.neighbors.len();
        if degree == 0 || count == 0 {
            return Vec::new();
        }

        let mut rng = StdRng::seed_from_u64(call_seed.wrapping_add(record.id.0));

        match self.policy {
            SamplingPolicy::WeightedWithReplacement => {
                // f64 totals cannot overflow for finite f32 weights
                let weights = record.neighbors.iter().map(|e| e.weight as f64);
                match WeightedIndex::<f64>::new(weights) {
                    Ok(dist) => (0..count)
                        .map(|_| record.neighbors[dist.sample(&mut rng)])
                        .collect(),
                    // no usable weight mass, e.g. every weight is zero
                    Err(_) => (0..count)
                        .map(|_| record.neighbors[rng.random_range(0..degree)])
                        .collect(),
                }
            }
            SamplingPolicy::UniformWithoutReplacement => {
                let mut edges = record.neighbors.clone();
                let sample_count = degree.min(count);
                if degree > count {
                    // Fisher-Yates partial shuffle of the first sample_count slots
                    for i in 0..sample_count {
                        let j = rng.random_range(i..degree);
                        edges.swap(i, j);
                    }
                }
                edges.truncate(sample_count);
                edges
            }
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Save all node records as an rkyv snapshot.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let snapshot = GraphSnapshot {
            nodes: self.records.clone(),
        };
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&snapshot)
            .map_err(|e| BatchError::Snapshot(format!("serialization error: {e}")))?;
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&bytes)?;
        writer.flush()?;
        info!(
            "Saved graph snapshot with {} nodes to {:?}",
            self.records.len(),
            path.as_ref()
        );
        Ok(())
    }

    /// Load a snapshot written by `save`. Policy and seed start at their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let mut reader = BufReader::new(file);
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;

        let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
        aligned.extend_from_slice(&bytes);

        let snapshot = rkyv::from_bytes::<GraphSnapshot, rkyv::rancor::Error>(&aligned)
            .map_err(|e| BatchError::Snapshot(format!("deserialization error: {e}")))?;
        info!(
            "Loaded graph snapshot with {} nodes from {:?}",
            snapshot.nodes.len(),
            path.as_ref()
        );
        Self::new(snapshot.nodes)
    }
}

impl GraphStore for MemoryGraphStore {
    fn lookup_context(&self, nodes: &[NodeId]) -> Result<Vec<Vec<WeightedEdge>>> {
        nodes
            .par_iter()
            .map(|&node| self.require(node).map(|r| r.contexts.clone()))
            .collect()
    }

    fn lookup_neighbor_features(&self, nodes: &[NodeId]) -> Result<Vec<Vec<FeatureEntry>>> {
        nodes
            .par_iter()
            .map(|&node| {
                let record = self.require(node)?;
                let mut summed: HashMap<u64, f32> = HashMap::new();
                for edge in &record.neighbors {
                    // Neighbors without a record contribute nothing
                    let Some(neighbor) = self.record(edge.node) else {
                        continue;
                    };
                    for feat in &neighbor.features {
                        *summed.entry(feat.feature).or_insert(0.0) += edge.weight * feat.weight;
                    }
                }
                let mut entries: Vec<FeatureEntry> = summed
                    .into_iter()
                    .map(|(feature, weight)| FeatureEntry { feature, weight })
                    .collect();
                entries.sort_by_key(|e| e.feature);
                Ok(entries)
            })
            .collect()
    }

    fn lookup_node_features(&self, nodes: &[NodeId]) -> Result<Vec<Vec<FeatureEntry>>> {
        nodes
            .par_iter()
            .map(|&node| self.require(node).map(|r| r.features.clone()))
            .collect()
    }

    fn sample_neighbors(&self, nodes: &[NodeId], count: usize) -> Result<Vec<Vec<WeightedEdge>>> {
        let call_seed = self.next_call_seed();
        nodes
            .par_iter()
            .map(|&node| {
                let record = self.require(node)?;
                Ok(self.sample_one(record, count, call_seed))
            })
            .collect()
    }

    fn sample_instances(&self, count: usize) -> Result<Vec<LabeledNode>> {
        let pool = self.labeled.len();
        if pool == 0 {
            return Err(BatchError::Lookup(
                "store holds no labeled nodes".to_string(),
            ));
        }
        let target = if count > pool {
            warn!(
                "Requested {} labeled nodes but only {} exist; returning all of them",
                count, pool
            );
            pool
        } else {
            count
        };

        let mut rng = StdRng::seed_from_u64(self.next_call_seed());
        let mut visited = FixedBitSet::with_capacity(pool);
        let mut drawn = Vec::with_capacity(target);

        while drawn.len() < target {
            let i = rng.random_range(0..pool);
            if visited.contains(i) {
                continue;
            }
            visited.insert(i);

            let record = &self.records[self.labeled[i]];
            drawn.push(LabeledNode {
                node: record.id,
                labels: record.labels.clone().unwrap_or_default(),
            });
        }
        Ok(drawn)
    }

    fn sample_nodes(&self, count: usize) -> Result<Vec<NodeId>> {
        if self.records.is_empty() {
            return Err(BatchError::Lookup("store holds no nodes".to_string()));
        }
        let mut rng = StdRng::seed_from_u64(self.next_call_seed());
        Ok((0..count)
            .map(|_| self.records[rng.random_range(0..self.records.len())].id)
            .collect())
    }
}

// ============================================================================
// Tests
// ============================================================================
