// Neighbor aggregation flow.
// Expands seed nodes hop by hop through the graph store, then turns the
// sampled subgraph into flat feature, adjacency, index and label tensors.
// Nothing here outlives a call: per-batch state is passed in and returned.

use std::sync::Arc;

use half::f16;
use rand::prelude::*;
use tracing::{debug, warn};

use crate::batch::{Batch, CsrFeatures, PAD_POSITION, PositionBlock, Tensor, WeightBlock, names};
use crate::error::{BatchError, Result};
use crate::indexing::Indexing;
use crate::lookup::{ContextLookup, DistLookup, NeighborFeatureLookup, NodeFeatureLookup};
use crate::store::GraphStore;
use crate::types::{FeatureEntry, LabeledNode, NeighborMap, NodeId, NodeSet, SubGraph};

/// Controls how shuffled (corrupted) node views are drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShuffleOptions {
    /// When false, no slot keeps the node it started with (where avoidable).
    pub allow_self: bool,
}

impl Default for ShuffleOptions {
    fn default() -> Self {
        Self { allow_self: true }
    }
}

fn flatten_levels(level_nodes: &[NodeSet]) -> Vec<NodeId> {
    level_nodes
        .iter()
        .flat_map(|level| level.iter().copied())
        .collect()
}

fn to_csr(rows: Vec<Vec<FeatureEntry>>) -> CsrFeatures {
    let mut csr = CsrFeatures::new();
    for row in rows {
        csr.push_row(row.into_iter().map(|e| (e.feature, e.weight)));
    }
    csr
}

pub struct NeighborAggregationFlow {
    store: Arc<dyn GraphStore>,
    context: ContextLookup,
    node_features: NodeFeatureLookup,
    neigh_features: NeighborFeatureLookup,
}

impl NeighborAggregationFlow {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self {
            context: ContextLookup::new(store.clone()),
            node_features: NodeFeatureLookup::new(store.clone()),
            neigh_features: NeighborFeatureLookup::new(store.clone()),
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    // ========================================================================
    // Node sets
    // ========================================================================

    /// Add `nodes` to `acc`, skipping ones already present.
    pub fn merge_to(&self, nodes: &[NodeId], acc: &mut NodeSet) {
        for &node in nodes {
            acc.insert(node);
        }
    }

    /// Add every member of every sequence to `acc`.
    pub fn merge_sequences_to(&self, seqs: &[Vec<NodeId>], acc: &mut NodeSet) {
        for seq in seqs {
            self.merge_to(seq, acc);
        }
    }

    // ========================================================================
    // Sampling
    // ========================================================================

    /// Breadth-first expansion with one batched sampling call per hop.
    ///
    /// Level 0 holds the deduplicated seeds; level `i` holds the union of the
    /// neighbors drawn for level `i - 1`. A node with no neighbors is recorded
    /// with an empty edge list. An empty frontier yields empty levels without
    /// calling the store, so there are always `fanouts.len() + 1` levels.
    pub fn sample_sub_graph(&self, seeds: &[NodeId], fanouts: &[usize]) -> Result<SubGraph> {
        let mut level_nodes = Vec::with_capacity(fanouts.len() + 1);
        let mut level_neighbors = Vec::with_capacity(fanouts.len());
        level_nodes.push(seeds.iter().copied().collect::<NodeSet>());

        for (hop, &fanout) in fanouts.iter().enumerate() {
            let frontier = level_nodes[hop].as_slice();
            let mut next = NodeSet::new();
            let mut neighbors = NeighborMap::with_capacity(frontier.len());

            if frontier.is_empty() {
                warn!("Empty frontier at hop {}; remaining levels are empty", hop);
            } else {
                let sampled = self.store.sample_neighbors(frontier, fanout)?;
                if sampled.len() != frontier.len() {
                    return Err(BatchError::Lookup(format!(
                        "neighbor sampling returned {} lists for {} nodes at hop {}",
                        sampled.len(),
                        frontier.len(),
                        hop
                    )));
                }
                for (&parent, edges) in frontier.iter().zip(sampled) {
                    for edge in &edges {
                        next.insert(edge.node);
                    }
                    neighbors.insert(parent, edges);
                }
            }

            debug!(
                "Hop {}: {} parents, fanout {}, {} unique neighbors",
                hop,
                frontier.len(),
                fanout,
                next.len()
            );
            level_neighbors.push(neighbors);
            level_nodes.push(next);
        }

        Ok(SubGraph {
            level_nodes,
            level_neighbors,
        })
    }

    // ========================================================================
    // Shuffled views
    // ========================================================================

    /// Permute the nodes of all levels (level 0 first, multiset preserved).
    ///
    /// With `allow_self == false` Sattolo's algorithm is used, so every slot
    /// receives an entry from a different slot. Duplicate ids across levels
    /// can still land on an equal value.
    pub fn shuffle_nodes_in_batch<R: Rng>(
        &self,
        level_nodes: &[NodeSet],
        options: &ShuffleOptions,
        rng: &mut R,
    ) -> Vec<NodeId> {
        let mut shuffled = flatten_levels(level_nodes);
        if options.allow_self {
            shuffled.shuffle(rng);
        } else {
            for i in (1..shuffled.len()).rev() {
                let j = rng.random_range(0..i);
                shuffled.swap(i, j);
            }
        }
        shuffled
    }

    /// Same shape as `shuffle_nodes_in_batch`, with entries drawn from the
    /// whole graph through one batched store call.
    ///
    /// With `allow_self == false`, a slot that drew its own node swaps with
    /// the first other slot for which the swap removes both collisions.
    pub fn shuffle_nodes_in_global(
        &self,
        level_nodes: &[NodeSet],
        options: &ShuffleOptions,
    ) -> Result<Vec<NodeId>> {
        let original = flatten_levels(level_nodes);
        let n = original.len();
        if n == 0 {
            return Ok(Vec::new());
        }

        let mut drawn = self.store.sample_nodes(n)?;
        if drawn.len() != n {
            return Err(BatchError::Lookup(format!(
                "global node sampling returned {} nodes, expected {}",
                drawn.len(),
                n
            )));
        }

        if !options.allow_self {
            for i in 0..n {
                if drawn[i] != original[i] {
                    continue;
                }
                let swap_with = (1..n)
                    .map(|step| (i + step) % n)
                    .find(|&j| drawn[j] != original[i] && drawn[i] != original[j]);
                if let Some(j) = swap_with {
                    drawn.swap(i, j);
                }
            }
        }
        Ok(drawn)
    }

    // ========================================================================
    // Feature fills
    // ========================================================================

    /// Node features for every level, one CSR matrix per level.
    pub fn fill_level_node_feature(
        &self,
        batch: &mut Batch,
        name: &str,
        level_nodes: &[NodeSet],
    ) -> Result<()> {
        let mut per_level = Vec::with_capacity(level_nodes.len());
        for level in level_nodes {
            per_level.push(to_csr(self.node_features.run(level.as_slice())?));
        }
        batch.insert(name, Tensor::Features(per_level));
        Ok(())
    }

    /// Aggregated neighbor features for every level, one CSR matrix per level.
    pub fn fill_level_neigh_feature(
        &self,
        batch: &mut Batch,
        name: &str,
        level_nodes: &[NodeSet],
    ) -> Result<()> {
        let mut per_level = Vec::with_capacity(level_nodes.len());
        for level in level_nodes {
            per_level.push(to_csr(self.neigh_features.run(level.as_slice())?));
        }
        batch.insert(name, Tensor::Features(per_level));
        Ok(())
    }

    /// Node features for a flat node list (duplicates allowed).
    pub fn fill_node_feature(&self, batch: &mut Batch, name: &str, nodes: &[NodeId]) -> Result<()> {
        let csr = to_csr(self.node_features.run(nodes)?);
        batch.insert(name, Tensor::Features(vec![csr]));
        Ok(())
    }

    /// Graph-context pairs for a flat node list; entries are context node ids.
    pub fn fill_context(&self, batch: &mut Batch, name: &str, nodes: &[NodeId]) -> Result<()> {
        let mut csr = CsrFeatures::new();
        for contexts in self.context.run(nodes)? {
            csr.push_row(contexts.into_iter().map(|e| (e.node.0, e.weight)));
        }
        batch.insert(name, Tensor::Features(vec![csr]));
        Ok(())
    }

    // ========================================================================
    // Graph blocks
    // ========================================================================

    /// Self and neighbor blocks for every hop.
    ///
    /// For hop `l`, row `r` of both blocks is the `r`-th node of level `l`.
    /// The self block holds that node's level-`l` position; the neighbor
    /// block holds level-`l + 1` positions of its sampled neighbors,
    /// truncated to `fanouts[l]` and padded with `-1`. A weight block named
    /// `names::weight_of(neigh_name)` is aligned with the neighbor block:
    /// raw sampled weights when `directed`, otherwise `w / sqrt(d_out * d_in)`
    /// with weighted degrees taken over the block.
    #[allow(clippy::too_many_arguments)]
    pub fn fill_self_and_neigh_graph_block(
        &self,
        batch: &mut Batch,
        self_name: &str,
        neigh_name: &str,
        sub_graph: &SubGraph,
        indexings: &[Indexing],
        fanouts: &[usize],
        directed: bool,
    ) -> Result<()> {
        let hops = sub_graph.num_hops();
        if indexings.len() != sub_graph.level_nodes.len() || fanouts.len() != hops {
            return Err(BatchError::Invariant(format!(
                "graph block needs {} indexings and {} fanouts, got {} and {}",
                sub_graph.level_nodes.len(),
                hops,
                indexings.len(),
                fanouts.len()
            )));
        }

        let mut self_blocks = Vec::with_capacity(hops);
        let mut neigh_blocks = Vec::with_capacity(hops);
        let mut weight_blocks = Vec::with_capacity(hops);

        for hop in 0..hops {
            let level = &sub_graph.level_nodes[hop];
            let neighbors = &sub_graph.level_neighbors[hop];
            let self_index = &indexings[hop];
            let next_index = &indexings[hop + 1];
            let fanout = fanouts[hop];
            let rows = level.len();

            let mut self_block = PositionBlock::new(rows, 1);
            let mut neigh_block = PositionBlock::new(rows, fanout);
            let mut raw_weights = vec![0.0f32; rows * fanout];

            for (r, &node) in level.iter().enumerate() {
                self_block.row_mut(r)[0] = self_index.position(node)? as i32;

                let Some(edges) = neighbors.get(&node) else {
                    continue;
                };
                let positions = neigh_block.row_mut(r);
                for (c, edge) in edges.iter().take(fanout).enumerate() {
                    positions[c] = next_index.position(edge.node)? as i32;
                    raw_weights[r * fanout + c] = edge.weight;
                }
            }

            if !directed {
                let mut out_degree = vec![0.0f32; rows];
                let mut in_degree = vec![0.0f32; next_index.len()];
                for (slot, &pos) in neigh_block.data.iter().enumerate() {
                    if pos >= 0 {
                        out_degree[slot / fanout] += raw_weights[slot];
                        in_degree[pos as usize] += raw_weights[slot];
                    }
                }
                for (slot, &pos) in neigh_block.data.iter().enumerate() {
                    if pos < 0 {
                        continue;
                    }
                    let norm = (out_degree[slot / fanout] * in_degree[pos as usize]).sqrt();
                    raw_weights[slot] = if norm > 0.0 {
                        raw_weights[slot] / norm
                    } else {
                        0.0
                    };
                }
            }

            let mut weight_block = WeightBlock::new(rows, fanout);
            for (dst, &w) in weight_block.data.iter_mut().zip(&raw_weights) {
                *dst = f16::from_f32(w);
            }

            self_blocks.push(self_block);
            neigh_blocks.push(neigh_block);
            weight_blocks.push(weight_block);
        }

        batch.insert(self_name, Tensor::Blocks(self_blocks));
        batch.insert(neigh_name, Tensor::Blocks(neigh_blocks));
        batch.insert(names::weight_of(neigh_name), Tensor::Weights(weight_blocks));
        Ok(())
    }

    // ========================================================================
    // Index and label fills
    // ========================================================================

    /// Dense positions of `nodes` when an indexing is given, raw ids otherwise.
    pub fn fill_node_or_index(
        &self,
        batch: &mut Batch,
        name: &str,
        nodes: &[NodeId],
        indexing: Option<&Indexing>,
    ) -> Result<()> {
        let tensor = match indexing {
            Some(indexing) => Tensor::Positions(
                nodes
                    .iter()
                    .map(|&node| indexing.position(node).map(|p| p as i32))
                    .collect::<Result<Vec<_>>>()?,
            ),
            None => Tensor::NodeIds(nodes.to_vec()),
        };
        batch.insert(name, tensor);
        Ok(())
    }

    /// Validate label vectors and write them as a `rows x num_label` matrix.
    ///
    /// Every vector must have length in `[1, num_label]` and values in
    /// `[0, max_label)`. Nothing is clipped: any violation fails the batch.
    pub fn fill_label_and_check(
        &self,
        batch: &mut Batch,
        name: &str,
        labeled: &[LabeledNode],
        num_label: usize,
        max_label: usize,
    ) -> Result<()> {
        let mut values = vec![PAD_POSITION; labeled.len() * num_label];

        for (r, item) in labeled.iter().enumerate() {
            let len = item.labels.len();
            if len == 0 || len > num_label {
                return Err(BatchError::Label {
                    node: item.node,
                    reason: format!("{} labels, expected 1..={}", len, num_label),
                });
            }
            for (c, &label) in item.labels.iter().enumerate() {
                if label < 0 || label as usize >= max_label {
                    return Err(BatchError::Label {
                        node: item.node,
                        reason: format!("label {} outside [0, {})", label, max_label),
                    });
                }
                values[r * num_label + c] = label;
            }
        }

        batch.insert(
            name,
            Tensor::Labels {
                width: num_label,
                values,
            },
        );
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexing::create_indexings;
    use crate::store::{MemoryGraphStore, NodeRecord, SamplingPolicy};
    use crate::types::WeightedEdge;

    /// Every node `i` in `0..n` links to `(i + 1) % n` and `(i + 2) % n`.
    fn store(n: u64) -> Arc<dyn GraphStore> {
        let records = (0..n)
            .map(|i| {
                let mut r = NodeRecord::new(i);
                r.neighbors = vec![
                    WeightedEdge::new((i + 1) % n, 1.0),
                    WeightedEdge::new((i + 2) % n, 3.0),
                ];
                r.features = vec![FeatureEntry::new(1000 + i, 1.0)];
                r.contexts = vec![WeightedEdge::new((i + 5) % n, 0.5)];
                r
            })
            .collect();
        Arc::new(
            MemoryGraphStore::new(records)
                .unwrap()
                .with_policy(SamplingPolicy::UniformWithoutReplacement)
                .with_seed(7),
        )
    }

    fn ids(v: &[u64]) -> Vec<NodeId> {
        v.iter().copied().map(NodeId).collect()
    }

    #[test]
    fn test_merge_to_dedups_and_keeps_order() {
        let flow = NeighborAggregationFlow::new(store(4));
        let mut acc = NodeSet::new();
        flow.merge_to(&ids(&[3, 1, 3]), &mut acc);
        flow.merge_to(&ids(&[2, 1, 0]), &mut acc);
        assert_eq!(acc.to_vec(), ids(&[3, 1, 2, 0]));

        let mut from_seqs = NodeSet::new();
        flow.merge_sequences_to(&[ids(&[5, 6]), ids(&[6, 7, 5])], &mut from_seqs);
        assert_eq!(from_seqs.to_vec(), ids(&[5, 6, 7]));
    }

    #[test]
    fn test_sample_sub_graph_level_counts() {
        let flow = NeighborAggregationFlow::new(store(10));
        for fanouts in [vec![1], vec![2, 2], vec![2, 1, 2]] {
            let sub = flow.sample_sub_graph(&ids(&[0, 4, 0]), &fanouts).unwrap();
            assert_eq!(sub.level_nodes.len(), fanouts.len() + 1);
            assert_eq!(sub.level_neighbors.len(), fanouts.len());
            assert_eq!(sub.level_nodes[0].to_vec(), ids(&[0, 4]));
        }
    }

    #[test]
    fn test_sample_sub_graph_records_edges_per_parent() {
        let flow = NeighborAggregationFlow::new(store(10));
        let sub = flow.sample_sub_graph(&ids(&[0, 5]), &[2]).unwrap();

        let edges = &sub.level_neighbors[0][&NodeId(0)];
        let mut drawn: Vec<u64> = edges.iter().map(|e| e.node.0).collect();
        drawn.sort();
        assert_eq!(drawn, vec![1, 2]);

        let level1 = &sub.level_nodes[1];
        assert_eq!(level1.len(), 4);
        for node in ids(&[1, 2, 6, 7]) {
            assert!(level1.contains(&node));
        }
    }

    #[test]
    fn test_sample_sub_graph_keeps_isolated_nodes() {
        let mut lonely = NodeRecord::new(1u64);
        lonely.features = vec![FeatureEntry::new(1, 1.0)];
        let mut linked = NodeRecord::new(2u64);
        linked.neighbors = vec![WeightedEdge::new(1u64, 1.0)];
        let store: Arc<dyn GraphStore> =
            Arc::new(MemoryGraphStore::new(vec![lonely, linked]).unwrap());
        let flow = NeighborAggregationFlow::new(store);

        let sub = flow.sample_sub_graph(&ids(&[1, 2]), &[3, 3]).unwrap();
        assert!(sub.level_neighbors[0][&NodeId(1)].is_empty());
        assert_eq!(sub.level_neighbors[0][&NodeId(2)].len(), 3);
        assert_eq!(sub.level_nodes[1].to_vec(), ids(&[1]));
        // node 1 has no edges, so the last level is empty but present
        assert!(sub.level_nodes[2].is_empty());
        assert_eq!(sub.level_nodes.len(), 3);
    }

    #[test]
    fn test_sample_sub_graph_fails_on_unknown_seed() {
        let flow = NeighborAggregationFlow::new(store(4));
        assert!(flow.sample_sub_graph(&ids(&[0, 99]), &[2]).unwrap_err().is_lookup());
    }

    #[test]
    fn test_shuffle_in_batch_is_a_permutation() {
        let flow = NeighborAggregationFlow::new(store(4));
        let levels: Vec<NodeSet> = vec![
            ids(&[1, 2, 3, 4]).into_iter().collect(),
            ids(&[3, 9]).into_iter().collect(),
        ];
        let mut rng = StdRng::seed_from_u64(1);

        for allow_self in [true, false] {
            let options = ShuffleOptions { allow_self };
            let shuffled = flow.shuffle_nodes_in_batch(&levels, &options, &mut rng);
            assert_eq!(shuffled.len(), 6);
            let mut sorted = shuffled.clone();
            sorted.sort();
            assert_eq!(sorted, ids(&[1, 2, 3, 3, 4, 9]));
        }
    }

    #[test]
    fn test_shuffle_in_batch_without_self_moves_every_slot() {
        let flow = NeighborAggregationFlow::new(store(4));
        let levels: Vec<NodeSet> = vec![(0..20).map(NodeId).collect()];
        let original = levels[0].to_vec();
        let options = ShuffleOptions { allow_self: false };

        for seed in 0..10 {
            let mut rng = StdRng::seed_from_u64(seed);
            let shuffled = flow.shuffle_nodes_in_batch(&levels, &options, &mut rng);
            assert!(shuffled.iter().zip(&original).all(|(a, b)| a != b));
        }
    }

    #[test]
    fn test_shuffle_in_global_draws_from_store() {
        let flow = NeighborAggregationFlow::new(store(50));
        let levels: Vec<NodeSet> = vec![
            ids(&[1, 2, 3]).into_iter().collect(),
            ids(&[4, 5]).into_iter().collect(),
        ];
        let options = ShuffleOptions { allow_self: false };
        let shuffled = flow.shuffle_nodes_in_global(&levels, &options).unwrap();
        assert_eq!(shuffled.len(), 5);
        assert!(shuffled.iter().all(|n| n.0 < 50));
        let original = flatten_levels(&levels);
        assert!(shuffled.iter().zip(&original).all(|(a, b)| a != b));
    }

    #[test]
    fn test_fill_level_features() {
        let flow = NeighborAggregationFlow::new(store(6));
        let sub = flow.sample_sub_graph(&ids(&[0, 3]), &[2]).unwrap();
        let mut batch = Batch::new();

        flow.fill_level_node_feature(&mut batch, names::NODE_FEATURE, &sub.level_nodes)
            .unwrap();
        flow.fill_level_neigh_feature(&mut batch, names::NEIGH_FEATURE, &sub.level_nodes)
            .unwrap();

        let node_feats = batch.features(names::NODE_FEATURE).unwrap();
        assert_eq!(node_feats.len(), 2);
        assert_eq!(node_feats[0].num_rows(), 2);
        assert_eq!(node_feats[0].row(1).0, &[1003]);
        assert_eq!(node_feats[1].num_rows(), sub.level_nodes[1].len());

        let neigh_feats = batch.features(names::NEIGH_FEATURE).unwrap();
        // node 0 -> 1 (w=1) and 2 (w=3)
        assert_eq!(neigh_feats[0].row(0).0, &[1001, 1002]);
        assert_eq!(
            neigh_feats[0].row(0).1,
            &[f16::from_f32(1.0), f16::from_f32(3.0)]
        );
    }

    #[test]
    fn test_fill_node_feature_and_context() {
        let flow = NeighborAggregationFlow::new(store(6));
        let mut batch = Batch::new();
        flow.fill_node_feature(&mut batch, names::NODE_SHUFFLED_FEATURE, &ids(&[2, 2, 5]))
            .unwrap();
        flow.fill_context(&mut batch, "context", &ids(&[0])).unwrap();

        let feats = &batch.features(names::NODE_SHUFFLED_FEATURE).unwrap()[0];
        assert_eq!(feats.num_rows(), 3);
        assert_eq!(feats.row(0).0, feats.row(1).0);

        let context = &batch.features("context").unwrap()[0];
        assert_eq!(context.row(0).0, &[5]);
    }

    #[test]
    fn test_graph_block_rows_are_aligned() {
        let flow = NeighborAggregationFlow::new(store(12));
        let fanouts = [2, 2];
        let sub = flow.sample_sub_graph(&ids(&[0, 6, 9]), &fanouts).unwrap();
        let indexings = create_indexings(&sub.level_nodes);
        let mut batch = Batch::new();

        flow.fill_self_and_neigh_graph_block(
            &mut batch,
            names::SELF_BLOCK,
            names::NEIGH_BLOCK,
            &sub,
            &indexings,
            &fanouts,
            true,
        )
        .unwrap();

        let self_blocks = batch.blocks(names::SELF_BLOCK).unwrap();
        let neigh_blocks = batch.blocks(names::NEIGH_BLOCK).unwrap();
        assert_eq!(self_blocks.len(), 2);
        assert_eq!(neigh_blocks.len(), 2);

        for hop in 0..2 {
            assert_eq!(neigh_blocks[hop].cols, 2);
            assert_eq!(self_blocks[hop].rows, neigh_blocks[hop].rows);
            for r in 0..self_blocks[hop].rows {
                let node = indexings[hop]
                    .node(self_blocks[hop].row(r)[0] as usize)
                    .unwrap();
                let expected: Vec<NodeId> = sub.level_neighbors[hop][&node]
                    .iter()
                    .map(|e| e.node)
                    .collect();
                let actual: Vec<NodeId> = neigh_blocks[hop]
                    .row(r)
                    .iter()
                    .map(|&p| indexings[hop + 1].node(p as usize).unwrap())
                    .collect();
                assert_eq!(actual, expected);
            }
        }

        let weights = batch
            .weights(&names::weight_of(names::NEIGH_BLOCK))
            .unwrap();
        assert_eq!(weights[0].rows, 3);
    }

    #[test]
    fn test_graph_block_pads_and_truncates() {
        let flow = NeighborAggregationFlow::new(store(8));
        let sub = SubGraph {
            level_nodes: vec![
                ids(&[0, 1]).into_iter().collect(),
                ids(&[5, 6, 7]).into_iter().collect(),
            ],
            level_neighbors: vec![NeighborMap::from([
                (
                    NodeId(0),
                    vec![
                        WeightedEdge::new(5u64, 1.0),
                        WeightedEdge::new(6u64, 1.0),
                        WeightedEdge::new(7u64, 1.0),
                    ],
                ),
                (NodeId(1), vec![WeightedEdge::new(7u64, 2.0)]),
            ])],
        };
        let indexings = create_indexings(&sub.level_nodes);
        let mut batch = Batch::new();
        flow.fill_self_and_neigh_graph_block(
            &mut batch, "s", "n", &sub, &indexings, &[2], true,
        )
        .unwrap();

        let neigh = &batch.blocks("n").unwrap()[0];
        assert_eq!(neigh.row(0), &[0, 1]);
        assert_eq!(neigh.row(1), &[2, -1]);
        let weights = &batch.weights("n_weight").unwrap()[0];
        assert_eq!(weights.row(1), &[f16::from_f32(2.0), f16::ZERO]);
        assert_eq!(batch.blocks("s").unwrap()[0].data, vec![0, 1]);
    }

    #[test]
    fn test_undirected_block_is_symmetrically_normalized() {
        let flow = NeighborAggregationFlow::new(store(8));
        let sub = SubGraph {
            level_nodes: vec![
                ids(&[0, 1]).into_iter().collect(),
                ids(&[5]).into_iter().collect(),
            ],
            level_neighbors: vec![NeighborMap::from([
                (NodeId(0), vec![WeightedEdge::new(5u64, 1.0)]),
                (NodeId(1), vec![WeightedEdge::new(5u64, 3.0)]),
            ])],
        };
        let indexings = create_indexings(&sub.level_nodes);
        let mut batch = Batch::new();
        flow.fill_self_and_neigh_graph_block(
            &mut batch, "s", "n", &sub, &indexings, &[1], false,
        )
        .unwrap();

        // d_in(5) = 4; row 0: 1 / sqrt(1 * 4), row 1: 3 / sqrt(3 * 4)
        let weights = &batch.weights("n_weight").unwrap()[0];
        assert_eq!(weights.row(0)[0], f16::from_f32(0.5));
        assert_eq!(weights.row(1)[0], f16::from_f32(3.0 / 12.0f32.sqrt()));
    }

    #[test]
    fn test_graph_block_rejects_unindexed_neighbor() {
        let flow = NeighborAggregationFlow::new(store(8));
        let sub = SubGraph {
            level_nodes: vec![
                ids(&[0]).into_iter().collect(),
                ids(&[5]).into_iter().collect(),
            ],
            level_neighbors: vec![NeighborMap::from([(
                NodeId(0),
                vec![WeightedEdge::new(6u64, 1.0)],
            )])],
        };
        let indexings = create_indexings(&sub.level_nodes);
        let err = flow
            .fill_self_and_neigh_graph_block(
                &mut Batch::new(),
                "s",
                "n",
                &sub,
                &indexings,
                &[1],
                true,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            BatchError::NotIndexed {
                node: NodeId(6),
                level: 1
            }
        ));
    }

    #[test]
    fn test_fill_node_or_index() {
        let flow = NeighborAggregationFlow::new(store(4));
        let level: NodeSet = ids(&[7, 3, 5]).into_iter().collect();
        let indexing = Indexing::build(0, &level);
        let mut batch = Batch::new();

        flow.fill_node_or_index(&mut batch, "idx", &ids(&[5, 7]), Some(&indexing))
            .unwrap();
        flow.fill_node_or_index(&mut batch, "raw", &ids(&[5, 7]), None)
            .unwrap();
        assert_eq!(batch.positions("idx"), Some(&[2, 0][..]));
        assert_eq!(batch.node_ids("raw"), Some(&ids(&[5, 7])[..]));

        assert!(
            flow.fill_node_or_index(&mut batch, "idx", &ids(&[4]), Some(&indexing))
                .is_err()
        );
    }

    #[test]
    fn test_fill_label_and_check() {
        let flow = NeighborAggregationFlow::new(store(4));
        let labeled = vec![
            LabeledNode {
                node: NodeId(1),
                labels: vec![2],
            },
            LabeledNode {
                node: NodeId(2),
                labels: vec![0, 4],
            },
        ];
        let mut batch = Batch::new();
        flow.fill_label_and_check(&mut batch, names::LABEL, &labeled, 2, 5)
            .unwrap();
        assert_eq!(
            batch.get(names::LABEL),
            Some(&Tensor::Labels {
                width: 2,
                values: vec![2, -1, 0, 4],
            })
        );
    }

    #[test]
    fn test_fill_label_rejects_bad_labels() {
        let flow = NeighborAggregationFlow::new(store(4));
        let cases = [vec![], vec![0, 1, 2], vec![5], vec![-1]];
        for labels in cases {
            let labeled = vec![LabeledNode {
                node: NodeId(3),
                labels: labels.clone(),
            }];
            let mut batch = Batch::new();
            let err = flow
                .fill_label_and_check(&mut batch, names::LABEL, &labeled, 2, 5)
                .unwrap_err();
            assert!(
                matches!(err, BatchError::Label { node: NodeId(3), .. }),
                "{:?} gave {:?}",
                labels,
                err
            );
            assert!(!batch.contains(names::LABEL));
        }
    }

    #[test]
    fn test_block_inputs_must_match() {
        let flow = NeighborAggregationFlow::new(store(8));
        let sub = flow.sample_sub_graph(&ids(&[0]), &[2, 2]).unwrap();
        let indexings = create_indexings(&sub.level_nodes[..2]);
        let err = flow
            .fill_self_and_neigh_graph_block(
                &mut Batch::new(),
                "s",
                "n",
                &sub,
                &indexings,
                &[2, 2],
                true,
            )
            .unwrap_err();
        assert!(matches!(err, BatchError::Invariant(_)));
    }
}
