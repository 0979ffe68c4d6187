//! Instance readers: pull raw records, drive the aggregation flow and emit
//! completed batches.

use std::sync::Arc;

use rand::prelude::*;
use tracing::debug;

use crate::batch::{Batch, Tensor, names};
use crate::config::{ReaderConfig, ShuffleType, TrainDataType};
use crate::error::{BatchError, Result};
use crate::flow::{NeighborAggregationFlow, ShuffleOptions};
use crate::indexing::create_indexings;
use crate::store::GraphStore;
use crate::types::{LabeledNode, NodeId, NodeSet, RawRecord};

// ============================================================================
// Record Sources
// ============================================================================

/// Upstream supplier of raw records. `Ok(None)` means the data is exhausted.
pub trait RecordSource: Send {
    fn next_batch(&mut self, batch_size: usize) -> Result<Option<Vec<RawRecord>>>;
}

/// Record source over an in-memory list
#[derive(Debug, Clone, Default)]
pub struct VecRecordSource {
    records: Vec<RawRecord>,
    cursor: usize,
}

impl VecRecordSource {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self { records, cursor: 0 }
    }

    pub fn from_nodes<I: IntoIterator<Item = NodeId>>(nodes: I) -> Self {
        Self::new(nodes.into_iter().map(RawRecord::Node).collect())
    }

    pub fn from_sequences<I: IntoIterator<Item = Vec<NodeId>>>(seqs: I) -> Self {
        Self::new(seqs.into_iter().map(RawRecord::Sequence).collect())
    }

    pub fn remaining(&self) -> usize {
        self.records.len() - self.cursor
    }
}

impl RecordSource for VecRecordSource {
    fn next_batch(&mut self, batch_size: usize) -> Result<Option<Vec<RawRecord>>> {
        if self.cursor >= self.records.len() {
            return Ok(None);
        }
        let end = (self.cursor + batch_size).min(self.records.len());
        let chunk = self.records[self.cursor..end].to_vec();
        self.cursor = end;
        Ok(Some(chunk))
    }
}

// ============================================================================
// Reader Interface
// ============================================================================

/// Where a reader is in building the current batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Idle,
    BuildingTrainBatch,
    BuildingPredictBatch,
    Complete,
    EndOfData,
}

pub trait InstanceReader: Send {
    fn name(&self) -> &str;

    fn state(&self) -> ReaderState;

    /// Build the next batch. `Ok(None)` signals end-of-data; an error aborts
    /// the batch and nothing partial is returned.
    fn next_batch(&mut self) -> Result<Option<Batch>>;
}

// ============================================================================
// InfoGraph Reader
// ============================================================================

pub const INFOGRAPH_READER_NAME: &str = "NodeInfoGraphInstReader";
pub const INFOGRAPH_READER_ALIAS: &str = "node_infograph_inst_reader";

/// Reader for InfoGraph-style training: source nodes plus sampled labeled
/// nodes, their multi-hop neighborhood, and a shuffled (corrupted) view.
pub struct InfoGraphReader {
    config: ReaderConfig,
    flow: NeighborAggregationFlow,
    source: Box<dyn RecordSource>,
    state: ReaderState,
    /// Completed batches, mixed into the shuffle seed
    batches: u64,
}

impl InfoGraphReader {
    pub fn new(
        config: ReaderConfig,
        store: Arc<dyn GraphStore>,
        source: Box<dyn RecordSource>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            flow: NeighborAggregationFlow::new(store),
            source,
            state: ReaderState::Idle,
            batches: 0,
        })
    }

    /// Factory used by the reader registry.
    pub fn create(
        config: ReaderConfig,
        store: Arc<dyn GraphStore>,
        source: Box<dyn RecordSource>,
    ) -> Result<Box<dyn InstanceReader>> {
        Ok(Box::new(Self::new(config, store, source)?))
    }

    fn read_records(&mut self) -> Result<Option<Vec<RawRecord>>> {
        match self.source.next_batch(self.config.batch)? {
            Some(records) if !records.is_empty() => Ok(Some(records)),
            _ => Ok(None),
        }
    }

    fn collect_nodes(records: Vec<RawRecord>) -> Result<Vec<NodeId>> {
        records
            .into_iter()
            .map(|record| match record {
                RawRecord::Node(node) => Ok(node),
                RawRecord::Sequence(_) => Err(BatchError::Invariant(
                    "expected node-typed records, got a sequence".to_string(),
                )),
            })
            .collect()
    }

    fn collect_sequences(records: Vec<RawRecord>) -> Result<Vec<Vec<NodeId>>> {
        records
            .into_iter()
            .map(|record| match record {
                RawRecord::Sequence(seq) => Ok(seq),
                RawRecord::Node(_) => Err(BatchError::Invariant(
                    "expected sequence-typed records, got a node".to_string(),
                )),
            })
            .collect()
    }

    fn sample_labeled(&self, num_src: usize) -> Result<Vec<LabeledNode>> {
        let count = (self.config.instance_sample_prob * num_src as f64).floor() as usize;
        if count == 0 {
            return Err(BatchError::Invariant(format!(
                "instance_sample_prob {} over {} source nodes samples no labeled nodes",
                self.config.instance_sample_prob, num_src
            )));
        }

        let labeled = self.flow.store().sample_instances(count)?;
        if !self.config.multi_label
            && let Some(item) = labeled.iter().find(|l| l.labels.len() > 1)
        {
            return Err(BatchError::Label {
                node: item.node,
                reason: format!("{} labels but multi_label is off", item.labels.len()),
            });
        }
        Ok(labeled)
    }

    fn shuffle_options(&self) -> ShuffleOptions {
        ShuffleOptions {
            allow_self: self.config.shuffle_allow_self,
        }
    }

    fn get_train_batch(&mut self) -> Result<Option<Batch>> {
        let Some(records) = self.read_records()? else {
            return Ok(None);
        };
        self.state = ReaderState::BuildingTrainBatch;

        let src_nodes = match self.config.train_data_type {
            TrainDataType::Sequence => {
                let seqs = Self::collect_sequences(records)?;
                let mut src = NodeSet::new();
                self.flow.merge_sequences_to(&seqs, &mut src);
                src.to_vec()
            }
            TrainDataType::Node => Self::collect_nodes(records)?,
        };

        let labeled = self.sample_labeled(src_nodes.len())?;
        let labeled_nodes: Vec<NodeId> = labeled.iter().map(|l| l.node).collect();

        let mut merged = NodeSet::with_capacity(src_nodes.len() + labeled_nodes.len());
        self.flow.merge_to(&src_nodes, &mut merged);
        self.flow.merge_to(&labeled_nodes, &mut merged);

        let fanouts = &self.config.num_neighbors;
        let sub_graph = self.flow.sample_sub_graph(merged.as_slice(), fanouts)?;

        let mut batch = Batch::new();
        self.flow
            .fill_level_node_feature(&mut batch, names::NODE_FEATURE, &sub_graph.level_nodes)?;

        let options = self.shuffle_options();
        let shuffled = match self.config.shuffle_type {
            ShuffleType::InBatch => {
                let mut rng =
                    StdRng::seed_from_u64(self.config.seed.wrapping_add(self.batches));
                self.flow
                    .shuffle_nodes_in_batch(&sub_graph.level_nodes, &options, &mut rng)
            }
            ShuffleType::Global => self
                .flow
                .shuffle_nodes_in_global(&sub_graph.level_nodes, &options)?,
        };
        self.flow
            .fill_node_feature(&mut batch, names::NODE_SHUFFLED_FEATURE, &shuffled)?;

        let indexings = create_indexings(&sub_graph.level_nodes);
        self.flow.fill_self_and_neigh_graph_block(
            &mut batch,
            names::SELF_BLOCK,
            names::NEIGH_BLOCK,
            &sub_graph,
            &indexings,
            fanouts,
            false,
        )?;

        self.flow
            .fill_node_or_index(&mut batch, names::SRC_ID, &src_nodes, Some(&indexings[0]))?;
        self.flow.fill_node_or_index(
            &mut batch,
            names::NODE_ID,
            &labeled_nodes,
            Some(&indexings[0]),
        )?;

        self.flow.fill_label_and_check(
            &mut batch,
            names::LABEL,
            &labeled,
            self.config.num_label,
            self.config.max_label,
        )?;

        batch.set_batch_size(src_nodes.len());
        debug!(
            "Train batch {}: {} source, {} labeled, {} merged, {} sampled, levels {:?}",
            self.batches,
            src_nodes.len(),
            labeled.len(),
            merged.len(),
            sub_graph.total_nodes(),
            sub_graph
                .level_nodes
                .iter()
                .map(NodeSet::len)
                .collect::<Vec<_>>()
        );
        Ok(Some(batch))
    }

    fn get_predict_batch(&mut self) -> Result<Option<Batch>> {
        let Some(records) = self.read_records()? else {
            return Ok(None);
        };
        self.state = ReaderState::BuildingPredictBatch;

        let src_nodes = Self::collect_nodes(records)?;
        let fanouts = &self.config.num_neighbors;
        let sub_graph = self.flow.sample_sub_graph(&src_nodes, fanouts)?;

        let mut batch = Batch::new();
        self.flow
            .fill_level_node_feature(&mut batch, names::NODE_FEATURE, &sub_graph.level_nodes)?;
        if self.config.use_neigh_feat {
            self.flow.fill_level_neigh_feature(
                &mut batch,
                names::NEIGH_FEATURE,
                &sub_graph.level_nodes,
            )?;
        }

        let indexings = create_indexings(&sub_graph.level_nodes);
        self.flow.fill_self_and_neigh_graph_block(
            &mut batch,
            names::SELF_BLOCK,
            names::NEIGH_BLOCK,
            &sub_graph,
            &indexings,
            fanouts,
            false,
        )?;

        self.flow
            .fill_node_or_index(&mut batch, names::SRC_ID, &src_nodes, Some(&indexings[0]))?;
        batch.insert(names::PREDICT_NODE, Tensor::NodeIds(src_nodes.clone()));

        batch.set_batch_size(src_nodes.len());
        debug!(
            "Predict batch {}: {} source nodes",
            self.batches,
            src_nodes.len()
        );
        Ok(Some(batch))
    }
}

impl InstanceReader for InfoGraphReader {
    fn name(&self) -> &str {
        INFOGRAPH_READER_NAME
    }

    fn state(&self) -> ReaderState {
        self.state
    }

    fn next_batch(&mut self) -> Result<Option<Batch>> {
        self.state = ReaderState::Idle;
        let result = if self.config.is_train {
            self.get_train_batch()
        } else {
            self.get_predict_batch()
        };

        self.state = match &result {
            Ok(Some(_)) => {
                self.batches += 1;
                ReaderState::Complete
            }
            Ok(None) => ReaderState::EndOfData,
            Err(_) => ReaderState::Idle,
        };
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryGraphStore, NodeRecord};
    use crate::types::{FeatureEntry, WeightedEdge};

    /// Nodes `0..n`, each linked to the next three, every third one labeled.
    fn store(n: u64) -> Arc<dyn GraphStore> {
        let records = (0..n)
            .map(|i| {
                let mut r = NodeRecord::new(i);
                r.neighbors = (1..=3)
                    .map(|d| WeightedEdge::new((i + d) % n, 1.0))
                    .collect();
                r.features = vec![FeatureEntry::new(i, 1.0)];
                if i % 3 == 0 {
                    r.labels = Some(vec![(i % 4) as i32]);
                }
                r
            })
            .collect();
        Arc::new(MemoryGraphStore::new(records).unwrap().with_seed(3))
    }

    fn config(s: &str) -> ReaderConfig {
        ReaderConfig::parse(s).unwrap()
    }

    #[test]
    fn test_vec_record_source_chunks_then_ends() {
        let mut source = VecRecordSource::from_nodes((0..5).map(NodeId));
        assert_eq!(source.next_batch(2).unwrap().unwrap().len(), 2);
        assert_eq!(source.next_batch(2).unwrap().unwrap().len(), 2);
        assert_eq!(source.remaining(), 1);
        assert_eq!(source.next_batch(2).unwrap().unwrap().len(), 1);
        assert!(source.next_batch(2).unwrap().is_none());
    }

    #[test]
    fn test_train_batch_size_counts_source_nodes_only() {
        let seqs = vec![
            vec![NodeId(1), NodeId(2)],
            vec![NodeId(2), NodeId(4), NodeId(5)],
        ];
        let mut reader = InfoGraphReader::new(
            config("num_neighbors=2;instance_sample_prob=0.5;max_label=4;batch=8"),
            store(30),
            Box::new(VecRecordSource::from_sequences(seqs)),
        )
        .unwrap();

        let batch = reader.next_batch().unwrap().unwrap();
        assert_eq!(reader.state(), ReaderState::Complete);
        // 4 distinct source nodes, plus 2 labeled nodes merged in
        assert_eq!(batch.batch_size(), 4);
        assert_eq!(batch.positions(names::SRC_ID).unwrap().len(), 4);
        assert_eq!(batch.positions(names::NODE_ID).unwrap().len(), 2);
        assert!(batch.contains(names::NODE_SHUFFLED_FEATURE));
        assert!(batch.contains(names::LABEL));
        assert!(!batch.contains(names::PREDICT_NODE));

        assert!(reader.next_batch().unwrap().is_none());
        assert_eq!(reader.state(), ReaderState::EndOfData);
    }

    #[test]
    fn test_zero_label_draw_is_fatal() {
        let mut reader = InfoGraphReader::new(
            config("num_neighbors=2;train_data_type=1;instance_sample_prob=0.1"),
            store(30),
            Box::new(VecRecordSource::from_nodes((0..5).map(NodeId))),
        )
        .unwrap();

        let err = reader.next_batch().unwrap_err();
        assert!(matches!(err, BatchError::Invariant(_)));
        assert_eq!(reader.state(), ReaderState::Idle);
    }

    #[test]
    fn test_record_type_mismatch_is_rejected() {
        let mut reader = InfoGraphReader::new(
            config("num_neighbors=2;instance_sample_prob=1"),
            store(30),
            Box::new(VecRecordSource::from_nodes((0..4).map(NodeId))),
        )
        .unwrap();
        assert!(matches!(
            reader.next_batch().unwrap_err(),
            BatchError::Invariant(_)
        ));
    }

    #[test]
    fn test_out_of_range_label_fails_batch() {
        // labels are i % 4, so max_label=2 rejects labels 2 and 3
        let mut reader = InfoGraphReader::new(
            config("num_neighbors=1;train_data_type=1;instance_sample_prob=1;max_label=2"),
            store(30),
            Box::new(VecRecordSource::from_nodes((0..10).map(NodeId))),
        )
        .unwrap();
        assert!(matches!(
            reader.next_batch().unwrap_err(),
            BatchError::Label { .. }
        ));
    }

    /// Four linked nodes; only node 0 is labeled, with two labels.
    fn two_label_store() -> Arc<dyn GraphStore> {
        let records = (0..4u64)
            .map(|i| {
                let mut r = NodeRecord::new(i);
                r.neighbors = vec![WeightedEdge::new((i + 1) % 4, 1.0)];
                if i == 0 {
                    r.labels = Some(vec![0, 1]);
                }
                r
            })
            .collect();
        Arc::new(MemoryGraphStore::new(records).unwrap())
    }

    #[test]
    fn test_multi_label_off_rejects_label_vectors() {
        let mut reader = InfoGraphReader::new(
            config(
                "num_neighbors=1;train_data_type=1;instance_sample_prob=1;\
                 num_label=2;max_label=4;multi_label=0",
            ),
            two_label_store(),
            Box::new(VecRecordSource::from_nodes((0..4).map(NodeId))),
        )
        .unwrap();

        match reader.next_batch() {
            Err(BatchError::Label { node, .. }) => assert_eq!(node, NodeId(0)),
            other => panic!("expected Label error, got {:?}", other.map(|b| b.is_some())),
        }
        assert_eq!(reader.state(), ReaderState::Idle);
    }

    #[test]
    fn test_multi_label_on_keeps_label_vectors() {
        let mut reader = InfoGraphReader::new(
            config(
                "num_neighbors=1;train_data_type=1;instance_sample_prob=1;\
                 num_label=2;max_label=4;multi_label=1",
            ),
            two_label_store(),
            Box::new(VecRecordSource::from_nodes((0..4).map(NodeId))),
        )
        .unwrap();

        let batch = reader.next_batch().unwrap().unwrap();
        assert_eq!(
            batch.get(names::LABEL),
            Some(&Tensor::Labels {
                width: 2,
                values: vec![0, 1],
            })
        );
        assert_eq!(batch.positions(names::NODE_ID), Some(&[0][..]));
    }

    #[test]
    fn test_predict_without_neighbor_features() {
        let mut reader = InfoGraphReader::new(
            config("is_train=0;num_neighbors=2,2"),
            store(20),
            Box::new(VecRecordSource::from_nodes([NodeId(3), NodeId(8)])),
        )
        .unwrap();

        let batch = reader.next_batch().unwrap().unwrap();
        assert!(batch.contains(names::NODE_FEATURE));
        assert!(!batch.contains(names::NEIGH_FEATURE));
        assert_eq!(
            batch.node_ids(names::PREDICT_NODE),
            Some(&[NodeId(3), NodeId(8)][..])
        );
        assert_eq!(batch.positions(names::SRC_ID), Some(&[0, 1][..]));
    }

    #[test]
    fn test_lookup_failure_is_distinguishable_from_end_of_data() {
        let mut reader = InfoGraphReader::new(
            config("is_train=0;num_neighbors=1"),
            store(5),
            Box::new(VecRecordSource::from_nodes([NodeId(1), NodeId(77)])),
        )
        .unwrap();
        let err = reader.next_batch().unwrap_err();
        assert!(err.is_lookup());
    }

    #[test]
    fn test_invalid_config_is_rejected_at_construction() {
        let result = InfoGraphReader::new(
            ReaderConfig::default(),
            store(5),
            Box::new(VecRecordSource::default()),
        );
        assert!(result.is_err());
    }
}
