//! Output container handed to the training engine.
//!
//! Tensors are flat and row-major, mirroring what the model side reshapes:
//! integer positions are `i32` with `-1` padding, weights are `f16`.

use std::collections::HashMap;

use half::f16;

use crate::types::NodeId;

/// Tensor names written by the InfoGraph reader.
pub mod names {
    pub const NODE_FEATURE: &str = "node_feature";
    pub const NEIGH_FEATURE: &str = "neigh_feature";
    pub const NODE_SHUFFLED_FEATURE: &str = "node_shuffled_feature";
    pub const SELF_BLOCK: &str = "self_block";
    pub const NEIGH_BLOCK: &str = "neigh_block";
    pub const SRC_ID: &str = "src_id";
    pub const NODE_ID: &str = "node_id";
    pub const PREDICT_NODE: &str = "predict_node";
    pub const LABEL: &str = "Y";

    /// Name of the weight matrix aligned with a neighbor block.
    pub fn weight_of(block_name: &str) -> String {
        format!("{}_weight", block_name)
    }
}

/// Padding value for unused position slots
pub const PAD_POSITION: i32 = -1;

/// Sparse feature rows in CSR layout
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CsrFeatures {
    /// `offsets[r]..offsets[r + 1]` is the entry range of row `r`
    pub offsets: Vec<usize>,
    pub features: Vec<u64>,
    pub weights: Vec<f16>,
}

impl CsrFeatures {
    pub fn new() -> Self {
        Self {
            offsets: vec![0],
            features: Vec::new(),
            weights: Vec::new(),
        }
    }

    pub fn push_row<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (u64, f32)>,
    {
        for (feature, weight) in entries {
            self.features.push(feature);
            self.weights.push(f16::from_f32(weight));
        }
        self.offsets.push(self.features.len());
    }

    pub fn num_rows(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    pub fn row(&self, r: usize) -> (&[u64], &[f16]) {
        let (start, end) = (self.offsets[r], self.offsets[r + 1]);
        (&self.features[start..end], &self.weights[start..end])
    }
}

/// Dense `rows x cols` matrix of level positions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PositionBlock {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<i32>,
}

impl PositionBlock {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![PAD_POSITION; rows * cols],
        }
    }

    pub fn row(&self, r: usize) -> &[i32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn row_mut(&mut self, r: usize) -> &mut [i32] {
        &mut self.data[r * self.cols..(r + 1) * self.cols]
    }
}

/// Dense `rows x cols` weight matrix aligned with a `PositionBlock`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightBlock {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f16>,
}

impl WeightBlock {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![f16::ZERO; rows * cols],
        }
    }

    pub fn row(&self, r: usize) -> &[f16] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tensor {
    /// Raw node identifiers
    NodeIds(Vec<NodeId>),
    /// Dense level positions
    Positions(Vec<i32>),
    /// One CSR feature matrix per level (or a single one)
    Features(Vec<CsrFeatures>),
    /// One position block per level
    Blocks(Vec<PositionBlock>),
    /// One weight block per level
    Weights(Vec<WeightBlock>),
    /// `rows x width` label matrix, `-1` padded
    Labels { width: usize, values: Vec<i32> },
}

/// Named tensors plus the number of source examples.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    tensors: HashMap<String, Tensor>,
    batch_size: usize,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn set_batch_size(&mut self, batch_size: usize) {
        self.batch_size = batch_size;
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn into_tensors(self) -> HashMap<String, Tensor> {
        self.tensors
    }

    // Typed accessors for the model side

    pub fn node_ids(&self, name: &str) -> Option<&[NodeId]> {
        match self.tensors.get(name) {
            Some(Tensor::NodeIds(ids)) => Some(ids),
            _ => None,
        }
    }

    pub fn positions(&self, name: &str) -> Option<&[i32]> {
        match self.tensors.get(name) {
            Some(Tensor::Positions(p)) => Some(p),
            _ => None,
        }
    }

    pub fn features(&self, name: &str) -> Option<&[CsrFeatures]> {
        match self.tensors.get(name) {
            Some(Tensor::Features(f)) => Some(f),
            _ => None,
        }
    }

    pub fn blocks(&self, name: &str) -> Option<&[PositionBlock]> {
        match self.tensors.get(name) {
            Some(Tensor::Blocks(b)) => Some(b),
            _ => None,
        }
    }

    pub fn weights(&self, name: &str) -> Option<&[WeightBlock]> {
        match self.tensors.get(name) {
            Some(Tensor::Weights(w)) => Some(w),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csr_rows() {
        let mut csr = CsrFeatures::new();
        csr.push_row([(1, 0.5), (4, 1.0)]);
        csr.push_row(std::iter::empty());
        csr.push_row([(9, 2.0)]);

        assert_eq!(csr.num_rows(), 3);
        assert_eq!(csr.row(0).0, &[1, 4]);
        assert!(csr.row(1).0.is_empty());
        assert_eq!(csr.row(2).1, &[f16::from_f32(2.0)]);
    }

    #[test]
    fn test_position_block_is_padded() {
        let mut block = PositionBlock::new(2, 3);
        block.row_mut(1)[0] = 7;
        assert_eq!(block.row(0), &[PAD_POSITION; 3]);
        assert_eq!(block.row(1), &[7, PAD_POSITION, PAD_POSITION]);
    }

    #[test]
    fn test_typed_accessors() {
        let mut batch = Batch::new();
        batch.insert(names::SRC_ID, Tensor::Positions(vec![0, 1]));
        batch.insert(names::PREDICT_NODE, Tensor::NodeIds(vec![NodeId(3)]));
        batch.set_batch_size(2);

        assert_eq!(batch.positions(names::SRC_ID), Some(&[0, 1][..]));
        assert_eq!(batch.node_ids(names::PREDICT_NODE), Some(&[NodeId(3)][..]));
        assert!(batch.features(names::SRC_ID).is_none());
        assert_eq!(batch.batch_size(), 2);
        assert_eq!(names::weight_of(names::NEIGH_BLOCK), "neigh_block_weight");
    }
}
