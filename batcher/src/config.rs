//! Reader configuration.
//!
//! Options arrive as `key=value` pairs (usually a single `k=v;k=v` string) and
//! are validated eagerly; any bad or unknown key is a startup error.

use std::str::FromStr;

use tracing::info;

use crate::error::{BatchError, Result};

/// Default number of records pulled per batch
pub const DEFAULT_BATCH: usize = 32;

/// Default negative sample count
pub const DEFAULT_NUM_NEG: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShuffleType {
    /// Permute nodes already in the batch
    #[default]
    InBatch,
    /// Draw replacements from the whole graph
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrainDataType {
    /// Each record is a node sequence (e.g. a walk)
    #[default]
    Sequence,
    /// Each record is a single node
    Node,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReaderConfig {
    /// Records per batch
    pub batch: usize,
    pub is_train: bool,
    /// Negative samples per positive, consumed by the model
    pub num_neg: usize,
    /// Fan-out per hop
    pub num_neighbors: Vec<usize>,
    /// Fill neighbor features on the predict path
    pub use_neigh_feat: bool,
    pub shuffle_type: ShuffleType,
    pub train_data_type: TrainDataType,
    /// Fraction of source nodes used to size the labeled draw
    pub instance_sample_prob: f64,
    /// Maximum label vector length
    pub num_label: usize,
    /// Exclusive upper bound of label values
    pub max_label: usize,
    pub multi_label: bool,
    /// Whether a shuffled view may leave a node in its own slot
    pub shuffle_allow_self: bool,
    /// Seed for batch-local randomness (in-batch shuffles)
    pub seed: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            batch: DEFAULT_BATCH,
            is_train: true,
            num_neg: DEFAULT_NUM_NEG,
            num_neighbors: Vec::new(),
            use_neigh_feat: false,
            shuffle_type: ShuffleType::InBatch,
            train_data_type: TrainDataType::Sequence,
            instance_sample_prob: 0.0,
            num_label: 1,
            max_label: 1,
            multi_label: false,
            shuffle_allow_self: true,
            seed: 0,
        }
    }
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| BatchError::config(key, value, "not a number"))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(BatchError::config(key, value, "expected 0 or 1")),
    }
}

fn parse_at_least(key: &str, value: &str, min: usize) -> Result<usize> {
    let parsed: usize = parse_num(key, value)?;
    if parsed < min {
        return Err(BatchError::config(key, value, format!("must be >= {}", min)));
    }
    Ok(parsed)
}

impl ReaderConfig {
    /// Parse a `k=v;k=v` string on top of the defaults.
    pub fn parse(s: &str) -> Result<Self> {
        let mut config = Self::default();
        for item in s.split(';').map(str::trim).filter(|item| !item.is_empty()) {
            let Some((key, value)) = item.split_once('=') else {
                return Err(BatchError::config(item, "", "expected key=value"));
            };
            config.set(key.trim(), value.trim())?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Build from explicit key/value pairs on top of the defaults.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Self::default();
        for (key, value) in pairs {
            config.set(key, value)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Apply and validate a single option.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "batch" => self.batch = parse_at_least(key, value, 1)?,
            "num_neg" => self.num_neg = parse_at_least(key, value, 1)?,
            "num_neighbors" => {
                let mut fanouts = Vec::new();
                for part in value.split(',') {
                    fanouts.push(parse_at_least(key, part, 1).map_err(|_| {
                        BatchError::config(key, value, "expected comma-separated positive integers")
                    })?);
                }
                self.num_neighbors = fanouts;
            }
            "use_neigh_feat" => self.use_neigh_feat = parse_flag(key, value)?,
            "is_train" => self.is_train = parse_flag(key, value)?,
            "shuffle_type" => {
                self.shuffle_type = if parse_flag(key, value)? {
                    ShuffleType::Global
                } else {
                    ShuffleType::InBatch
                }
            }
            "train_data_type" => {
                self.train_data_type = if parse_flag(key, value)? {
                    TrainDataType::Node
                } else {
                    TrainDataType::Sequence
                }
            }
            "instance_sample_prob" => {
                let prob: f64 = parse_num(key, value)?;
                if !(0.0..=1.0).contains(&prob) {
                    return Err(BatchError::config(key, value, "must be within [0, 1]"));
                }
                self.instance_sample_prob = prob;
            }
            "num_label" => self.num_label = parse_at_least(key, value, 1)?,
            "max_label" => self.max_label = parse_at_least(key, value, 1)?,
            "multi_label" => self.multi_label = parse_flag(key, value)?,
            "shuffle_allow_self" => self.shuffle_allow_self = parse_flag(key, value)?,
            "seed" => self.seed = parse_num(key, value)?,
            _ => {
                return Err(BatchError::UnknownConfigKey {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
        }

        info!("Instance reader argument: {} = {}", key, value);
        Ok(())
    }

    /// Cross-option checks run once all keys are applied.
    pub fn validate(&self) -> Result<()> {
        if self.num_neighbors.is_empty() {
            return Err(BatchError::config(
                "num_neighbors",
                "",
                "at least one hop fan-out is required",
            ));
        }
        Ok(())
    }

    pub fn num_hops(&self) -> usize {
        self.num_neighbors.len()
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_num_neighbors(mut self, fanouts: &[usize]) -> Self {
        self.num_neighbors = fanouts.to_vec();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}
