//! Error types shared by every stage of batch construction.
//!
//! End-of-data is not an error: readers return `Ok(None)` when the record
//! source is exhausted.

use thiserror::Error;

use crate::types::NodeId;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Invalid config value: {key} = {value} ({reason})")]
    Config {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Unexpected config: {key} = {value}")]
    UnknownConfigKey { key: String, value: String },

    #[error("Unknown instance reader: {0}")]
    UnknownReader(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Node {node} is not indexed at level {level}")]
    NotIndexed { node: NodeId, level: usize },

    #[error("Invalid label for node {node}: {reason}")]
    Label { node: NodeId, reason: String },

    #[error("Graph store lookup failed: {0}")]
    Lookup(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BatchError {
    pub fn config(key: &str, value: &str, reason: impl Into<String>) -> Self {
        BatchError::Config {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// True for failures of the remote store collaborator, which callers may
    /// choose to retry at epoch level.
    pub fn is_lookup(&self) -> bool {
        matches!(self, BatchError::Lookup(_))
    }
}

pub type Result<T> = std::result::Result<T, BatchError>;
