pub mod batch;
pub mod config;
pub mod error;
pub mod flow;
pub mod indexing;
pub mod lookup;
pub mod pipeline;
pub mod reader;
pub mod registry;
pub mod store;
pub mod types;

#[cfg(feature = "python")]
mod python;

// Re-export commonly used types
pub use batch::{Batch, CsrFeatures, PAD_POSITION, PositionBlock, Tensor, WeightBlock, names};
pub use config::{ReaderConfig, ShuffleType, TrainDataType};
pub use error::{BatchError, Result};
pub use flow::{NeighborAggregationFlow, ShuffleOptions};
pub use indexing::{Indexing, create_indexings};
pub use lookup::{ContextLookup, DistLookup, NeighborFeatureLookup, NodeFeatureLookup};
pub use pipeline::{BatchStream, spawn_workers};
pub use reader::{
    INFOGRAPH_READER_ALIAS, INFOGRAPH_READER_NAME, InfoGraphReader, InstanceReader, ReaderState,
    RecordSource, VecRecordSource,
};
pub use registry::{ReaderFactory, ReaderRegistry};
pub use store::{GraphStore, MemoryGraphStore, NodeRecord, SamplingPolicy};
pub use types::{
    FeatureEntry, LabeledNode, NeighborMap, NodeId, NodeSet, RawRecord, SubGraph, WeightedEdge,
};

#[cfg(feature = "python")]
use pyo3::prelude::*;

#[cfg(feature = "python")]
#[pymodule]
fn batcher(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<python::InfoGraphBatcher>()?;
    Ok(())
}
