// Python bindings: build InfoGraph batches from a store snapshot and hand
// them to the training loop as flat numpy arrays, reshaped on the Python side.

use std::path::Path;
use std::sync::Arc;

use numpy::PyArray1;
use pyo3::exceptions::{PyIOError, PyKeyError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::{IntoPyObjectExt, Py, PyAny};

use crate::batch::{Batch, Tensor};
use crate::config::ReaderConfig;
use crate::error::BatchError;
use crate::reader::{INFOGRAPH_READER_NAME, RecordSource, VecRecordSource};
use crate::registry::ReaderRegistry;
use crate::store::{GraphStore, MemoryGraphStore, SamplingPolicy};
use crate::types::NodeId;

impl From<BatchError> for PyErr {
    fn from(err: BatchError) -> PyErr {
        match err {
            BatchError::Config { .. } | BatchError::UnknownConfigKey { .. } => {
                PyValueError::new_err(err.to_string())
            }
            BatchError::UnknownReader(_) => PyKeyError::new_err(err.to_string()),
            BatchError::Io(_) | BatchError::Snapshot(_) => PyIOError::new_err(err.to_string()),
            _ => PyRuntimeError::new_err(err.to_string()),
        }
    }
}

/// One `(name, array, shape)` triple per flat tensor.
fn batch_into_pyobject(py: Python<'_>, batch: Batch) -> PyResult<Vec<Py<PyAny>>> {
    let mut out = Vec::with_capacity(batch.len() + 1);
    let batch_size = batch.batch_size();
    let mut entries: Vec<(String, Tensor)> = batch.into_tensors().into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    for (name, tensor) in entries {
        match tensor {
            Tensor::NodeIds(ids) => {
                let n = ids.len();
                let raw: Vec<u64> = ids.into_iter().map(|id| id.0).collect();
                out.push((name, PyArray1::from_vec(py, raw), vec![n]).into_py_any(py)?);
            }
            Tensor::Positions(positions) => {
                let n = positions.len();
                out.push((name, PyArray1::from_vec(py, positions), vec![n]).into_py_any(py)?);
            }
            Tensor::Features(levels) => {
                for (level, csr) in levels.into_iter().enumerate() {
                    let rows = csr.num_rows();
                    let nnz = csr.features.len();
                    let offsets: Vec<u64> = csr.offsets.iter().map(|&o| o as u64).collect();
                    out.push(
                        (
                            format!("{}_{}_offsets", name, level),
                            PyArray1::from_vec(py, offsets),
                            vec![rows + 1],
                        )
                            .into_py_any(py)?,
                    );
                    out.push(
                        (
                            format!("{}_{}_ids", name, level),
                            PyArray1::from_vec(py, csr.features),
                            vec![nnz],
                        )
                            .into_py_any(py)?,
                    );
                    out.push(
                        (
                            format!("{}_{}_weights", name, level),
                            PyArray1::from_vec(py, csr.weights),
                            vec![nnz],
                        )
                            .into_py_any(py)?,
                    );
                }
            }
            Tensor::Blocks(levels) => {
                for (level, block) in levels.into_iter().enumerate() {
                    out.push(
                        (
                            format!("{}_{}", name, level),
                            PyArray1::from_vec(py, block.data),
                            vec![block.rows, block.cols],
                        )
                            .into_py_any(py)?,
                    );
                }
            }
            Tensor::Weights(levels) => {
                for (level, block) in levels.into_iter().enumerate() {
                    out.push(
                        (
                            format!("{}_{}", name, level),
                            PyArray1::from_vec(py, block.data),
                            vec![block.rows, block.cols],
                        )
                            .into_py_any(py)?,
                    );
                }
            }
            Tensor::Labels { width, values } => {
                let rows = if width == 0 { 0 } else { values.len() / width };
                out.push((name, PyArray1::from_vec(py, values), vec![rows, width]).into_py_any(py)?);
            }
        }
    }

    out.push(("batch_size", batch_size).into_py_any(py)?);
    Ok(out)
}

#[pyclass]
pub struct InfoGraphBatcher {
    store: Arc<MemoryGraphStore>,
    registry: ReaderRegistry,
    reader_name: String,
    config: ReaderConfig,
    calls: u64,
}

#[pymethods]
impl InfoGraphBatcher {
    /// Create a batcher over a graph snapshot.
    ///
    /// Args:
    ///     snapshot_path: File written by `snapshot-builder`
    ///     config: Reader options as a `k=v;k=v` string
    ///     reader_name: Registered reader name (defaults to the InfoGraph reader)
    ///     uniform_sampling: Sample neighbors uniformly without replacement
    #[new]
    #[pyo3(signature = (snapshot_path, config, reader_name=None, uniform_sampling=false))]
    fn new(
        snapshot_path: String,
        config: String,
        reader_name: Option<String>,
        uniform_sampling: bool,
    ) -> PyResult<Self> {
        let config = ReaderConfig::parse(&config)?;
        let policy = if uniform_sampling {
            SamplingPolicy::UniformWithoutReplacement
        } else {
            SamplingPolicy::WeightedWithReplacement
        };
        let store = MemoryGraphStore::load(Path::new(&snapshot_path))
            .map_err(|e| {
                PyIOError::new_err(format!(
                    "Failed to load snapshot '{}': {}",
                    snapshot_path, e
                ))
            })?
            .with_policy(policy)
            .with_seed(config.seed);

        let registry = ReaderRegistry::with_defaults();
        let reader_name = reader_name.unwrap_or_else(|| INFOGRAPH_READER_NAME.to_string());
        if !registry.contains(&reader_name) {
            return Err(BatchError::UnknownReader(reader_name).into());
        }

        Ok(Self {
            store: Arc::new(store),
            registry,
            reader_name,
            config,
            calls: 0,
        })
    }

    fn num_nodes_py(&self) -> usize {
        self.store.len()
    }

    fn num_labeled_py(&self) -> usize {
        self.store.num_labeled()
    }

    /// Build one batch from node records.
    fn batch_py(&mut self, py: Python<'_>, nodes: Vec<u64>) -> PyResult<Option<Vec<Py<PyAny>>>> {
        let count = nodes.len();
        let source = VecRecordSource::from_nodes(nodes.into_iter().map(NodeId));
        self.build(py, count, Box::new(source))
    }

    /// Build one batch from node sequences (walks).
    fn sequence_batch_py(
        &mut self,
        py: Python<'_>,
        sequences: Vec<Vec<u64>>,
    ) -> PyResult<Option<Vec<Py<PyAny>>>> {
        let count = sequences.len();
        let source = VecRecordSource::from_sequences(
            sequences
                .into_iter()
                .map(|seq| seq.into_iter().map(NodeId).collect()),
        );
        self.build(py, count, Box::new(source))
    }
}

impl InfoGraphBatcher {
    fn build(
        &mut self,
        py: Python<'_>,
        num_records: usize,
        source: Box<dyn RecordSource>,
    ) -> PyResult<Option<Vec<Py<PyAny>>>> {
        let config = self
            .config
            .clone()
            .with_batch(num_records.max(1))
            .with_seed(self.config.seed.wrapping_add(self.calls));
        self.calls += 1;

        let store: Arc<dyn GraphStore> = self.store.clone();
        let mut reader = self
            .registry
            .create(&self.reader_name, config, store, source)?;
        match reader.next_batch()? {
            Some(batch) => Ok(Some(batch_into_pyobject(py, batch)?)),
            None => Ok(None),
        }
    }
}
