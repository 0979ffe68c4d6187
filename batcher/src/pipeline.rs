//! Parallel batch construction.
//!
//! Each worker owns one reader and one record source; the graph store is the
//! only thing the workers share. Completed batches arrive on a bounded
//! channel in no particular order across workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, bounded};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::batch::Batch;
use crate::config::ReaderConfig;
use crate::error::{BatchError, Result};
use crate::reader::RecordSource;
use crate::registry::ReaderRegistry;
use crate::store::GraphStore;

/// Default number of completed batches buffered between workers and consumer
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// Consumer side of a running worker pool.
///
/// Iterate to receive batches; call `finish` afterwards to join the workers
/// and learn whether any of them failed.
pub struct BatchStream {
    rx: Receiver<Batch>,
    handles: Vec<JoinHandle<()>>,
    first_error: Arc<Mutex<Option<BatchError>>>,
}

impl Iterator for BatchStream {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        self.rx.recv().ok()
    }
}

impl BatchStream {
    pub fn num_workers(&self) -> usize {
        self.handles.len()
    }

    /// Stop receiving, join every worker and return the first worker error.
    pub fn finish(self) -> Result<()> {
        let BatchStream {
            rx,
            handles,
            first_error,
        } = self;
        // Unblocks workers waiting on a full channel
        drop(rx);

        for handle in handles {
            if handle.join().is_err() {
                error!("Batch worker panicked");
                first_error
                    .lock()
                    .get_or_insert(BatchError::Invariant("batch worker panicked".to_string()));
            }
        }

        match first_error.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Start one worker thread per record source.
///
/// Readers are created before any thread starts, so configuration errors are
/// returned here. Worker `i` uses `config.seed + i` for its batch-local
/// randomness. The first worker failure stops the other workers.
pub fn spawn_workers(
    registry: &ReaderRegistry,
    reader_name: &str,
    config: &ReaderConfig,
    store: Arc<dyn GraphStore>,
    sources: Vec<Box<dyn RecordSource>>,
    capacity: usize,
) -> Result<BatchStream> {
    let mut readers = Vec::with_capacity(sources.len());
    for (i, source) in sources.into_iter().enumerate() {
        let worker_config = config.clone().with_seed(config.seed.wrapping_add(i as u64));
        readers.push(registry.create(reader_name, worker_config, store.clone(), source)?);
    }

    let (tx, rx) = bounded(capacity.max(1));
    let first_error = Arc::new(Mutex::new(None));
    let stop = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::with_capacity(readers.len());

    info!(
        "Starting {} batch workers for reader {}",
        readers.len(),
        reader_name
    );

    for (i, mut reader) in readers.into_iter().enumerate() {
        let tx = tx.clone();
        let first_error = first_error.clone();
        let stop = stop.clone();

        let handle = thread::Builder::new()
            .name(format!("batch-worker-{}", i))
            .spawn(move || {
                let mut produced = 0usize;
                while !stop.load(Ordering::Relaxed) {
                    match reader.next_batch() {
                        Ok(Some(batch)) => {
                            produced += 1;
                            if tx.send(batch).is_err() {
                                // consumer went away
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            error!("Batch worker {} failed: {}", i, err);
                            stop.store(true, Ordering::Relaxed);
                            first_error.lock().get_or_insert(err);
                            break;
                        }
                    }
                }
                debug!("Batch worker {} done after {} batches", i, produced);
            })?;
        handles.push(handle);
    }

    Ok(BatchStream {
        rx,
        handles,
        first_error,
    })
}
