// Build a graph store snapshot from plain-text edge, feature, context and
// label files, optionally probing it with one reader batch.
//
// Input formats (whitespace separated, `#` starts a comment line):
//   edges:    <src> <dst> [weight]
//   features: <node> <feature>:<weight> ...
//   contexts: <node> <context_node>:<weight> ...
//   labels:   <node> <label>[,<label>...]

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use batcher::{
    Batch, BatchError, FeatureEntry, GraphStore, INFOGRAPH_READER_NAME, MemoryGraphStore, NodeId,
    NodeRecord, ReaderConfig, ReaderRegistry, Result, Tensor, TrainDataType, VecRecordSource,
    WeightedEdge,
};
use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

// ============================================================================
// Text Input Parsing
// ============================================================================

fn parse_err(path: &Path, line_no: usize, msg: impl std::fmt::Display) -> BatchError {
    BatchError::Snapshot(format!("{}:{}: {}", path.display(), line_no + 1, msg))
}

/// Non-empty, non-comment lines with their zero-based line numbers
fn data_lines(path: &Path) -> Result<Vec<(usize, String)>> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        lines.push((line_no, trimmed.to_string()));
    }
    Ok(lines)
}

fn parse_node(path: &Path, line_no: usize, token: &str) -> Result<NodeId> {
    token
        .parse::<u64>()
        .map(NodeId)
        .map_err(|_| parse_err(path, line_no, format!("bad node id {:?}", token)))
}

fn parse_pair(path: &Path, line_no: usize, token: &str) -> Result<(u64, f32)> {
    let (id, weight) = token
        .split_once(':')
        .ok_or_else(|| parse_err(path, line_no, format!("expected id:weight, got {:?}", token)))?;
    let id = id
        .parse::<u64>()
        .map_err(|_| parse_err(path, line_no, format!("bad id {:?}", id)))?;
    let weight = weight
        .parse::<f32>()
        .map_err(|_| parse_err(path, line_no, format!("bad weight {:?}", weight)))?;
    Ok((id, weight))
}

struct SnapshotBuilder {
    records: BTreeMap<NodeId, NodeRecord>,
}

impl SnapshotBuilder {
    fn new() -> Self {
        Self {
            records: BTreeMap::new(),
        }
    }

    fn record(&mut self, node: NodeId) -> &mut NodeRecord {
        self.records
            .entry(node)
            .or_insert_with(|| NodeRecord::new(node))
    }

    fn read_edges(&mut self, path: &Path, undirected: bool) -> Result<usize> {
        let mut count = 0;
        for (line_no, line) in data_lines(path)? {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() < 2 || tokens.len() > 3 {
                return Err(parse_err(path, line_no, "expected <src> <dst> [weight]"));
            }
            let src = parse_node(path, line_no, tokens[0])?;
            let dst = parse_node(path, line_no, tokens[1])?;
            let weight = match tokens.get(2) {
                Some(w) => w
                    .parse::<f32>()
                    .map_err(|_| parse_err(path, line_no, format!("bad weight {:?}", w)))?,
                None => 1.0,
            };

            self.record(src).neighbors.push(WeightedEdge::new(dst, weight));
            if undirected {
                self.record(dst).neighbors.push(WeightedEdge::new(src, weight));
            } else {
                self.record(dst);
            }
            count += 1;
        }
        Ok(count)
    }

    fn read_features(&mut self, path: &Path) -> Result<usize> {
        let mut count = 0;
        for (line_no, line) in data_lines(path)? {
            let mut tokens = line.split_whitespace();
            let Some(first) = tokens.next() else { continue };
            let node = parse_node(path, line_no, first)?;
            let mut entries = Vec::new();
            for token in tokens {
                let (feature, weight) = parse_pair(path, line_no, token)?;
                entries.push(FeatureEntry::new(feature, weight));
            }
            count += entries.len();
            self.record(node).features.extend(entries);
        }
        Ok(count)
    }

    fn read_contexts(&mut self, path: &Path) -> Result<usize> {
        let mut count = 0;
        for (line_no, line) in data_lines(path)? {
            let mut tokens = line.split_whitespace();
            let Some(first) = tokens.next() else { continue };
            let node = parse_node(path, line_no, first)?;
            let mut entries = Vec::new();
            for token in tokens {
                let (context, weight) = parse_pair(path, line_no, token)?;
                entries.push(WeightedEdge::new(context, weight));
            }
            count += entries.len();
            self.record(node).contexts.extend(entries);
        }
        Ok(count)
    }

    fn read_labels(&mut self, path: &Path) -> Result<usize> {
        let mut count = 0;
        for (line_no, line) in data_lines(path)? {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() != 2 {
                return Err(parse_err(path, line_no, "expected <node> <label>[,<label>...]"));
            }
            let node = parse_node(path, line_no, tokens[0])?;
            let labels = tokens[1]
                .split(',')
                .map(|l| {
                    l.parse::<i32>()
                        .map_err(|_| parse_err(path, line_no, format!("bad label {:?}", l)))
                })
                .collect::<Result<Vec<i32>>>()?;

            let record = self.record(node);
            if record.labels.is_some() {
                warn!("Node {} labeled twice, keeping the last line", node);
            }
            record.labels = Some(labels);
            count += 1;
        }
        Ok(count)
    }

    fn build(self) -> Result<MemoryGraphStore> {
        MemoryGraphStore::new(self.records.into_values().collect())
    }
}

// ============================================================================
// Probe
// ============================================================================

fn describe_tensor(tensor: &Tensor) -> String {
    match tensor {
        Tensor::NodeIds(ids) => format!("node ids [{}]", ids.len()),
        Tensor::Positions(p) => format!("positions [{}]", p.len()),
        Tensor::Features(levels) => format!(
            "features rows/nnz per level {:?}",
            levels
                .iter()
                .map(|csr| (csr.num_rows(), csr.features.len()))
                .collect::<Vec<_>>()
        ),
        Tensor::Blocks(levels) => format!(
            "blocks {:?}",
            levels.iter().map(|b| (b.rows, b.cols)).collect::<Vec<_>>()
        ),
        Tensor::Weights(levels) => format!(
            "weights {:?}",
            levels.iter().map(|b| (b.rows, b.cols)).collect::<Vec<_>>()
        ),
        Tensor::Labels { width, values } => format!(
            "labels [{} x {}]",
            values.len() / (*width).max(1),
            width
        ),
    }
}

fn log_batch(batch: &Batch) {
    info!("Probe batch: batch_size = {}", batch.batch_size());
    let mut entries: Vec<_> = batch.iter().collect();
    entries.sort_by_key(|(name, _)| *name);
    for (name, tensor) in entries {
        info!("  {} : {}", name, describe_tensor(tensor));
    }
}

fn probe(store: MemoryGraphStore, config: &str, nodes: &[u64]) -> Result<()> {
    let config = ReaderConfig::parse(config)?;
    let source = match (config.is_train, config.train_data_type) {
        (true, TrainDataType::Sequence) => {
            VecRecordSource::from_sequences(nodes.iter().map(|&n| vec![NodeId(n)]))
        }
        _ => VecRecordSource::from_nodes(nodes.iter().copied().map(NodeId)),
    };
    let config = config.with_batch(nodes.len().max(1));

    let store = store.with_seed(config.seed);
    info!(
        "Probing with {:?} sampling over {} seed nodes",
        store.policy(),
        nodes.len()
    );
    let store: Arc<dyn GraphStore> = Arc::new(store);
    let registry = ReaderRegistry::with_defaults();
    let mut reader = registry.create(INFOGRAPH_READER_NAME, config, store, Box::new(source))?;

    match reader.next_batch()? {
        Some(batch) => log_batch(&batch),
        None => warn!("Probe produced no batch (no seed nodes given)"),
    }
    Ok(())
}

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "snapshot-builder")]
#[command(about = "Build a graph store snapshot from text edge, feature and label files.")]
struct Args {
    /// Edge list: `<src> <dst> [weight]` per line
    #[arg(short, long)]
    edges: PathBuf,

    /// Node features: `<node> <feature>:<weight> ...` per line
    #[arg(short, long)]
    features: Option<PathBuf>,

    /// Graph contexts: `<node> <context_node>:<weight> ...` per line
    #[arg(short, long)]
    contexts: Option<PathBuf>,

    /// Labels: `<node> <label>[,<label>...]` per line
    #[arg(short, long)]
    labels: Option<PathBuf>,

    /// Also add the reverse of every edge
    #[arg(short, long, default_value = "false")]
    undirected: bool,

    /// Output snapshot path
    #[arg(short, long, default_value = "graph.rkyv")]
    output: PathBuf,

    /// Reader options (`k=v;k=v`) for a one-batch probe of the snapshot
    #[arg(long)]
    probe_config: Option<String>,

    /// Seed nodes for the probe batch
    #[arg(long, value_delimiter = ',')]
    probe_nodes: Vec<u64>,
}

fn run(args: Args) -> Result<()> {
    let mut builder = SnapshotBuilder::new();

    info!("Reading edges from: {:?}", args.edges);
    let num_edges = builder.read_edges(&args.edges, args.undirected)?;
    debug!("{} edge lines", num_edges);

    if let Some(path) = &args.features {
        info!("Reading features from: {:?}", path);
        let n = builder.read_features(path)?;
        debug!("{} feature entries", n);
    }
    if let Some(path) = &args.contexts {
        info!("Reading contexts from: {:?}", path);
        let n = builder.read_contexts(path)?;
        debug!("{} context entries", n);
    }
    if let Some(path) = &args.labels {
        info!("Reading labels from: {:?}", path);
        let n = builder.read_labels(path)?;
        debug!("{} labeled lines", n);
    }

    let store = builder.build()?;
    info!(
        "Graph: {} nodes, {} edges, {} labeled",
        store.len(),
        store.num_edges(),
        store.num_labeled()
    );
    if store.num_labeled() == 0 {
        warn!("No labeled nodes; the snapshot can only serve prediction batches");
    }

    info!("Saving snapshot to: {:?}", args.output);
    store.save(&args.output)?;
    info!("Snapshot saved successfully");

    if let Some(config) = &args.probe_config {
        let store = MemoryGraphStore::load(&args.output)?;
        probe(store, config, &args.probe_nodes)?;
    }

    info!("Snapshot build complete!");
    Ok(())
}

fn main() {
    // Initialize tracing
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();
    if let Err(err) = run(args) {
        error!("{}", err);
        std::process::exit(1);
    }
}
