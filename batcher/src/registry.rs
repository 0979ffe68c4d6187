//! Name -> reader factory mapping.
//!
//! Built explicitly at startup; there is no process-wide registration.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::config::ReaderConfig;
use crate::error::{BatchError, Result};
use crate::reader::{
    INFOGRAPH_READER_ALIAS, INFOGRAPH_READER_NAME, InfoGraphReader, InstanceReader, RecordSource,
};
use crate::store::GraphStore;

pub type ReaderFactory = fn(
    ReaderConfig,
    Arc<dyn GraphStore>,
    Box<dyn RecordSource>,
) -> Result<Box<dyn InstanceReader>>;

#[derive(Clone, Default)]
pub struct ReaderRegistry {
    factories: HashMap<String, ReaderFactory>,
}

impl ReaderRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in reader
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(INFOGRAPH_READER_NAME, InfoGraphReader::create);
        registry.register(INFOGRAPH_READER_ALIAS, InfoGraphReader::create);
        registry
    }

    /// Register `factory` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: &str, factory: ReaderFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn create(
        &self,
        name: &str,
        config: ReaderConfig,
        store: Arc<dyn GraphStore>,
        source: Box<dyn RecordSource>,
    ) -> Result<Box<dyn InstanceReader>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| BatchError::UnknownReader(name.to_string()))?;
        info!("Creating instance reader {}", name);
        factory(config, store, source)
    }
}
