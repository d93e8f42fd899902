//! Index type registry for the host catalog
use crate::error::{Result, StorageError};
use crate::index::{CreateIndexInput, HnswGraph, HnswIndex, Index};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Builds an index instance from catalog input
pub type IndexFactory = Arc<dyn Fn(CreateIndexInput) -> Result<Arc<dyn Index>> + Send + Sync>;

/// Registered index kind
#[derive(Clone)]
pub struct IndexTypeEntry {
    pub name: String,
    pub create_instance: IndexFactory,
}

impl std::fmt::Debug for IndexTypeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexTypeEntry").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Index kinds known to the catalog, keyed by upper-cased type name
#[derive(Default)]
pub struct IndexTypeRegistry {
    types: DashMap<String, IndexTypeEntry>,
}

impl IndexTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an index kind; names are unique ignoring case
    pub fn register(&self, name: &str, create_instance: IndexFactory) -> Result<()> {
        let key = name.to_ascii_uppercase();
        if self.types.contains_key(&key) {
            return Err(StorageError::Config(format!("index type '{}' is already registered", name)));
        }
        self.types.insert(key, IndexTypeEntry { name: name.to_string(), create_instance });
        debug!(index_type = name, "index type registered");
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<IndexTypeEntry> {
        self.types.get(&name.to_ascii_uppercase()).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(&name.to_ascii_uppercase())
    }

    /// Instantiate an index of a registered kind
    pub fn create_instance(&self, name: &str, input: CreateIndexInput) -> Result<Arc<dyn Index>> {
        let entry = self
            .lookup(name)
            .ok_or_else(|| StorageError::Config(format!("unknown index type '{}'", name)))?;
        (entry.create_instance)(input)
    }

    /// Registered type names, sorted
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.iter().map(|e| e.value().name.clone()).collect();
        names.sort();
        names
    }
}

/// Make HNSW indexes available under the type name `HNSW`
pub fn register_hnsw_index(registry: &IndexTypeRegistry) -> Result<()> {
    registry.register(
        HnswIndex::<HnswGraph>::TYPE_NAME,
        Arc::new(|input: CreateIndexInput| -> Result<Arc<dyn Index>> {
            Ok(Arc::new(HnswIndex::<HnswGraph>::create(input)?))
        }),
    )
}
