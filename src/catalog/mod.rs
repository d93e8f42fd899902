//! Catalog integration

mod registry;

pub use registry::{register_hnsw_index, IndexFactory, IndexTypeEntry, IndexTypeRegistry};
