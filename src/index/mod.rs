//! Index layer implementation
//!
//! Provides the HNSW vector index and the graph abstraction it drives

pub mod hnsw;
mod hnsw_index;
mod scan;
mod storage_info;

pub use hnsw::HnswGraph;
pub use hnsw_index::{CreateIndexInput, HnswIndex, HnswIndexStats, STANDARD_VECTOR_SIZE};
pub use scan::HnswScanState;
pub use storage_info::IndexStorageInfo;

use crate::config::HnswConfig;
use crate::distance::MetricKind;
use crate::types::{RowId, ScalarKind, VectorChunk};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// One search hit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub key: RowId,
    pub distance: f32,
}

/// Edge statistics for one graph level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelStats {
    pub nodes: usize,
    pub edges: usize,
    pub max_edges: usize,
    pub allocated_bytes: usize,
}

/// Which worker is calling into the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadHint {
    #[default]
    Any,
    Worker(usize),
}

/// ANN graph driven by [`HnswIndex`]
///
/// `add` and `search` take `&self` and must be safe to call from many threads
/// at once. Everything that restructures the graph takes `&mut self`, so the
/// index only reaches it through its exclusive lock.
pub trait VectorGraph: Send + Sync + Sized {
    fn make(dimensions: usize, metric: MetricKind, scalar: ScalarKind, config: &HnswConfig) -> Result<Self>;

    /// Grow capacity to at least `capacity` vectors
    fn reserve(&mut self, capacity: usize) -> Result<()>;

    /// Live vectors
    fn size(&self) -> usize;

    fn capacity(&self) -> usize;

    fn dimensions(&self) -> usize;

    /// Approximate heap bytes held by the graph
    fn memory_usage(&self) -> usize;

    fn max_level(&self) -> usize;

    fn stats(&self, level: usize) -> LevelStats;

    fn metric_kind(&self) -> MetricKind;

    fn add(&self, key: RowId, vector: &[f32], thread: ThreadHint) -> Result<()>;

    /// Returns false when `key` is not present
    fn remove(&mut self, key: RowId) -> Result<bool>;

    /// Up to `limit` matches, closest first
    fn search(&self, query: &[f32], limit: usize) -> Result<Vec<SearchMatch>>;

    fn compact(&mut self) -> Result<()>;

    fn save_to_stream(&self, out: &mut dyn Write) -> Result<()>;

    fn load_from_stream(&mut self, input: &mut dyn Read) -> Result<()>;

    /// Drop every vector and release capacity
    fn reset(&mut self);
}

/// Host-facing index surface
///
/// The catalog hands indexes out as `Arc<dyn Index>`; everything here is
/// callable concurrently.
pub trait Index: Send + Sync {
    /// Index type name as registered in the catalog
    fn index_type(&self) -> &'static str;

    fn name(&self) -> &str;

    /// Add a batch of rows
    fn append(&self, chunk: &VectorChunk, row_ids: &[RowId]) -> Result<()>;

    /// Remove a batch of rows; unknown ids are skipped
    fn delete_rows(&self, row_ids: &[RowId]) -> Result<()>;

    /// Row ids of the `limit` closest vectors to `query`, closest first
    fn search(&self, query: &[f32], limit: usize) -> Result<Vec<RowId>>;

    /// Write pending changes and describe where they live
    fn storage_info(&self, to_wal: bool) -> Result<IndexStorageInfo>;

    /// Release every block the index owns
    fn commit_drop(&self) -> Result<()>;

    fn in_memory_size(&self) -> usize;
}
