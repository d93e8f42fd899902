//! HNSW index lifecycle
//!
//! Owns one [`VectorGraph`] and keeps it durable on the host block store: the
//! graph's binary stream is written through a linked block chain rooted at
//! `root`, and reloaded from the same chain when the index is reopened.
//!
//! Locking: searches and row adds share the lock; resize, delete, compact,
//! persist and drop take it exclusively. `element_count` is read and bumped
//! outside the lock so that inserting threads only serialize when the graph
//! actually has to grow.

use super::{HnswGraph, HnswScanState, Index, IndexStorageInfo, LevelStats, ThreadHint, VectorGraph};
use crate::config::{HnswConfig, IndexOptions};
use crate::distance::MetricKind;
use crate::storage::{
    BlockManager, BlockPointer, CheckpointType, FixedSizeAllocator, LinkedBlockLayout, LinkedBlockReader,
    LinkedBlockWriter, PartialBlockManager,
};
use crate::types::{IndexConstraintType, LogicalType, RowId, ScalarKind, VectorChunk};
use crate::{Result, StorageError};
use parking_lot::RwLock;
use serde::Serialize;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Row ids produced per scan call
pub const STANDARD_VECTOR_SIZE: usize = 2048;

/// Upper bound on the capacity reserved for a fresh index
const INITIAL_CAPACITY: usize = 32;

/// Distance functions an HNSW index can answer
const DISTANCE_FUNCTIONS: [&str; 3] = ["array_distance", "array_cosine_similarity", "array_inner_product"];

/// Everything needed to create or reopen an index
pub struct CreateIndexInput {
    pub name: String,
    pub constraint_type: IndexConstraintType,
    pub column_types: Vec<LogicalType>,
    pub options: IndexOptions,
    /// Present when reopening a persisted index
    pub storage_info: Option<IndexStorageInfo>,
    pub estimated_cardinality: usize,
    pub block_manager: Arc<dyn BlockManager>,
}

impl CreateIndexInput {
    pub fn new(name: impl Into<String>, column_type: LogicalType, block_manager: Arc<dyn BlockManager>) -> Self {
        Self {
            name: name.into(),
            constraint_type: IndexConstraintType::None,
            column_types: vec![column_type],
            options: IndexOptions::new(),
            storage_info: None,
            estimated_cardinality: 0,
            block_manager,
        }
    }

    pub fn with_options(mut self, options: IndexOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_storage_info(mut self, info: IndexStorageInfo) -> Self {
        self.storage_info = Some(info);
        self
    }

    pub fn with_estimated_cardinality(mut self, cardinality: usize) -> Self {
        self.estimated_cardinality = cardinality;
        self
    }
}

/// Snapshot of graph shape
#[derive(Debug, Clone, Serialize)]
pub struct HnswIndexStats {
    pub max_level: usize,
    pub count: usize,
    pub capacity: usize,
    pub approx_size: usize,
    pub level_stats: Vec<LevelStats>,
}

impl HnswIndexStats {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| StorageError::Serialization(e.to_string()))
    }
}

struct IndexState<G> {
    graph: G,
    allocator: FixedSizeAllocator,
    /// First block of the persisted graph stream, unset until the first persist
    root: BlockPointer,
}

/// Persistent, concurrently accessible HNSW index
pub struct HnswIndex<G: VectorGraph = HnswGraph> {
    name: String,
    block_manager: Arc<dyn BlockManager>,
    vector_size: usize,
    scalar: ScalarKind,
    state: RwLock<IndexState<G>>,
    /// Lock-free capacity hint, never below the graph size
    element_count: AtomicUsize,
    dirty: AtomicBool,
}

impl<G: VectorGraph> HnswIndex<G> {
    pub const TYPE_NAME: &'static str = "HNSW";

    /// Create a fresh index, or reopen one when `input.storage_info` is valid
    pub fn create(input: CreateIndexInput) -> Result<Self> {
        if input.constraint_type != IndexConstraintType::None {
            return Err(StorageError::Config(
                "HNSW indexes do not support unique or primary key constraints".into(),
            ));
        }

        let (child, vector_size) = match input.column_types.as_slice() {
            [column] => column.array_parts().ok_or_else(|| {
                StorageError::Config(format!("HNSW index column must be a fixed-size array, got {:?}", column))
            })?,
            other => {
                return Err(StorageError::Config(format!(
                    "HNSW indexes can only be created over a single column, got {}",
                    other.len()
                )))
            }
        };
        if vector_size == 0 || matches!(child, LogicalType::Varchar | LogicalType::Array { .. }) {
            return Err(StorageError::Config(format!(
                "HNSW index column must be a non-empty numeric array, got {:?}[{}]",
                child, vector_size
            )));
        }

        let scalar = ScalarKind::from_logical(child);
        let (metric, mut config) = HnswConfig::from_options(&input.options)?;
        config.enable_key_lookups = false;

        let layout = LinkedBlockLayout::for_storage_block(input.block_manager.block_size())?;
        let mut allocator = FixedSizeAllocator::new(layout.block_size(), input.block_manager.clone())?;
        let mut graph = G::make(vector_size, metric, scalar, &config)?;
        let mut root = BlockPointer::unset();

        if let Some(storage) = input.storage_info.as_ref().filter(|s| s.is_valid()) {
            root = BlockPointer::from_raw(storage.root);
            let allocator_info = storage.allocator_infos.first().ok_or_else(|| {
                StorageError::Corruption(format!("storage info of index '{}' has no allocator metadata", input.name))
            })?;
            allocator.init(allocator_info)?;
            if let Some(snapshots) = storage.buffers.first() {
                allocator.restore_buffers(snapshots)?;
            }
        }

        if allocator.allocated_segments() > 0 {
            if !root.is_set() {
                return Err(StorageError::Corruption(format!(
                    "index '{}' has stored blocks but no root pointer",
                    input.name
                )));
            }
            let mut reader = LinkedBlockReader::new(&mut allocator, root)?;
            graph.load_from_stream(&mut reader).map_err(load_error)?;
            info!(index = %input.name, vectors = graph.size(), capacity = graph.capacity(), "HNSW index loaded");
        } else {
            graph.reserve(INITIAL_CAPACITY.min(input.estimated_cardinality))?;
            info!(index = %input.name, dimensions = vector_size, %metric, scalar = scalar.name(), "HNSW index created");
        }

        let element_count = graph.size();
        Ok(Self {
            name: input.name,
            block_manager: input.block_manager,
            vector_size,
            scalar,
            state: RwLock::new(IndexState { graph, allocator, root }),
            element_count: AtomicUsize::new(element_count),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vector_size(&self) -> usize {
        self.vector_size
    }

    pub fn scalar_kind(&self) -> ScalarKind {
        self.scalar
    }

    pub fn metric(&self) -> MetricKind {
        self.state.read().graph.metric_kind()
    }

    /// Whether `name` is a distance function this index type can serve
    pub fn is_distance_function(&self, name: &str) -> bool {
        DISTANCE_FUNCTIONS.contains(&name)
    }

    /// Whether `name` is the distance function matching this index's metric
    pub fn matches_distance_function(&self, name: &str) -> bool {
        self.metric().distance_function() == name
    }

    /// Live vectors in the graph
    pub fn size(&self) -> usize {
        self.state.read().graph.size()
    }

    pub fn capacity(&self) -> usize {
        self.state.read().graph.capacity()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn root_pointer(&self) -> BlockPointer {
        self.state.read().root
    }

    /// Linked blocks currently allocated for the persisted stream
    pub fn linked_blocks(&self) -> usize {
        self.state.read().allocator.allocated_segments()
    }

    pub fn in_memory_size(&self) -> usize {
        let state = self.state.read();
        state.graph.memory_usage() + state.allocator.memory_usage()
    }

    /// Add one vector per row; any graph failure aborts the batch.
    ///
    /// Rows added before a failure stay in the graph.
    pub fn construct_rows(&self, chunk: &VectorChunk, row_ids: &[RowId], thread: ThreadHint) -> Result<()> {
        if chunk.len() != row_ids.len() {
            return Err(StorageError::InvalidArgument(format!(
                "{} vectors but {} row ids",
                chunk.len(),
                row_ids.len()
            )));
        }
        if chunk.dimensions() != self.vector_size {
            return Err(StorageError::InvalidArgument(format!(
                "index '{}' holds {}-dimensional vectors, got {}",
                self.name,
                self.vector_size,
                chunk.dimensions()
            )));
        }
        let count = chunk.len();
        if count == 0 {
            return Ok(());
        }

        self.dirty.store(true, Ordering::SeqCst);

        let needs_resize = {
            let state = self.state.read();
            self.element_count.fetch_add(count, Ordering::SeqCst) + count > state.graph.capacity()
        };

        if needs_resize {
            let mut state = self.state.write();
            // Another thread may have grown the graph while we waited
            let wanted = self.element_count.load(Ordering::SeqCst);
            let current = state.graph.capacity();
            if wanted > current {
                let capacity = wanted.next_power_of_two();
                state.graph.reserve(capacity)?;
                debug!(index = %self.name, from = current, to = capacity, "HNSW graph resized");
            }
        }

        let state = self.state.read();
        let result = row_ids.iter().zip(chunk.rows()).try_for_each(|(&row_id, vector)| {
            state
                .graph
                .add(row_id, vector, thread)
                .map_err(|e| StorageError::Internal(format!("failed to add to the HNSW index: {}", e)))
        });
        // Re-marked under the lock so a persist that ran before our adds cannot hide them
        self.dirty.store(true, Ordering::SeqCst);
        result
    }

    pub fn append(&self, chunk: &VectorChunk, row_ids: &[RowId]) -> Result<()> {
        self.construct_rows(chunk, row_ids, ThreadHint::Any)
    }

    pub fn insert(&self, chunk: &VectorChunk, row_ids: &[RowId]) -> Result<()> {
        self.construct_rows(chunk, row_ids, ThreadHint::Any)
    }

    /// Remove rows; ids not in the graph are skipped
    pub fn delete_rows(&self, row_ids: &[RowId]) -> Result<()> {
        self.dirty.store(true, Ordering::SeqCst);
        let mut state = self.state.write();

        let mut removed = 0usize;
        for &row_id in row_ids {
            match state.graph.remove(row_id) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(index = %self.name, row_id, error = %e, "failed to remove row from HNSW index"),
            }
        }

        // Inserts that already reserved room keep their share of the count
        self.element_count.fetch_sub(removed, Ordering::SeqCst);
        self.dirty.store(true, Ordering::SeqCst);
        debug!(index = %self.name, requested = row_ids.len(), removed, "rows deleted");
        Ok(())
    }

    /// Rebuild the graph without tombstones
    pub fn compact(&self) -> Result<()> {
        self.dirty.store(true, Ordering::SeqCst);
        let mut state = self.state.write();
        let result = state
            .graph
            .compact()
            .map_err(|e| StorageError::Internal(format!("failed to compact the HNSW index: {}", e)));
        self.dirty.store(true, Ordering::SeqCst);
        result
    }

    /// Run the search under the shared lock and return a lock-free cursor
    pub fn initialize_scan(&self, query: &[f32], limit: usize) -> Result<HnswScanState> {
        if query.len() != self.vector_size {
            return Err(StorageError::InvalidArgument(format!(
                "query has {} dimensions, index '{}' expects {}",
                query.len(),
                self.name,
                self.vector_size
            )));
        }

        let matches = {
            let state = self.state.read();
            state.graph.search(query, limit)?
        };
        Ok(HnswScanState::new(matches.into_iter().map(|m| m.key).collect()))
    }

    /// Produce the next page of row ids, at most [`STANDARD_VECTOR_SIZE`]
    pub fn scan(&self, scan: &mut HnswScanState, out: &mut [RowId]) -> usize {
        let page = out.len().min(STANDARD_VECTOR_SIZE);
        scan.next_batch(&mut out[..page])
    }

    /// Write the graph through the linked block chain if it changed.
    ///
    /// Returns whether anything was written.
    pub fn persist_to_disk(&self) -> Result<bool> {
        let mut guard = self.state.write();
        if !self.dirty.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let state = &mut *guard;
        if !state.root.is_set() {
            state.root = state.allocator.allocate()?;
        }

        let mut writer = LinkedBlockWriter::new(&mut state.allocator, state.root)?;
        writer.reset()?;
        state.graph.save_to_stream(&mut writer)?;
        let summary = writer.finish()?;

        self.dirty.store(false, Ordering::SeqCst);
        debug!(
            index = %self.name,
            bytes = summary.bytes,
            blocks = summary.blocks,
            reclaimed = summary.reclaimed_blocks,
            "HNSW index persisted"
        );
        Ok(true)
    }

    /// Persist, then describe the index for the catalog with a full checkpoint
    pub fn storage_info(&self, to_wal: bool) -> Result<IndexStorageInfo> {
        self.storage_info_with(to_wal, CheckpointType::Full)
    }

    /// Persist, then either flush allocator buffers to blocks or copy them for the WAL
    pub fn storage_info_with(&self, to_wal: bool, checkpoint_type: CheckpointType) -> Result<IndexStorageInfo> {
        self.persist_to_disk()?;

        let mut state = self.state.write();
        let mut info = IndexStorageInfo::new(self.name.clone());
        info.root = state.root.raw();

        if to_wal {
            info.buffers.push(state.allocator.init_serialization_to_wal()?);
        } else {
            let mut partial = PartialBlockManager::new(self.block_manager.clone(), checkpoint_type);
            state.allocator.serialize_buffers(&mut partial)?;
            partial.flush_partial_blocks()?;
        }
        info.allocator_infos.push(state.allocator.info());
        Ok(info)
    }

    /// Discard the graph and every block it was stored in
    pub fn commit_drop(&self) -> Result<()> {
        let mut state = self.state.write();
        let live = state.graph.size();
        state.graph.reset();
        self.element_count.fetch_sub(live, Ordering::SeqCst);
        state.allocator.reset();
        state.root.clear();
        self.dirty.store(false, Ordering::SeqCst);
        info!(index = %self.name, "HNSW index dropped");
        Ok(())
    }

    pub fn stats(&self) -> HnswIndexStats {
        let state = self.state.write();
        let max_level = state.graph.max_level();
        HnswIndexStats {
            max_level,
            count: state.graph.size(),
            capacity: state.graph.capacity(),
            approx_size: state.graph.memory_usage(),
            level_stats: (0..=max_level).map(|level| state.graph.stats(level)).collect(),
        }
    }

    pub fn merge_indexes(&self, _other: &HnswIndex<G>) -> Result<()> {
        Err(StorageError::NotImplemented("HNSW indexes do not support merging".into()))
    }

    pub fn vacuum(&self) -> Result<()> {
        Ok(())
    }

    /// HNSW indexes enforce no constraints
    pub fn verify_append(&self, _chunk: &VectorChunk) -> Result<()> {
        Ok(())
    }

    pub fn check_constraints_for_chunk(&self, _chunk: &VectorChunk) -> Result<()> {
        Err(StorageError::NotImplemented("HNSW indexes do not support constraint checking".into()))
    }

    pub fn verify_and_to_string(&self, _only_verify: bool) -> Result<String> {
        Err(StorageError::NotImplemented("HNSW indexes do not support verification".into()))
    }
}

impl<G: VectorGraph> Index for HnswIndex<G> {
    fn index_type(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn append(&self, chunk: &VectorChunk, row_ids: &[RowId]) -> Result<()> {
        HnswIndex::append(self, chunk, row_ids)
    }

    fn delete_rows(&self, row_ids: &[RowId]) -> Result<()> {
        HnswIndex::delete_rows(self, row_ids)
    }

    fn search(&self, query: &[f32], limit: usize) -> Result<Vec<RowId>> {
        let mut scan = self.initialize_scan(query, limit)?;
        let mut row_ids = vec![0; scan.total()];
        let mut filled = 0;
        while filled < row_ids.len() {
            let n = self.scan(&mut scan, &mut row_ids[filled..]);
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(row_ids)
    }

    fn storage_info(&self, to_wal: bool) -> Result<IndexStorageInfo> {
        HnswIndex::storage_info(self, to_wal)
    }

    fn commit_drop(&self) -> Result<()> {
        HnswIndex::commit_drop(self)
    }

    fn in_memory_size(&self) -> usize {
        HnswIndex::in_memory_size(self)
    }
}

/// Broken chains and bad streams are corruption; anything else is a failed load
fn load_error(err: StorageError) -> StorageError {
    match err {
        StorageError::Io(e) if matches!(e.kind(), ErrorKind::InvalidData | ErrorKind::UnexpectedEof) => {
            StorageError::Corruption(e.to_string())
        }
        e @ StorageError::Corruption(_) => e,
        other => StorageError::Internal(format!("failed to load the HNSW index: {}", other)),
    }
}
