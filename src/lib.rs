//! HNSW Block Store
//!
//! Persistent, concurrently accessible HNSW vector index embedded in a
//! page-oriented storage engine.
//!
//! ## Architecture
//! - Storage layer: fixed-size host blocks, a segment allocator on top of
//!   them, and linked block chains carrying arbitrary byte streams
//! - Index layer: an HNSW graph behind the `VectorGraph` trait, and the
//!   `HnswIndex` lifecycle manager that keeps it durable on the block store
//! - Catalog: registry exposing the index kind to the host under `HNSW`
//!
//! ## Example
//! ```
//! use hnsw_blockstore::{CreateIndexInput, HnswIndex, InMemoryBlockManager, LogicalType, VectorChunk};
//! use std::sync::Arc;
//!
//! let blocks = Arc::new(InMemoryBlockManager::new(4096));
//! let column = LogicalType::array(LogicalType::Float, 3);
//! let index: HnswIndex = HnswIndex::create(CreateIndexInput::new("items_embedding", column, blocks))?;
//!
//! let chunk = VectorChunk::from_rows(3, &[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]])?;
//! index.append(&chunk, &[1, 2])?;
//!
//! let mut scan = index.initialize_scan(&[0.9, 0.1, 0.0], 1)?;
//! let mut out = [0u64; 1];
//! assert_eq!(index.scan(&mut scan, &mut out), 1);
//! assert_eq!(out[0], 1);
//!
//! let info = index.storage_info(false)?;
//! assert!(info.is_valid());
//! # Ok::<(), hnsw_blockstore::StorageError>(())
//! ```

pub mod catalog;
pub mod config;
pub mod distance;
pub mod index;
pub mod storage;
pub mod types;

mod error;

pub use catalog::{register_hnsw_index, IndexTypeRegistry};
pub use config::{HnswConfig, IndexOptions, OptionValue};
pub use distance::MetricKind;
pub use error::{Result, StorageError};
pub use index::{
    CreateIndexInput, HnswGraph, HnswIndex, HnswIndexStats, HnswScanState, Index, IndexStorageInfo, SearchMatch,
    ThreadHint, VectorGraph,
};
pub use storage::{
    BlockManager, BlockPointer, CheckpointType, FileBlockManager, FixedSizeAllocator, InMemoryBlockManager,
    LinkedBlockReader, LinkedBlockWriter,
};
pub use types::{IndexConstraintType, LogicalType, RowId, ScalarKind, VectorChunk};
