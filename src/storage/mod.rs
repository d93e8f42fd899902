//! Storage layer implementation
//!
//! Fixed-size host blocks, a segment allocator on top of them, and linked
//! block chains that carry arbitrary-length byte streams.

pub mod allocator;
pub mod block_manager;
pub mod checksum;
pub mod linked_block;

pub use allocator::{AllocatorInfo, BlockPointer, BufferSnapshot, FixedSizeAllocator};
pub use block_manager::{
    BlockId, BlockManager, CheckpointType, FileBlockManager, InMemoryBlockManager, PartialBlockManager,
    DEFAULT_BLOCK_SIZE,
};
pub use checksum::{Checksum, ChecksumReader, ChecksumWriter};
pub use linked_block::{ChainSummary, LinkedBlockLayout, LinkedBlockReader, LinkedBlockWriter};
