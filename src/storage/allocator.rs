//! Fixed-size segment allocator
//!
//! Segments of one size are packed into buffers; each buffer is backed by
//! exactly one storage block. Buffers are read from the block manager lazily
//! on first access and written back during a checkpoint.
//!
//! Addresses are [`BlockPointer`]s: `[set: 1][offset: 31][buffer_id: 32]`.
//! The all-zero pointer means "unset".

use super::block_manager::{BlockId, BlockManager, CheckpointType, PartialBlockManager};
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Address of a segment inside a [`FixedSizeAllocator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BlockPointer(u64);

impl BlockPointer {
    /// Encoded size in bytes
    pub const SIZE: usize = 8;

    const SET_FLAG: u64 = 1 << 63;
    const OFFSET_MASK: u64 = 0x7FFF_FFFF;

    pub const fn unset() -> Self {
        Self(0)
    }

    pub fn new(buffer_id: u32, offset: u32) -> Self {
        Self(Self::SET_FLAG | ((offset as u64 & Self::OFFSET_MASK) << 32) | buffer_id as u64)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_set(self) -> bool {
        self.0 != 0
    }

    pub fn buffer_id(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    pub fn offset(self) -> u32 {
        ((self.0 >> 32) & Self::OFFSET_MASK) as u32
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn to_le_bytes(self) -> [u8; Self::SIZE] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }
}

/// Persisted description of an allocator's buffers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorInfo {
    pub segment_size: u64,
    pub buffer_ids: Vec<u32>,
    pub block_ids: Vec<BlockId>,
    pub segment_counts: Vec<u64>,
    pub allocation_masks: Vec<Vec<u64>>,
}

/// In-memory copy of one buffer, written to the WAL instead of a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSnapshot {
    pub buffer_id: u32,
    pub segment_count: u64,
    pub allocation_mask: Vec<u64>,
    pub data: Vec<u8>,
}

struct FixedSizeBuffer {
    /// `None` until loaded from `block_id`
    data: Option<Vec<u8>>,
    block_id: Option<BlockId>,
    mask: Vec<u64>,
    segment_count: usize,
    dirty: bool,
}

impl FixedSizeBuffer {
    fn new_in_memory(buffer_size: usize, segments: usize) -> Self {
        Self {
            data: Some(vec![0u8; buffer_size]),
            block_id: None,
            mask: vec![0u64; mask_words(segments)],
            segment_count: 0,
            dirty: true,
        }
    }

    fn is_allocated(&self, offset: usize) -> bool {
        self.mask
            .get(offset / 64)
            .map_or(false, |word| word & (1u64 << (offset % 64)) != 0)
    }

    fn set_allocated(&mut self, offset: usize, allocated: bool) {
        let bit = 1u64 << (offset % 64);
        if allocated {
            self.mask[offset / 64] |= bit;
        } else {
            self.mask[offset / 64] &= !bit;
        }
    }

    fn first_free(&self, segments: usize) -> Option<usize> {
        (0..segments).find(|&offset| !self.is_allocated(offset))
    }
}

fn mask_words(segments: usize) -> usize {
    (segments + 63) / 64
}

/// Arena of fixed-size segments on top of a [`BlockManager`]
pub struct FixedSizeAllocator {
    segment_size: usize,
    segments_per_buffer: usize,
    buffer_size: usize,
    block_manager: Arc<dyn BlockManager>,
    buffers: BTreeMap<u32, FixedSizeBuffer>,
    /// Blocks of emptied buffers, freed by the next checkpoint
    released: Vec<BlockId>,
}

impl FixedSizeAllocator {
    pub fn new(segment_size: usize, block_manager: Arc<dyn BlockManager>) -> Result<Self> {
        let buffer_size = block_manager.block_size();
        if segment_size == 0 || segment_size > buffer_size {
            return Err(StorageError::Config(format!(
                "segment size {} does not fit a {}-byte block",
                segment_size, buffer_size
            )));
        }
        Ok(Self {
            segment_size,
            segments_per_buffer: buffer_size / segment_size,
            buffer_size,
            block_manager,
            buffers: BTreeMap::new(),
            released: Vec::new(),
        })
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn segments_per_buffer(&self) -> usize {
        self.segments_per_buffer
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Segments currently handed out
    pub fn allocated_segments(&self) -> usize {
        self.buffers.values().map(|b| b.segment_count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Storage blocks waiting for a checkpoint before they are freed
    pub fn released_blocks(&self) -> usize {
        self.released.len()
    }

    /// Bytes held by loaded buffers
    pub fn memory_usage(&self) -> usize {
        self.buffers.values().filter(|b| b.data.is_some()).count() * self.buffer_size
    }

    /// Hand out a zeroed segment
    pub fn allocate(&mut self) -> Result<BlockPointer> {
        let segments = self.segments_per_buffer;
        let candidate = self
            .buffers
            .iter()
            .find(|(_, b)| b.segment_count < segments)
            .map(|(&id, _)| id);

        let buffer_id = match candidate {
            Some(id) => {
                self.ensure_loaded(id)?;
                id
            }
            None => {
                let id = self.next_buffer_id()?;
                self.buffers.insert(id, FixedSizeBuffer::new_in_memory(self.buffer_size, segments));
                id
            }
        };

        let segment_size = self.segment_size;
        let buffer = self.buffer_mut(buffer_id)?;
        let offset = buffer.first_free(segments).ok_or_else(|| {
            StorageError::Internal(format!("buffer {} reported free space but has none", buffer_id))
        })?;
        buffer.set_allocated(offset, true);
        buffer.segment_count += 1;
        buffer.dirty = true;
        if let Some(data) = buffer.data.as_mut() {
            data[offset * segment_size..(offset + 1) * segment_size].fill(0);
        }

        Ok(BlockPointer::new(buffer_id, offset as u32))
    }

    /// Return a segment.
    ///
    /// An emptied buffer's storage block is still referenced by the last
    /// checkpoint, so it is only freed once the next one is flushed.
    pub fn free(&mut self, ptr: BlockPointer) -> Result<()> {
        let (buffer_id, offset) = self.locate(ptr)?;
        let buffer = self.buffer_mut(buffer_id)?;
        buffer.set_allocated(offset, false);
        buffer.segment_count -= 1;
        buffer.dirty = true;

        if buffer.segment_count == 0 {
            if let Some(buffer) = self.buffers.remove(&buffer_id) {
                if let Some(block_id) = buffer.block_id {
                    self.released.push(block_id);
                }
            }
        }
        Ok(())
    }

    /// Read access to a segment
    pub fn get(&mut self, ptr: BlockPointer) -> Result<&[u8]> {
        let (buffer_id, offset) = self.locate(ptr)?;
        self.ensure_loaded(buffer_id)?;
        let segment_size = self.segment_size;
        let data = self
            .buffers
            .get(&buffer_id)
            .and_then(|b| b.data.as_ref())
            .ok_or_else(|| StorageError::Internal(format!("buffer {} not loaded", buffer_id)))?;
        Ok(&data[offset * segment_size..(offset + 1) * segment_size])
    }

    /// Write access to a segment; marks its buffer dirty
    pub fn get_mut(&mut self, ptr: BlockPointer) -> Result<&mut [u8]> {
        let (buffer_id, offset) = self.locate(ptr)?;
        self.ensure_loaded(buffer_id)?;
        let segment_size = self.segment_size;
        let buffer = self.buffer_mut(buffer_id)?;
        buffer.dirty = true;
        let data = buffer
            .data
            .as_mut()
            .ok_or_else(|| StorageError::Internal(format!("buffer {} not loaded", buffer_id)))?;
        Ok(&mut data[offset * segment_size..(offset + 1) * segment_size])
    }

    /// Drop every buffer and give their storage blocks back
    pub fn reset(&mut self) {
        let buffers = std::mem::take(&mut self.buffers);
        let count = buffers.len();
        let owned = buffers.into_values().filter_map(|b| b.block_id);
        for block_id in owned.chain(self.released.drain(..)) {
            if let Err(e) = self.block_manager.free_block(block_id) {
                warn!(block_id, error = %e, "failed to free block during reset");
            }
        }
        debug!(buffers = count, "allocator reset");
    }

    /// Restore buffer descriptors from persisted metadata; data loads lazily
    pub fn init(&mut self, info: &AllocatorInfo) -> Result<()> {
        if info.segment_size as usize != self.segment_size {
            return Err(StorageError::Corruption(format!(
                "allocator segment size {} does not match expected {}",
                info.segment_size, self.segment_size
            )));
        }
        let n = info.buffer_ids.len();
        if info.block_ids.len() != n || info.segment_counts.len() != n || info.allocation_masks.len() != n {
            return Err(StorageError::Corruption("allocator metadata has mismatched lengths".into()));
        }

        self.buffers.clear();
        for i in 0..n {
            let mask = info.allocation_masks[i].clone();
            if mask.len() != mask_words(self.segments_per_buffer) {
                return Err(StorageError::Corruption(format!(
                    "allocation mask of buffer {} has {} words",
                    info.buffer_ids[i],
                    mask.len()
                )));
            }
            self.buffers.insert(
                info.buffer_ids[i],
                FixedSizeBuffer {
                    data: None,
                    // Buffers only ever logged to the WAL have no block yet
                    block_id: (info.block_ids[i] != BlockId::MAX).then_some(info.block_ids[i]),
                    mask,
                    segment_count: info.segment_counts[i] as usize,
                    dirty: false,
                },
            );
        }
        Ok(())
    }

    /// Metadata needed to reopen this allocator.
    ///
    /// Only meaningful after [`serialize_buffers`](Self::serialize_buffers)
    /// or [`restore_buffers`](Self::restore_buffers) assigned every buffer a block.
    pub fn info(&self) -> AllocatorInfo {
        let mut info = AllocatorInfo { segment_size: self.segment_size as u64, ..Default::default() };
        for (&id, buffer) in &self.buffers {
            info.buffer_ids.push(id);
            info.block_ids.push(buffer.block_id.unwrap_or(BlockId::MAX));
            info.segment_counts.push(buffer.segment_count as u64);
            info.allocation_masks.push(buffer.mask.clone());
        }
        info
    }

    /// Queue buffers for writing through a checkpoint.
    ///
    /// A full checkpoint rewrites every buffer; a concurrent one only the
    /// modified or never-written ones.
    pub fn serialize_buffers(&mut self, partial: &mut PartialBlockManager) -> Result<()> {
        let full = partial.checkpoint_type() == CheckpointType::Full;
        let ids: Vec<u32> = self.buffers.keys().copied().collect();
        for id in ids {
            let needs_write = {
                let buffer = self.buffer_mut(id)?;
                full || buffer.dirty || buffer.block_id.is_none()
            };
            if !needs_write {
                continue;
            }
            self.ensure_loaded(id)?;
            let buffer = self.buffer_mut(id)?;
            let data = buffer.data.clone().unwrap_or_default();
            buffer.block_id = Some(partial.write_buffer(buffer.block_id, data)?);
            buffer.dirty = false;
        }
        for block_id in self.released.drain(..) {
            partial.release_block(block_id);
        }
        Ok(())
    }

    /// Copy every buffer for logging instead of checkpointing
    pub fn init_serialization_to_wal(&mut self) -> Result<Vec<BufferSnapshot>> {
        let ids: Vec<u32> = self.buffers.keys().copied().collect();
        let mut snapshots = Vec::with_capacity(ids.len());
        for id in ids {
            self.ensure_loaded(id)?;
            let buffer = self.buffer_mut(id)?;
            snapshots.push(BufferSnapshot {
                buffer_id: id,
                segment_count: buffer.segment_count as u64,
                allocation_mask: buffer.mask.clone(),
                data: buffer.data.clone().unwrap_or_default(),
            });
        }
        Ok(snapshots)
    }

    /// Install buffers replayed from the WAL
    pub fn restore_buffers(&mut self, snapshots: &[BufferSnapshot]) -> Result<()> {
        for snapshot in snapshots {
            if snapshot.data.len() != self.buffer_size {
                return Err(StorageError::Corruption(format!(
                    "logged buffer {} has {} bytes, expected {}",
                    snapshot.buffer_id,
                    snapshot.data.len(),
                    self.buffer_size
                )));
            }
            let block_id = self.buffers.get(&snapshot.buffer_id).and_then(|b| b.block_id);
            self.buffers.insert(
                snapshot.buffer_id,
                FixedSizeBuffer {
                    data: Some(snapshot.data.clone()),
                    block_id,
                    mask: snapshot.allocation_mask.clone(),
                    segment_count: snapshot.segment_count as usize,
                    dirty: true,
                },
            );
        }
        Ok(())
    }

    fn next_buffer_id(&self) -> Result<u32> {
        // Reuse the lowest gap left by freed buffers
        let mut expected = 0u32;
        for &id in self.buffers.keys() {
            if id != expected {
                return Ok(expected);
            }
            expected = expected.checked_add(1).ok_or_else(|| {
                StorageError::Internal("allocator ran out of buffer ids".into())
            })?;
        }
        Ok(expected)
    }

    fn buffer_mut(&mut self, buffer_id: u32) -> Result<&mut FixedSizeBuffer> {
        self.buffers
            .get_mut(&buffer_id)
            .ok_or_else(|| StorageError::Corruption(format!("buffer {} does not exist", buffer_id)))
    }

    fn locate(&self, ptr: BlockPointer) -> Result<(u32, usize)> {
        if !ptr.is_set() {
            return Err(StorageError::Corruption("dereferenced an unset block pointer".into()));
        }
        let buffer_id = ptr.buffer_id();
        let offset = ptr.offset() as usize;
        let buffer = self.buffers.get(&buffer_id).ok_or_else(|| {
            StorageError::Corruption(format!("block pointer {:#x} names missing buffer {}", ptr.raw(), buffer_id))
        })?;
        if offset >= self.segments_per_buffer || !buffer.is_allocated(offset) {
            return Err(StorageError::Corruption(format!(
                "block pointer {:#x} names unallocated segment {} of buffer {}",
                ptr.raw(),
                offset,
                buffer_id
            )));
        }
        Ok((buffer_id, offset))
    }

    fn ensure_loaded(&mut self, buffer_id: u32) -> Result<()> {
        let block_manager = self.block_manager.clone();
        let buffer_size = self.buffer_size;
        let buffer = self.buffer_mut(buffer_id)?;
        if buffer.data.is_some() {
            return Ok(());
        }
        let block_id = buffer.block_id.ok_or_else(|| {
            StorageError::Corruption(format!("buffer {} has neither data nor a block", buffer_id))
        })?;
        let mut data = block_manager.read_block(block_id)?;
        data.resize(buffer_size, 0);
        buffer.data = Some(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryBlockManager;

    fn allocator(block_size: usize, segment_size: usize) -> (Arc<InMemoryBlockManager>, FixedSizeAllocator) {
        let manager = Arc::new(InMemoryBlockManager::new(block_size));
        let allocator = FixedSizeAllocator::new(segment_size, manager.clone()).unwrap();
        (manager, allocator)
    }

    #[test]
    fn test_block_pointer_encoding() {
        let ptr = BlockPointer::new(7, 3);
        assert!(ptr.is_set());
        assert_eq!(ptr.buffer_id(), 7);
        assert_eq!(ptr.offset(), 3);
        assert_eq!(BlockPointer::from_le_bytes(ptr.to_le_bytes()), ptr);

        // The very first segment is still distinguishable from "unset"
        assert!(BlockPointer::new(0, 0).is_set());

        let mut cleared = ptr;
        cleared.clear();
        assert!(!cleared.is_set());
        assert_eq!(cleared, BlockPointer::unset());
    }

    #[test]
    fn test_allocate_packs_segments() {
        let (_, mut alloc) = allocator(64, 16);
        assert_eq!(alloc.segments_per_buffer(), 4);

        let ptrs: Vec<_> = (0..5).map(|_| alloc.allocate().unwrap()).collect();
        assert_eq!(alloc.buffer_count(), 2);
        assert_eq!(alloc.allocated_segments(), 5);
        assert_eq!(ptrs[3].buffer_id(), 0);
        assert_eq!(ptrs[4].buffer_id(), 1);

        alloc.get_mut(ptrs[1]).unwrap().copy_from_slice(&[9u8; 16]);
        assert_eq!(alloc.get(ptrs[1]).unwrap(), &[9u8; 16]);
        assert_eq!(alloc.get(ptrs[0]).unwrap(), &[0u8; 16]);
    }

    #[test]
    fn test_free_and_reuse() {
        let (_, mut alloc) = allocator(64, 32);
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        alloc.get_mut(a).unwrap().fill(1);
        alloc.free(a).unwrap();
        assert!(alloc.get(a).is_err());

        // Reallocated segments come back zeroed
        let c = alloc.allocate().unwrap();
        assert_eq!(c, a);
        assert!(alloc.get(c).unwrap().iter().all(|&x| x == 0));

        alloc.free(b).unwrap();
        alloc.free(c).unwrap();
        assert!(alloc.is_empty());
    }

    #[test]
    fn test_emptied_buffer_block_outlives_checkpoint() {
        let (manager, mut alloc) = allocator(32, 32);
        let a = alloc.allocate().unwrap();
        alloc.get_mut(a).unwrap()[..3].copy_from_slice(b"old");
        let mut partial = PartialBlockManager::new(manager.clone(), CheckpointType::Full);
        alloc.serialize_buffers(&mut partial).unwrap();
        partial.flush_partial_blocks().unwrap();
        let old_block = alloc.info().block_ids[0];

        alloc.free(a).unwrap();
        assert_eq!(alloc.released_blocks(), 1);
        assert_eq!(&manager.read_block(old_block).unwrap()[..3], b"old");

        // The replacement buffer must not land on the still-referenced block
        let b = alloc.allocate().unwrap();
        alloc.get_mut(b).unwrap()[..3].copy_from_slice(b"new");
        alloc.serialize_buffers(&mut partial).unwrap();
        assert_ne!(alloc.info().block_ids[0], old_block);
        assert_eq!(&manager.read_block(old_block).unwrap()[..3], b"old");

        partial.flush_partial_blocks().unwrap();
        assert_eq!(alloc.released_blocks(), 0);
        assert!(manager.read_block(old_block).is_err());
        assert_eq!(manager.written_blocks(), 1);
    }

    #[test]
    fn test_invalid_pointers() {
        let (_, mut alloc) = allocator(64, 32);
        assert!(matches!(alloc.get(BlockPointer::unset()), Err(StorageError::Corruption(_))));
        assert!(alloc.get(BlockPointer::new(3, 0)).is_err());
        let _ = alloc.allocate().unwrap();
        assert!(alloc.get(BlockPointer::new(0, 1)).is_err());
    }

    #[test]
    fn test_checkpoint_and_reload() {
        let (manager, mut alloc) = allocator(64, 32);
        let a = alloc.allocate().unwrap();
        alloc.get_mut(a).unwrap()[..4].copy_from_slice(b"data");

        let mut partial = PartialBlockManager::new(manager.clone(), CheckpointType::Full);
        alloc.serialize_buffers(&mut partial).unwrap();
        partial.flush_partial_blocks().unwrap();
        let info = alloc.info();
        assert_eq!(info.buffer_ids, vec![0]);

        let mut reopened = FixedSizeAllocator::new(32, manager.clone()).unwrap();
        reopened.init(&info).unwrap();
        assert_eq!(reopened.memory_usage(), 0);
        assert_eq!(&reopened.get(a).unwrap()[..4], b"data");
        assert_eq!(reopened.memory_usage(), 64);
    }

    #[test]
    fn test_concurrent_checkpoint_skips_clean_buffers() {
        let (manager, mut alloc) = allocator(32, 32);
        let a = alloc.allocate().unwrap();
        let _b = alloc.allocate().unwrap();

        let mut partial = PartialBlockManager::new(manager.clone(), CheckpointType::Concurrent);
        alloc.serialize_buffers(&mut partial).unwrap();
        assert_eq!(partial.flush_partial_blocks().unwrap(), 2);

        alloc.get_mut(a).unwrap().fill(5);
        alloc.serialize_buffers(&mut partial).unwrap();
        assert_eq!(partial.flush_partial_blocks().unwrap(), 1);
    }

    #[test]
    fn test_wal_snapshot_restore() {
        let (manager, mut alloc) = allocator(64, 64);
        let a = alloc.allocate().unwrap();
        alloc.get_mut(a).unwrap()[0] = 42;
        let snapshots = alloc.init_serialization_to_wal().unwrap();
        assert_eq!(snapshots.len(), 1);

        let mut replayed = FixedSizeAllocator::new(64, manager).unwrap();
        replayed.restore_buffers(&snapshots).unwrap();
        assert_eq!(replayed.get(a).unwrap()[0], 42);
    }

    #[test]
    fn test_reset_frees_blocks() {
        let (manager, mut alloc) = allocator(32, 32);
        alloc.allocate().unwrap();
        let mut partial = PartialBlockManager::new(manager.clone(), CheckpointType::Full);
        alloc.serialize_buffers(&mut partial).unwrap();
        partial.flush_partial_blocks().unwrap();
        assert_eq!(manager.written_blocks(), 1);

        alloc.reset();
        assert!(alloc.is_empty());
        assert_eq!(manager.written_blocks(), 0);
    }

    #[test]
    fn test_init_rejects_mismatched_segment_size() {
        let (manager, _) = allocator(64, 32);
        let mut alloc = FixedSizeAllocator::new(16, manager).unwrap();
        let info = AllocatorInfo { segment_size: 32, ..Default::default() };
        assert!(matches!(alloc.init(&info), Err(StorageError::Corruption(_))));
    }
}
