//! Fixed-size block storage
//!
//! The host storage engine hands out whole blocks of `block_size()` bytes.
//! Two backends are provided: an in-memory map (tests, temporary indexes) and
//! a single file of checksummed frames.

use super::checksum::{Checksum, CHECKSUM_SIZE};
use crate::{Result, StorageError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Storage block identifier
pub type BlockId = u64;

/// Default host block size (256 KiB)
pub const DEFAULT_BLOCK_SIZE: usize = 256 * 1024;

/// Host block storage service
pub trait BlockManager: Send + Sync {
    /// Usable payload bytes per block
    fn block_size(&self) -> usize;

    /// Reserve a fresh block id
    fn allocate_block(&self) -> Result<BlockId>;

    /// Overwrite a block; shorter payloads are zero-padded
    fn write_block(&self, id: BlockId, data: &[u8]) -> Result<()>;

    /// Read a full block
    fn read_block(&self, id: BlockId) -> Result<Vec<u8>>;

    /// Return a block id for reuse
    fn free_block(&self, id: BlockId) -> Result<()>;

    /// Make all written blocks durable
    fn sync(&self) -> Result<()>;
}

fn check_payload(block_size: usize, id: BlockId, data: &[u8]) -> Result<()> {
    if data.len() > block_size {
        return Err(StorageError::InvalidArgument(format!(
            "payload of {} bytes exceeds block size {} (block {})",
            data.len(),
            block_size,
            id
        )));
    }
    Ok(())
}

#[derive(Default)]
struct MemoryBlocks {
    blocks: HashMap<BlockId, Vec<u8>>,
    free: Vec<BlockId>,
    next: BlockId,
}

/// Block manager keeping every block in memory
pub struct InMemoryBlockManager {
    block_size: usize,
    state: Mutex<MemoryBlocks>,
}

impl InMemoryBlockManager {
    pub fn new(block_size: usize) -> Self {
        Self { block_size, state: Mutex::new(MemoryBlocks::default()) }
    }

    /// Number of blocks currently holding data
    pub fn written_blocks(&self) -> usize {
        self.state.lock().blocks.len()
    }
}

impl Default for InMemoryBlockManager {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

impl BlockManager for InMemoryBlockManager {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn allocate_block(&self) -> Result<BlockId> {
        let mut state = self.state.lock();
        if let Some(id) = state.free.pop() {
            return Ok(id);
        }
        let id = state.next;
        state.next += 1;
        Ok(id)
    }

    fn write_block(&self, id: BlockId, data: &[u8]) -> Result<()> {
        check_payload(self.block_size, id, data)?;
        let mut block = vec![0u8; self.block_size];
        block[..data.len()].copy_from_slice(data);
        self.state.lock().blocks.insert(id, block);
        Ok(())
    }

    fn read_block(&self, id: BlockId) -> Result<Vec<u8>> {
        self.state
            .lock()
            .blocks
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::Corruption(format!("block {} was never written", id)))
    }

    fn free_block(&self, id: BlockId) -> Result<()> {
        let mut state = self.state.lock();
        state.blocks.remove(&id);
        state.free.push(id);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

struct FileBlocks {
    file: File,
    free: Vec<BlockId>,
    next: BlockId,
}

/// Block manager storing checksummed frames in a single file
///
/// Frame `i` lives at offset `i * (CHECKSUM_SIZE + block_size)`.
pub struct FileBlockManager {
    path: PathBuf,
    block_size: usize,
    state: Mutex<FileBlocks>,
}

impl FileBlockManager {
    /// Open or create a block file
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let frame_size = (CHECKSUM_SIZE + block_size) as u64;
        let len = file.metadata()?.len();
        if len % frame_size != 0 {
            return Err(StorageError::Corruption(format!(
                "block file {} has {} bytes, not a multiple of the {}-byte frame",
                path.display(),
                len,
                frame_size
            )));
        }

        debug!(path = %path.display(), blocks = len / frame_size, "opened block file");
        Ok(Self {
            path,
            block_size,
            state: Mutex::new(FileBlocks { file, free: Vec::new(), next: len / frame_size }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn frame_size(&self) -> u64 {
        (CHECKSUM_SIZE + self.block_size) as u64
    }
}

impl BlockManager for FileBlockManager {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn allocate_block(&self) -> Result<BlockId> {
        let mut state = self.state.lock();
        if let Some(id) = state.free.pop() {
            return Ok(id);
        }
        let id = state.next;
        state.next += 1;
        Ok(id)
    }

    fn write_block(&self, id: BlockId, data: &[u8]) -> Result<()> {
        check_payload(self.block_size, id, data)?;
        let mut payload = vec![0u8; self.block_size];
        payload[..data.len()].copy_from_slice(data);
        let frame = Checksum::encode_frame(&payload);

        let mut state = self.state.lock();
        state.file.seek(SeekFrom::Start(id * self.frame_size()))?;
        state.file.write_all(&frame)?;
        Ok(())
    }

    fn read_block(&self, id: BlockId) -> Result<Vec<u8>> {
        let mut frame = vec![0u8; CHECKSUM_SIZE + self.block_size];
        {
            let mut state = self.state.lock();
            if id >= state.next {
                return Err(StorageError::Corruption(format!(
                    "block {} is beyond the end of {}",
                    id,
                    self.path.display()
                )));
            }
            state.file.seek(SeekFrom::Start(id * self.frame_size()))?;
            if let Err(e) = state.file.read_exact(&mut frame) {
                return Err(match e.kind() {
                    ErrorKind::UnexpectedEof => StorageError::Corruption(format!(
                        "block {} was allocated but never written",
                        id
                    )),
                    _ => StorageError::Io(e),
                });
            }
        }
        Ok(Checksum::decode_frame(&frame)?.to_vec())
    }

    fn free_block(&self, id: BlockId) -> Result<()> {
        let mut state = self.state.lock();
        if id >= state.next {
            warn!(block = id, "ignoring free of unallocated block");
            return Ok(());
        }
        state.free.push(id);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.state.lock().file.sync_data()?;
        Ok(())
    }
}

/// How buffers are flushed during a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointType {
    /// Everything is written and synced
    Full,
    /// Only modified buffers are written
    Concurrent,
}

/// Collects buffer writes during a checkpoint and flushes them together
pub struct PartialBlockManager {
    block_manager: Arc<dyn BlockManager>,
    checkpoint_type: CheckpointType,
    pending: Vec<(BlockId, Vec<u8>)>,
    /// Blocks the previous checkpoint still references
    released: Vec<BlockId>,
}

impl PartialBlockManager {
    pub fn new(block_manager: Arc<dyn BlockManager>, checkpoint_type: CheckpointType) -> Self {
        Self { block_manager, checkpoint_type, pending: Vec::new(), released: Vec::new() }
    }

    pub fn checkpoint_type(&self) -> CheckpointType {
        self.checkpoint_type
    }

    pub fn block_size(&self) -> usize {
        self.block_manager.block_size()
    }

    /// Queue a buffer for writing, assigning it a block if it has none yet
    pub fn write_buffer(&mut self, existing: Option<BlockId>, data: Vec<u8>) -> Result<BlockId> {
        let id = match existing {
            Some(id) => id,
            None => self.block_manager.allocate_block()?,
        };
        self.pending.push((id, data));
        Ok(id)
    }

    /// Free `id` once this checkpoint is durable
    pub fn release_block(&mut self, id: BlockId) {
        self.released.push(id);
    }

    pub fn pending_blocks(&self) -> usize {
        self.pending.len()
    }

    /// Write every queued buffer, sync, then free the released blocks
    pub fn flush_partial_blocks(&mut self) -> Result<usize> {
        let count = self.pending.len();
        for (id, data) in self.pending.drain(..) {
            self.block_manager.write_block(id, &data)?;
        }
        self.block_manager.sync()?;
        let released = self.released.len();
        for id in self.released.drain(..) {
            self.block_manager.free_block(id)?;
        }
        debug!(blocks = count, released, checkpoint = ?self.checkpoint_type, "flushed partial blocks");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_block_roundtrip() {
        let manager = InMemoryBlockManager::new(16);
        let id = manager.allocate_block().unwrap();
        manager.write_block(id, b"abc").unwrap();
        let block = manager.read_block(id).unwrap();
        assert_eq!(block.len(), 16);
        assert_eq!(&block[..3], b"abc");
        assert!(block[3..].iter().all(|&b| b == 0));
        assert!(manager.write_block(id, &[0u8; 17]).is_err());
    }

    #[test]
    fn test_memory_free_reuses_ids() {
        let manager = InMemoryBlockManager::new(16);
        let a = manager.allocate_block().unwrap();
        let _b = manager.allocate_block().unwrap();
        manager.free_block(a).unwrap();
        assert_eq!(manager.allocate_block().unwrap(), a);
    }

    #[test]
    fn test_file_block_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index.blocks");

        {
            let manager = FileBlockManager::open(&path, 64).unwrap();
            let a = manager.allocate_block().unwrap();
            let b = manager.allocate_block().unwrap();
            manager.write_block(a, b"first").unwrap();
            manager.write_block(b, b"second").unwrap();
            manager.sync().unwrap();
        }

        let manager = FileBlockManager::open(&path, 64).unwrap();
        assert_eq!(&manager.read_block(0).unwrap()[..5], b"first");
        assert_eq!(&manager.read_block(1).unwrap()[..6], b"second");
        assert_eq!(manager.allocate_block().unwrap(), 2);
    }

    #[test]
    fn test_file_block_detects_corruption() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index.blocks");
        {
            let manager = FileBlockManager::open(&path, 32).unwrap();
            let id = manager.allocate_block().unwrap();
            manager.write_block(id, b"payload").unwrap();
        }

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[CHECKSUM_SIZE + 2] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let manager = FileBlockManager::open(&path, 32).unwrap();
        assert!(matches!(manager.read_block(0), Err(StorageError::Corruption(_))));
        assert!(matches!(manager.read_block(5), Err(StorageError::Corruption(_))));
    }

    #[test]
    fn test_partial_block_manager_flush() {
        let manager = Arc::new(InMemoryBlockManager::new(32));
        let mut partial = PartialBlockManager::new(manager.clone(), CheckpointType::Full);
        let a = partial.write_buffer(None, b"one".to_vec()).unwrap();
        let b = partial.write_buffer(Some(7), b"two".to_vec()).unwrap();
        assert_eq!(b, 7);
        assert_eq!(partial.pending_blocks(), 2);
        assert_eq!(partial.flush_partial_blocks().unwrap(), 2);
        assert_eq!(&manager.read_block(a).unwrap()[..3], b"one");
        assert_eq!(manager.written_blocks(), 2);
    }

    #[test]
    fn test_released_blocks_wait_for_flush() {
        let manager = Arc::new(InMemoryBlockManager::new(32));
        let old = manager.allocate_block().unwrap();
        manager.write_block(old, b"old").unwrap();

        let mut partial = PartialBlockManager::new(manager.clone(), CheckpointType::Full);
        partial.release_block(old);
        let fresh = partial.write_buffer(None, b"new".to_vec()).unwrap();
        assert_ne!(fresh, old);
        assert_eq!(&manager.read_block(old).unwrap()[..3], b"old");

        partial.flush_partial_blocks().unwrap();
        assert!(manager.read_block(old).is_err());
        assert_eq!(manager.written_blocks(), 1);
        assert_eq!(manager.allocate_block().unwrap(), old);
    }
}
