//! Byte streams stored as chains of fixed-size linked blocks
//!
//! Block layout: `[next_block: BlockPointer (8 bytes LE)][data: data_size bytes]`.
//!
//! A writer always rewrites a chain from its root. When the current block
//! fills up to exactly `data_size` bytes the next block is linked in, so a
//! chain holding `n * data_size` bytes ends in an empty, cleared block.
//! Readers only ever follow pointers from the root they were given.

use super::allocator::{BlockPointer, FixedSizeAllocator};
use crate::{Result, StorageError};
use std::io;
use tracing::{trace, warn};

/// Bytes of a storage block taken by the allocator's validity bitmap
pub const VALIDITY_SIZE: usize = 8;

/// Sizes of one linked block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkedBlockLayout {
    block_size: usize,
}

impl LinkedBlockLayout {
    pub fn new(block_size: usize) -> Result<Self> {
        if block_size <= BlockPointer::SIZE {
            return Err(StorageError::Config(format!(
                "linked block of {} bytes cannot hold a {}-byte next pointer and data",
                block_size,
                BlockPointer::SIZE
            )));
        }
        Ok(Self { block_size })
    }

    /// Layout filling one host block minus the validity bitmap
    pub fn for_storage_block(storage_block_size: usize) -> Result<Self> {
        let block_size = storage_block_size.checked_sub(VALIDITY_SIZE).ok_or_else(|| {
            StorageError::Config(format!("storage block of {} bytes is too small", storage_block_size))
        })?;
        Self::new(block_size)
    }

    pub fn block_size(self) -> usize {
        self.block_size
    }

    pub fn data_size(self) -> usize {
        self.block_size - BlockPointer::SIZE
    }

    fn next_block(block: &[u8]) -> BlockPointer {
        let mut raw = [0u8; BlockPointer::SIZE];
        raw.copy_from_slice(&block[..BlockPointer::SIZE]);
        BlockPointer::from_le_bytes(raw)
    }

    fn set_next_block(block: &mut [u8], next: BlockPointer) {
        block[..BlockPointer::SIZE].copy_from_slice(&next.to_le_bytes());
    }
}

/// Sequential reader over a linked block chain
pub struct LinkedBlockReader<'a> {
    allocator: &'a mut FixedSizeAllocator,
    layout: LinkedBlockLayout,
    root_pointer: BlockPointer,
    current_pointer: BlockPointer,
    position_in_block: usize,
}

impl<'a> LinkedBlockReader<'a> {
    pub fn new(allocator: &'a mut FixedSizeAllocator, root_pointer: BlockPointer) -> Result<Self> {
        let layout = LinkedBlockLayout::new(allocator.segment_size())?;
        Ok(Self {
            allocator,
            layout,
            root_pointer,
            current_pointer: root_pointer,
            position_in_block: 0,
        })
    }

    /// Rewind to the start of the chain
    pub fn reset(&mut self) {
        self.current_pointer = self.root_pointer;
        self.position_in_block = 0;
    }

    /// Fill `buffer` completely.
    ///
    /// A chain that ends before `buffer.len()` bytes is reported as
    /// [`StorageError::Corruption`]; the buffer is never silently under-filled.
    pub fn read_data(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let length = buffer.len();
        let data_size = self.layout.data_size();
        let mut bytes_read = 0;

        while bytes_read < length {
            if !self.current_pointer.is_set() {
                return Err(StorageError::Corruption(format!(
                    "linked block chain ended after {} of {} requested bytes",
                    bytes_read, length
                )));
            }

            let block = self.allocator.get(self.current_pointer)?;
            let to_read = (length - bytes_read).min(data_size - self.position_in_block);
            let start = BlockPointer::SIZE + self.position_in_block;
            buffer[bytes_read..bytes_read + to_read].copy_from_slice(&block[start..start + to_read]);

            bytes_read += to_read;
            self.position_in_block += to_read;

            if self.position_in_block == data_size {
                self.position_in_block = 0;
                self.current_pointer = LinkedBlockLayout::next_block(block);
            }
        }

        Ok(bytes_read)
    }
}

impl io::Read for LinkedBlockReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_data(buf).map_err(io::Error::from)
    }
}

/// What a finished write pass produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChainSummary {
    pub bytes: u64,
    pub blocks: usize,
    pub reclaimed_blocks: usize,
}

/// Sequential writer over a linked block chain
///
/// Blocks of the previous chain are reused in order while rewriting; any left
/// over when the pass finishes are returned to the allocator.
pub struct LinkedBlockWriter<'a> {
    allocator: &'a mut FixedSizeAllocator,
    layout: LinkedBlockLayout,
    root_pointer: BlockPointer,
    current_pointer: BlockPointer,
    position_in_block: usize,
    /// Old chain blocks, last element is the next one to reuse
    recycled: Vec<BlockPointer>,
    bytes_written: u64,
    blocks: usize,
}

impl<'a> LinkedBlockWriter<'a> {
    pub fn new(allocator: &'a mut FixedSizeAllocator, root_pointer: BlockPointer) -> Result<Self> {
        let layout = LinkedBlockLayout::new(allocator.segment_size())?;
        Ok(Self {
            allocator,
            layout,
            root_pointer,
            current_pointer: root_pointer,
            position_in_block: 0,
            recycled: Vec::new(),
            bytes_written: 0,
            blocks: 1,
        })
    }

    /// Unset the current block's next pointer and zero its payload
    pub fn clear_current_block(&mut self) -> Result<()> {
        self.allocator.get_mut(self.current_pointer)?.fill(0);
        Ok(())
    }

    /// Rewind to the root and clear it. Destroys the previous chain contents.
    pub fn reset(&mut self) -> Result<()> {
        self.recycled = self.collect_old_tail();
        self.current_pointer = self.root_pointer;
        self.position_in_block = 0;
        self.bytes_written = 0;
        self.blocks = 1;
        self.clear_current_block()
    }

    pub fn write_data(&mut self, buffer: &[u8]) -> Result<()> {
        let length = buffer.len();
        let data_size = self.layout.data_size();
        let mut bytes_written = 0;

        while bytes_written < length {
            let to_write = (length - bytes_written).min(data_size - self.position_in_block);
            let start = BlockPointer::SIZE + self.position_in_block;
            let block = self.allocator.get_mut(self.current_pointer)?;
            block[start..start + to_write].copy_from_slice(&buffer[bytes_written..bytes_written + to_write]);

            bytes_written += to_write;
            self.position_in_block += to_write;

            if self.position_in_block == data_size {
                self.position_in_block = 0;
                let next = match self.recycled.pop() {
                    Some(ptr) => ptr,
                    None => self.allocator.allocate()?,
                };
                LinkedBlockLayout::set_next_block(self.allocator.get_mut(self.current_pointer)?, next);
                self.current_pointer = next;
                self.blocks += 1;
                self.clear_current_block()?;
            }
        }

        self.bytes_written += length as u64;
        Ok(())
    }

    /// Release unused blocks of the previous chain
    pub fn finish(mut self) -> Result<ChainSummary> {
        let reclaimed_blocks = self.recycled.len();
        for ptr in self.recycled.drain(..) {
            self.allocator.free(ptr)?;
        }
        trace!(bytes = self.bytes_written, blocks = self.blocks, reclaimed_blocks, "linked block chain written");
        Ok(ChainSummary { bytes: self.bytes_written, blocks: self.blocks, reclaimed_blocks })
    }

    /// Blocks chained after the root before this pass started.
    ///
    /// A chain that cannot be walked is left alone; its blocks just stay
    /// allocated until the allocator is reset.
    fn collect_old_tail(&mut self) -> Vec<BlockPointer> {
        let limit = self.allocator.allocated_segments();
        let mut tail = Vec::new();
        let mut ptr = match self.allocator.get(self.root_pointer) {
            Ok(block) => LinkedBlockLayout::next_block(block),
            Err(_) => return tail,
        };

        while ptr.is_set() {
            if tail.len() >= limit || ptr == self.root_pointer {
                warn!(root = self.root_pointer.raw(), "linked block chain loops, not reclaiming");
                return Vec::new();
            }
            tail.push(ptr);
            ptr = match self.allocator.get(ptr) {
                Ok(block) => LinkedBlockLayout::next_block(block),
                Err(e) => {
                    warn!(error = %e, "previous linked block chain is broken, not reclaiming");
                    return Vec::new();
                }
            };
        }

        tail.reverse();
        tail
    }
}

impl io::Write for LinkedBlockWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_data(buf).map_err(io::Error::from)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryBlockManager;
    use std::sync::Arc;

    const STORAGE_BLOCK: usize = 64;

    fn setup() -> (FixedSizeAllocator, LinkedBlockLayout) {
        let layout = LinkedBlockLayout::for_storage_block(STORAGE_BLOCK).unwrap();
        let manager = Arc::new(InMemoryBlockManager::new(STORAGE_BLOCK));
        let allocator = FixedSizeAllocator::new(layout.block_size(), manager).unwrap();
        (allocator, layout)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn write_chain(allocator: &mut FixedSizeAllocator, root: BlockPointer, bytes: &[u8]) -> ChainSummary {
        let mut writer = LinkedBlockWriter::new(allocator, root).unwrap();
        writer.reset().unwrap();
        writer.write_data(bytes).unwrap();
        writer.finish().unwrap()
    }

    #[test]
    fn test_layout_sizes() {
        let layout = LinkedBlockLayout::for_storage_block(STORAGE_BLOCK).unwrap();
        assert_eq!(layout.block_size(), 56);
        assert_eq!(layout.data_size(), 48);
        assert!(LinkedBlockLayout::new(BlockPointer::SIZE).is_err());
        assert!(LinkedBlockLayout::for_storage_block(4).is_err());
    }

    #[test]
    fn test_chain_integrity_at_boundaries() {
        let (mut allocator, layout) = setup();
        let data_size = layout.data_size();

        for len in [0, 1, data_size - 1, data_size, data_size + 1, data_size * 7 + 5] {
            let root = allocator.allocate().unwrap();
            let bytes = pattern(len);
            let summary = write_chain(&mut allocator, root, &bytes);
            assert_eq!(summary.bytes, len as u64);
            assert_eq!(summary.blocks, len / data_size + 1);

            let mut reader = LinkedBlockReader::new(&mut allocator, root).unwrap();
            let mut out = vec![0u8; len];
            assert_eq!(reader.read_data(&mut out).unwrap(), len);
            assert_eq!(out, bytes, "length {}", len);
        }
    }

    #[test]
    fn test_piecewise_writes_and_reads() {
        let (mut allocator, _) = setup();
        let root = allocator.allocate().unwrap();
        let bytes = pattern(500);

        {
            let mut writer = LinkedBlockWriter::new(&mut allocator, root).unwrap();
            writer.reset().unwrap();
            for piece in bytes.chunks(7) {
                writer.write_data(piece).unwrap();
            }
            writer.finish().unwrap();
        }

        let mut reader = LinkedBlockReader::new(&mut allocator, root).unwrap();
        let mut out = Vec::new();
        let mut piece = [0u8; 13];
        while out.len() + piece.len() <= bytes.len() {
            reader.read_data(&mut piece).unwrap();
            out.extend_from_slice(&piece);
        }
        let mut rest = vec![0u8; bytes.len() - out.len()];
        reader.read_data(&mut rest).unwrap();
        out.extend_from_slice(&rest);
        assert_eq!(out, bytes);

        reader.reset();
        let mut again = vec![0u8; 20];
        reader.read_data(&mut again).unwrap();
        assert_eq!(&again[..], &bytes[..20]);
    }

    #[test]
    fn test_short_chain_is_corruption() {
        let (mut allocator, layout) = setup();
        let root = allocator.allocate().unwrap();
        write_chain(&mut allocator, root, &pattern(layout.data_size() + 3));

        // The chain holds two blocks; asking for three blocks worth runs off the end
        let mut reader = LinkedBlockReader::new(&mut allocator, root).unwrap();
        let mut out = vec![0u8; layout.data_size() * 3];
        assert!(matches!(reader.read_data(&mut out), Err(StorageError::Corruption(_))));
    }

    #[test]
    fn test_rewrite_shorter_reclaims_tail() {
        let (mut allocator, layout) = setup();
        let root = allocator.allocate().unwrap();
        write_chain(&mut allocator, root, &pattern(layout.data_size() * 5));
        assert_eq!(allocator.allocated_segments(), 6);

        let short = vec![7u8; 10];
        let summary = write_chain(&mut allocator, root, &short);
        assert_eq!(summary.reclaimed_blocks, 5);
        assert_eq!(allocator.allocated_segments(), 1);

        let mut reader = LinkedBlockReader::new(&mut allocator, root).unwrap();
        let mut out = vec![0u8; 10];
        reader.read_data(&mut out).unwrap();
        assert_eq!(out, short);
    }

    #[test]
    fn test_rewrite_longer_reuses_then_extends() {
        let (mut allocator, layout) = setup();
        let root = allocator.allocate().unwrap();
        write_chain(&mut allocator, root, &pattern(layout.data_size() * 2));
        assert_eq!(allocator.allocated_segments(), 3);

        let long = pattern(layout.data_size() * 4 + 1);
        let summary = write_chain(&mut allocator, root, &long);
        assert_eq!(summary.reclaimed_blocks, 0);
        assert_eq!(allocator.allocated_segments(), 5);

        let mut reader = LinkedBlockReader::new(&mut allocator, root).unwrap();
        let mut out = vec![0u8; long.len()];
        reader.read_data(&mut out).unwrap();
        assert_eq!(out, long);
    }

    #[test]
    fn test_io_adapters() {
        use std::io::{Read, Write};

        let (mut allocator, _) = setup();
        let root = allocator.allocate().unwrap();
        {
            let mut writer = LinkedBlockWriter::new(&mut allocator, root).unwrap();
            writer.reset().unwrap();
            writer.write_all(b"streamed through io::Write").unwrap();
            writer.finish().unwrap();
        }

        let mut reader = LinkedBlockReader::new(&mut allocator, root).unwrap();
        let mut out = [0u8; 26];
        reader.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"streamed through io::Write");
    }
}
