//! Persisted description of where an index lives

use crate::storage::{AllocatorInfo, BufferSnapshot};
use crate::Result;
use serde::{Deserialize, Serialize};

/// Storage-info record kept by the host catalog for each index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStorageInfo {
    pub name: String,

    /// Raw root `BlockPointer` of the serialized graph, 0 when never persisted
    pub root: u64,

    /// One entry per allocator owned by the index
    pub allocator_infos: Vec<AllocatorInfo>,

    /// Buffer contents carried in the WAL instead of blocks
    pub buffers: Vec<Vec<BufferSnapshot>>,
}

impl IndexStorageInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    /// Whether the record points at previously persisted data
    pub fn is_valid(&self) -> bool {
        self.root != 0 || !self.allocator_infos.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_info_is_invalid() {
        let info = IndexStorageInfo::new("idx");
        assert!(!info.is_valid());
        assert_eq!(info.name, "idx");
    }

    #[test]
    fn test_bytes_roundtrip() {
        let info = IndexStorageInfo {
            name: "embeddings_hnsw".into(),
            root: 0x8000_0001_0000_0002,
            allocator_infos: vec![AllocatorInfo {
                segment_size: 56,
                buffer_ids: vec![0],
                block_ids: vec![4],
                segment_counts: vec![3],
                allocation_masks: vec![vec![0b111]],
            }],
            buffers: Vec::new(),
        };
        assert!(info.is_valid());
        let restored = IndexStorageInfo::from_bytes(&info.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, info);
        assert!(IndexStorageInfo::from_bytes(&[1, 2]).is_err());
    }
}
