//! Flat batch of fixed-size vectors handed to the index by the host

use crate::{Result, StorageError};

/// Row-major batch of vectors sharing one dimension
#[derive(Debug, Clone, PartialEq)]
pub struct VectorChunk {
    dimensions: usize,
    data: Vec<f32>,
}

impl VectorChunk {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions, data: Vec::new() }
    }

    /// Wrap an already flattened buffer
    pub fn from_flat(dimensions: usize, data: Vec<f32>) -> Result<Self> {
        if dimensions == 0 || data.len() % dimensions != 0 {
            return Err(StorageError::InvalidArgument(format!(
                "flat buffer of {} floats does not divide into {}-dimensional rows",
                data.len(),
                dimensions
            )));
        }
        Ok(Self { dimensions, data })
    }

    pub fn from_rows<V: AsRef<[f32]>>(dimensions: usize, rows: &[V]) -> Result<Self> {
        let mut chunk = Self::new(dimensions);
        for row in rows {
            chunk.push(row.as_ref())?;
        }
        Ok(chunk)
    }

    pub fn push(&mut self, row: &[f32]) -> Result<()> {
        if row.len() != self.dimensions {
            return Err(StorageError::InvalidArgument(format!(
                "expected {}-dimensional vector, got {}",
                self.dimensions,
                row.len()
            )));
        }
        self.data.extend_from_slice(row);
        Ok(())
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        if self.dimensions == 0 {
            0
        } else {
            self.data.len() / self.dimensions
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn row(&self, idx: usize) -> &[f32] {
        let start = idx * self.dimensions;
        &self.data[start..start + self.dimensions]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dimensions.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_rows() {
        let chunk = VectorChunk::from_rows(2, &[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(chunk.len(), 2);
        assert_eq!(chunk.row(1), &[3.0, 4.0]);
        assert_eq!(chunk.rows().count(), 2);
    }

    #[test]
    fn test_chunk_dimension_mismatch() {
        let mut chunk = VectorChunk::new(3);
        assert!(chunk.push(&[1.0, 2.0]).is_err());
        assert!(VectorChunk::from_flat(3, vec![0.0; 4]).is_err());
    }
}
