//! Paged scan over a finished similarity search

use crate::types::RowId;

/// Result cursor produced by `HnswIndex::initialize_scan`
///
/// Holds the complete ordered row id list, so paging needs no lock.
#[derive(Debug, Clone, Default)]
pub struct HnswScanState {
    row_ids: Vec<RowId>,
    current: usize,
}

impl HnswScanState {
    pub(crate) fn new(row_ids: Vec<RowId>) -> Self {
        Self { row_ids, current: 0 }
    }

    /// Copy up to `out.len()` row ids into `out`, returning how many were produced
    pub fn next_batch(&mut self, out: &mut [RowId]) -> usize {
        let n = out.len().min(self.remaining());
        out[..n].copy_from_slice(&self.row_ids[self.current..self.current + n]);
        self.current += n;
        n
    }

    pub fn remaining(&self) -> usize {
        self.row_ids.len() - self.current
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    pub fn total(&self) -> usize {
        self.row_ids.len()
    }
}
