//! Presorted record sequences handed to the sorting front end

use std::sync::{Arc, OnceLock};

use super::bitmap::RecordBitmap;
use super::key::RecordId;

/// Record ids in output order with position lookup by record id
#[derive(Debug, Clone, PartialEq)]
pub struct SortedRecordsSupplier {
    sorted: Vec<RecordId>,
    all_records: RecordBitmap,
    /// `positions[rank(record)]` is the position of `record` in `sorted`
    positions: Vec<usize>,
}

impl SortedRecordsSupplier {
    pub fn new(sorted: Vec<RecordId>) -> Self {
        let all_records: RecordBitmap = sorted.iter().copied().collect();
        let mut positions = vec![0; all_records.len()];
        for (position, record) in sorted.iter().enumerate() {
            if let Some(rank) = all_records.index_of(*record) {
                positions[rank] = position;
            }
        }
        Self {
            sorted,
            all_records,
            positions,
        }
    }

    /// Same records in the opposite order
    pub fn reversed(&self) -> Self {
        let last = self.sorted.len().saturating_sub(1);
        Self {
            sorted: self.sorted.iter().rev().copied().collect(),
            all_records: self.all_records.clone(),
            positions: self.positions.iter().map(|p| last - p).collect(),
        }
    }

    pub fn sorted_record_ids(&self) -> &[RecordId] {
        &self.sorted
    }

    pub fn all_records(&self) -> &RecordBitmap {
        &self.all_records
    }

    pub fn position_of(&self, record: RecordId) -> Option<usize> {
        self.all_records
            .index_of(record)
            .and_then(|rank| self.positions.get(rank).copied())
    }

    /// At most `limit` records starting at output position `offset`
    pub fn page(&self, offset: usize, limit: usize) -> &[RecordId] {
        let from = offset.min(self.sorted.len());
        let to = offset.saturating_add(limit).min(self.sorted.len());
        &self.sorted[from..to]
    }

    /// Records of `filter` in output order
    pub fn sort(&self, filter: &RecordBitmap) -> Vec<RecordId> {
        let mut positions: Vec<usize> = filter
            .iter()
            .filter_map(|record| self.position_of(record))
            .collect();
        positions.sort_unstable();
        positions.into_iter().map(|p| self.sorted[p]).collect()
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }
}

/// Suppliers memoized for the committed state of an index
#[derive(Debug, Clone, Default)]
pub(crate) struct SupplierMemo {
    ascending: OnceLock<Arc<SortedRecordsSupplier>>,
    descending: OnceLock<Arc<SortedRecordsSupplier>>,
}

impl SupplierMemo {
    pub(crate) fn ascending(&self, compute: impl FnOnce() -> SortedRecordsSupplier) -> Arc<SortedRecordsSupplier> {
        Arc::clone(self.ascending.get_or_init(|| Arc::new(compute())))
    }

    pub(crate) fn descending(&self, compute: impl FnOnce() -> SortedRecordsSupplier) -> Arc<SortedRecordsSupplier> {
        Arc::clone(self.descending.get_or_init(|| Arc::new(compute())))
    }

    pub(crate) fn clear(&mut self) {
        self.ascending.take();
        self.descending.take();
    }
}
