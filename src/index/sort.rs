//! Sort index: record ids presorted by value
//!
//! Records live in one array ordered by their sort key; records sharing a
//! key form a contiguous block ordered by record id. A parallel array holds
//! the distinct keys in comparator order and a sparse map holds the
//! cardinality of keys owned by two or more records (a missing entry means
//! exactly one record).
//!
//! Writers keep the start offset of every block in a side vector so that
//! insertion and removal only binary-search the distinct keys and then the
//! one block, never the whole record array.

use std::sync::Arc;

use super::bitmap::RecordBitmap;
use super::comparator::{format_key, SortComparator, SortKey};
use super::errors::{ensure, IndexError, IndexResult};
use super::key::{AttributeKey, RecordId};
use super::storage::{Payload, SortPayload, StoragePart};
use super::supplier::{SortedRecordsSupplier, SupplierMemo};
use super::value::Value;
use crate::transaction::{
    ArrayAccess, ArrayLayer, ArrayView, BitmapAccess, BitmapLayer, BitmapView, IdGenerator, MapAccess,
    MapLayer, MapView, StructureId, Transaction, TransactionalArray, TransactionalBitmap,
    TransactionalLayerProducer, TransactionalMap,
};

#[derive(Debug, Clone)]
pub struct SortIndex {
    id: StructureId,
    comparator: SortComparator,
    records: TransactionalArray<RecordId>,
    values: TransactionalArray<SortKey>,
    cardinalities: TransactionalMap<SortKey, u32>,
    members: TransactionalBitmap,
    starts: Option<Vec<usize>>,
    memo: SupplierMemo,
    dirty: bool,
}

#[derive(Debug, Default)]
pub struct SortIndexLayer {
    records: ArrayLayer<RecordId>,
    values: ArrayLayer<SortKey>,
    cardinalities: MapLayer<SortKey, u32>,
    members: BitmapLayer,
    starts: Option<Vec<usize>>,
    dirty: bool,
}

impl SortIndex {
    pub fn new(ids: &dyn IdGenerator, comparator: SortComparator) -> Self {
        Self {
            id: ids.next_id(),
            comparator,
            records: TransactionalArray::new(),
            values: TransactionalArray::new(),
            cardinalities: TransactionalMap::new(),
            members: TransactionalBitmap::new(),
            starts: None,
            memo: SupplierMemo::default(),
            dirty: false,
        }
    }

    pub fn comparator(&self) -> &SortComparator {
        &self.comparator
    }

    pub fn read<'a>(&'a self, tx: Option<&'a Transaction>) -> SortIndexView<'a> {
        let layer = tx.and_then(|tx| tx.layer::<SortIndexLayer>(self.id));
        let (starts, memo) = match layer {
            Some(layer) if layer.dirty => (layer.starts.as_deref(), None),
            _ => (self.starts.as_deref(), Some(&self.memo)),
        };
        SortIndexView {
            comparator: &self.comparator,
            records: self.records.view(layer.map(|l| &l.records)),
            values: self.values.view(layer.map(|l| &l.values)),
            cardinalities: self.cardinalities.view(layer.map(|l| &l.cardinalities)),
            members: self.members.view(layer.map(|l| &l.members)),
            starts,
            memo,
        }
    }

    pub fn write(&mut self) -> SortIndexWriter<'_> {
        SortIndexWriter {
            comparator: &self.comparator,
            records: self.records.access(),
            values: self.values.access(),
            cardinalities: self.cardinalities.access(),
            members: self.members.access(),
            starts: &mut self.starts,
            memo: Some(&mut self.memo),
            dirty: &mut self.dirty,
        }
    }

    pub fn write_in<'a>(&'a self, tx: &'a mut Transaction) -> IndexResult<SortIndexWriter<'a>> {
        let SortIndexLayer {
            records,
            values,
            cardinalities,
            members,
            starts,
            dirty,
        } = self.begin_layer(tx)?;
        Ok(SortIndexWriter {
            comparator: &self.comparator,
            records: self.records.access_layered(records),
            values: self.values.access_layered(values),
            cardinalities: self.cardinalities.access_layered(cardinalities),
            members: self.members.access_layered(members),
            starts,
            memo: None,
            dirty,
        })
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn reset_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn create_storage_part(&self, container: u32, attribute: &AttributeKey) -> Option<StoragePart> {
        if !self.dirty {
            return None;
        }
        Some(StoragePart::new(
            container,
            attribute.clone(),
            Payload::Sort(SortPayload {
                comparators: self.comparator.sources().to_vec(),
                records: self.records.base().to_vec(),
                values: self.values.base().to_vec(),
                cardinalities: self
                    .cardinalities
                    .base()
                    .iter()
                    .map(|(key, count)| (key.clone(), *count))
                    .collect(),
            }),
        ))
    }

    pub fn from_payload(ids: &dyn IdGenerator, payload: SortPayload) -> IndexResult<Self> {
        let comparator = SortComparator::from_sources(payload.comparators)?;
        let cardinalities: std::collections::BTreeMap<SortKey, u32> =
            payload.cardinalities.into_iter().collect();
        let expected: usize = payload
            .values
            .iter()
            .map(|key| cardinalities.get(key).map_or(1, |count| *count as usize))
            .sum();
        ensure(expected == payload.records.len(), || {
            format!(
                "sort payload holds {} records but its values account for {}",
                payload.records.len(),
                expected
            )
        })?;
        let members: RecordBitmap = payload.records.iter().copied().collect();
        ensure(members.len() == payload.records.len(), || {
            "sort payload contains duplicate records".to_string()
        })?;
        Ok(Self {
            id: ids.next_id(),
            comparator,
            records: TransactionalArray::from_vec(payload.records),
            values: TransactionalArray::from_vec(payload.values),
            cardinalities: TransactionalMap::from_map(cardinalities),
            members: TransactionalBitmap::from_bitmap(members),
            starts: None,
            memo: SupplierMemo::default(),
            dirty: false,
        })
    }
}

impl TransactionalLayerProducer for SortIndex {
    type Layer = SortIndexLayer;
    type Committed = SortIndex;

    fn structure_id(&self) -> StructureId {
        self.id
    }

    fn create_layer(&self) -> SortIndexLayer {
        SortIndexLayer::default()
    }

    fn create_copy_with_merged_layer(
        &self,
        layer: Option<SortIndexLayer>,
        _tx: &mut Transaction,
    ) -> IndexResult<SortIndex> {
        let Some(layer) = layer else {
            return Ok(self.clone());
        };
        let memo = if layer.dirty {
            SupplierMemo::default()
        } else {
            self.memo.clone()
        };
        Ok(SortIndex {
            id: self.id,
            comparator: self.comparator.clone(),
            records: self.records.merged(Some(layer.records)),
            values: self.values.merged(Some(layer.values)),
            cardinalities: self.cardinalities.merged(Some(layer.cardinalities)),
            members: self.members.merged(Some(layer.members)),
            starts: layer.starts.or_else(|| self.starts.clone()),
            memo,
            dirty: self.dirty || layer.dirty,
        })
    }
}

fn cardinality_of(cardinalities: MapView<'_, SortKey, u32>, key: &SortKey) -> usize {
    cardinalities.get(key).map_or(1, |count| *count as usize)
}

/// Start offset of every value block
fn value_starts(values: ArrayView<'_, SortKey>, cardinalities: MapView<'_, SortKey, u32>) -> Vec<usize> {
    let mut accumulator = 0;
    values
        .iter()
        .map(|key| {
            let start = accumulator;
            accumulator += cardinality_of(cardinalities, key);
            start
        })
        .collect()
}

pub struct SortIndexView<'a> {
    comparator: &'a SortComparator,
    records: ArrayView<'a, RecordId>,
    values: ArrayView<'a, SortKey>,
    cardinalities: MapView<'a, SortKey, u32>,
    members: BitmapView<'a>,
    starts: Option<&'a [usize]>,
    memo: Option<&'a SupplierMemo>,
}

impl<'a> SortIndexView<'a> {
    /// Number of records
    pub fn size(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, record: RecordId) -> bool {
        self.members.contains(record)
    }

    pub fn sorted_records(&self) -> Vec<RecordId> {
        self.records.to_vec()
    }

    /// Distinct keys in comparator order
    pub fn sorted_values(&self) -> Vec<SortKey> {
        self.values.to_vec()
    }

    pub fn cardinality(&self, key: &SortKey) -> usize {
        if self.values.binary_search_by(|probe| self.comparator.compare(probe, key)).is_ok() {
            cardinality_of(self.cardinalities, key)
        } else {
            0
        }
    }

    fn block_start(&self, index: usize) -> usize {
        match self.starts.and_then(|starts| starts.get(index)) {
            Some(start) => *start,
            None => self
                .values
                .iter()
                .take(index)
                .map(|key| cardinality_of(self.cardinalities, key))
                .sum(),
        }
    }

    /// Records sharing the single-slot key `value`
    pub fn records_equal_to(&self, value: &Value) -> IndexResult<RecordBitmap> {
        let key = self.comparator.scalar_key(value)?;
        self.records_equal_to_key(&key)
    }

    /// Records sharing the (possibly compound) key `slots`
    pub fn records_equal_to_key(&self, slots: &[Option<Value>]) -> IndexResult<RecordBitmap> {
        let key = self.comparator.key(slots)?;
        let index = match self.values.binary_search_by(|probe| self.comparator.compare(probe, &key)) {
            Ok(index) => index,
            Err(_) => {
                return Err(IndexError::invalid_usage(format!(
                    "Value `{}` is not present in the sort index!",
                    format_key(&key)
                )))
            }
        };
        let start = self.block_start(index);
        let cardinality = cardinality_of(self.cardinalities, &key);
        Ok((start..start + cardinality)
            .filter_map(|position| self.records.get(position).copied())
            .collect())
    }

    /// Records in ascending key order
    pub fn ascending_supplier(&self) -> Arc<SortedRecordsSupplier> {
        let compute = || SortedRecordsSupplier::new(self.records.to_vec());
        match self.memo {
            Some(memo) => memo.ascending(compute),
            None => Arc::new(compute()),
        }
    }

    /// Records in descending key order
    pub fn descending_supplier(&self) -> Arc<SortedRecordsSupplier> {
        let compute = || self.ascending_supplier().reversed();
        match self.memo {
            Some(memo) => memo.descending(compute),
            None => Arc::new(compute()),
        }
    }

    /// Seeker walking the keys from the lowest one
    pub fn seeker(&self) -> ComparableSeeker<'a> {
        ComparableSeeker::new(self.values, self.cardinalities, false)
    }

    /// Seeker walking the keys from the highest one
    pub fn reverse_seeker(&self) -> ComparableSeeker<'a> {
        ComparableSeeker::new(self.values, self.cardinalities, true)
    }
}

/// Answers "which key sits at output position K" for non-decreasing K
/// without materializing the record to key mapping
pub struct ComparableSeeker<'a> {
    values: ArrayView<'a, SortKey>,
    cardinalities: MapView<'a, SortKey, u32>,
    reverse: bool,
    consumed: usize,
    block_start: usize,
    block_end: usize,
    current: Option<&'a SortKey>,
}

impl<'a> ComparableSeeker<'a> {
    fn new(values: ArrayView<'a, SortKey>, cardinalities: MapView<'a, SortKey, u32>, reverse: bool) -> Self {
        Self {
            values,
            cardinalities,
            reverse,
            consumed: 0,
            block_start: 0,
            block_end: 0,
            current: None,
        }
    }

    pub fn value_at(&mut self, position: usize) -> IndexResult<&'a SortKey> {
        ensure(self.current.is_none() || position >= self.block_start, || {
            format!(
                "seeker is already past position {}, positions must not decrease",
                position
            )
        })?;
        while position >= self.block_end || self.current.is_none() {
            let count = self.values.len();
            ensure(self.consumed < count, || {
                format!("position {} is beyond the end of the sort index", position)
            })?;
            let index = if self.reverse {
                count - 1 - self.consumed
            } else {
                self.consumed
            };
            let key = self.values.get(index).ok_or_else(|| {
                IndexError::internal(format!("sort value {} vanished while seeking", index))
            })?;
            self.consumed += 1;
            self.block_start = self.block_end;
            self.block_end += cardinality_of(self.cardinalities, key);
            self.current = Some(key);
        }
        self.current
            .ok_or_else(|| IndexError::internal("seeker has no current value".to_string()))
    }
}

pub struct SortIndexWriter<'a> {
    comparator: &'a SortComparator,
    records: ArrayAccess<'a, RecordId>,
    values: ArrayAccess<'a, SortKey>,
    cardinalities: MapAccess<'a, SortKey, u32>,
    members: BitmapAccess<'a>,
    starts: &'a mut Option<Vec<usize>>,
    memo: Option<&'a mut SupplierMemo>,
    dirty: &'a mut bool,
}

impl SortIndexWriter<'_> {
    pub fn add_record(&mut self, value: &Value, record: RecordId) -> IndexResult<()> {
        let key = self.comparator.scalar_key(value)?;
        self.add_key(key, record)
    }

    pub fn add_compound_record(&mut self, slots: &[Option<Value>], record: RecordId) -> IndexResult<()> {
        let key = self.comparator.key(slots)?;
        self.add_key(key, record)
    }

    pub fn remove_record(&mut self, value: &Value, record: RecordId) -> IndexResult<()> {
        let key = self.comparator.scalar_key(value)?;
        self.remove_key(key, record)
    }

    pub fn remove_compound_record(&mut self, slots: &[Option<Value>], record: RecordId) -> IndexResult<()> {
        let key = self.comparator.key(slots)?;
        self.remove_key(key, record)
    }

    fn add_key(&mut self, key: SortKey, record: RecordId) -> IndexResult<()> {
        ensure(!self.members.contains(record), || {
            format!("Record id `{}` is already present in the sort index!", record)
        })?;
        let comparator = self.comparator;
        let starts = self
            .starts
            .get_or_insert_with(|| value_starts(self.values.view(), self.cardinalities.view()));
        let search = self
            .values
            .view()
            .binary_search_by(|probe| comparator.compare(probe, &key));

        match search {
            Ok(index) => {
                let start = block_start(starts, index)?;
                let cardinality = cardinality_of(self.cardinalities.view(), &key);
                let offset = match self
                    .records
                    .view()
                    .binary_search_in(start, start + cardinality, |probe| probe.cmp(&record))
                {
                    Ok(position) => {
                        return Err(IndexError::internal(format!(
                            "record {} sits at {} of the sort array but is not registered",
                            record, position
                        )))
                    }
                    Err(offset) => offset,
                };
                self.records.insert(offset, record);
                self.cardinalities.insert(key, cardinality as u32 + 1);
                for start in starts.iter_mut().skip(index + 1) {
                    *start += 1;
                }
            }
            Err(index) => {
                let start = match starts.get(index) {
                    Some(start) => *start,
                    None => self.records.len(),
                };
                self.records.insert(start, record);
                self.values.insert(index, key);
                starts.insert(index, start);
                for start in starts.iter_mut().skip(index + 1) {
                    *start += 1;
                }
            }
        }

        self.members.add(record);
        self.touch();
        Ok(())
    }

    fn remove_key(&mut self, key: SortKey, record: RecordId) -> IndexResult<()> {
        let comparator = self.comparator;
        let starts = self
            .starts
            .get_or_insert_with(|| value_starts(self.values.view(), self.cardinalities.view()));
        let index = match self
            .values
            .view()
            .binary_search_by(|probe| comparator.compare(probe, &key))
        {
            Ok(index) => index,
            Err(_) => {
                return Err(IndexError::invalid_usage(format!(
                    "Value `{}` is not present in the sort index!",
                    format_key(&key)
                )))
            }
        };
        let start = block_start(starts, index)?;
        let cardinality = cardinality_of(self.cardinalities.view(), &key);
        let offset = match self
            .records
            .view()
            .binary_search_in(start, start + cardinality, |probe| probe.cmp(&record))
        {
            Ok(offset) => offset,
            Err(_) => {
                return Err(IndexError::invalid_usage(format!(
                    "Record id `{}` is not linked to value `{}` in the sort index!",
                    record,
                    format_key(&key)
                )))
            }
        };
        self.records.remove(offset);

        if cardinality > 1 {
            if cardinality > 2 {
                self.cardinalities.insert(key, cardinality as u32 - 1);
            } else {
                self.cardinalities.remove(&key);
            }
            for start in starts.iter_mut().skip(index + 1) {
                *start -= 1;
            }
        } else {
            self.values.remove(index);
            starts.remove(index);
            for start in starts.iter_mut().skip(index) {
                *start -= 1;
            }
        }

        self.members.remove(record);
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        if let Some(memo) = self.memo.as_deref_mut() {
            memo.clear();
        }
        *self.dirty = true;
    }

    pub fn view(&self) -> SortIndexView<'_> {
        SortIndexView {
            comparator: self.comparator,
            records: self.records.view(),
            values: self.values.view(),
            cardinalities: self.cardinalities.view(),
            members: self.members.view(),
            starts: self.starts.as_deref(),
            memo: None,
        }
    }
}

fn block_start(starts: &[usize], index: usize) -> IndexResult<usize> {
    starts.get(index).copied().ok_or_else(|| {
        IndexError::internal(format!(
            "sort value {} has no block start ({} known)",
            index,
            starts.len()
        ))
    })
}
