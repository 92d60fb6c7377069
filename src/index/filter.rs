//! Filter index: inverted index from normalized value to record bitmap
//!
//! Comparison queries binary-search the ordered buckets and return a lazy
//! union of the matching bitmaps. Text queries (prefix, suffix, infix)
//! scan every bucket linearly.
//!
//! Range-typed attributes additionally feed a [`RangeIndex`] answering
//! "valid at" and "overlapping" queries.

use std::ops::Bound;
use std::sync::{Arc, OnceLock};

use super::bitmap::{RecordBitmap, RecordSet};
use super::errors::{ensure, IndexError, IndexResult};
use super::key::{AttributeKey, RecordId};
use super::range::{RangeIndex, RangeIndexLayer, RangeIndexView, RangeIndexWriter};
use super::storage::{FilterPayload, Payload, StoragePart};
use super::value::{consolidate, AttributeValue, Range, Value, ValueType};
use crate::transaction::{
    IdGenerator, MapAccess, MapLayer, MapView, StructureId, Transaction, TransactionalLayerProducer,
    TransactionalMap,
};

pub const ERROR_RANGE_TYPE_NOT_SUPPORTED: &str = "This filter index doesn't handle Range type!";

#[derive(Debug, Clone)]
pub struct FilterIndex {
    id: StructureId,
    value_type: ValueType,
    histogram: TransactionalMap<Value, Arc<RecordBitmap>>,
    range_index: Option<RangeIndex>,
    all_records: OnceLock<Arc<RecordBitmap>>,
    dirty: bool,
}

#[derive(Debug, Default)]
pub struct FilterIndexLayer {
    histogram: MapLayer<Value, Arc<RecordBitmap>>,
    range: Option<RangeIndexLayer>,
    dirty: bool,
}

impl FilterIndex {
    pub fn new(ids: &dyn IdGenerator, value_type: ValueType) -> Self {
        Self {
            id: ids.next_id(),
            value_type,
            histogram: TransactionalMap::new(),
            range_index: (value_type == ValueType::Range).then(|| RangeIndex::new(ids)),
            all_records: OnceLock::new(),
            dirty: false,
        }
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn has_range_index(&self) -> bool {
        self.range_index.is_some()
    }

    pub fn read<'a>(&'a self, tx: Option<&'a Transaction>) -> FilterIndexView<'a> {
        self.view(tx.and_then(|tx| tx.layer::<FilterIndexLayer>(self.id)))
    }

    pub fn write(&mut self) -> FilterIndexWriter<'_> {
        FilterIndexWriter {
            value_type: self.value_type,
            histogram: self.histogram.access(),
            range: self.range_index.as_mut().map(RangeIndex::write),
            memo: Some(&mut self.all_records),
            dirty: &mut self.dirty,
        }
    }

    pub fn write_in<'a>(&'a self, tx: &'a mut Transaction) -> IndexResult<FilterIndexWriter<'a>> {
        let layer = self.begin_layer(tx)?;
        Ok(self.overlay(layer))
    }

    pub(crate) fn view<'a>(&'a self, layer: Option<&'a FilterIndexLayer>) -> FilterIndexView<'a> {
        let memo = match layer {
            Some(layer) if layer.dirty => None,
            _ => Some(&self.all_records),
        };
        FilterIndexView {
            value_type: self.value_type,
            histogram: self.histogram.view(layer.map(|l| &l.histogram)),
            range: self
                .range_index
                .as_ref()
                .map(|range| range.view(layer.and_then(|l| l.range.as_ref()))),
            memo,
        }
    }

    pub(crate) fn overlay<'a>(&'a self, layer: &'a mut FilterIndexLayer) -> FilterIndexWriter<'a> {
        let FilterIndexLayer {
            histogram,
            range,
            dirty,
        } = layer;
        let range = match &self.range_index {
            Some(range_index) => Some(range_index.overlay(range.get_or_insert_with(Default::default))),
            None => None,
        };
        FilterIndexWriter {
            value_type: self.value_type,
            histogram: self.histogram.access_layered(histogram),
            range,
            memo: None,
            dirty,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty || self.range_index.as_ref().is_some_and(RangeIndex::is_dirty)
    }

    pub fn reset_dirty(&mut self) {
        self.dirty = false;
        if let Some(range) = self.range_index.as_mut() {
            range.reset_dirty();
        }
    }

    /// Snapshot for persistence; `None` when nothing changed since the last flush
    pub fn create_storage_part(&self, container: u32, attribute: &AttributeKey) -> Option<StoragePart> {
        if !self.is_dirty() {
            return None;
        }
        Some(StoragePart::new(
            container,
            attribute.clone(),
            Payload::Filter(FilterPayload {
                value_type: self.value_type,
                histogram: self
                    .histogram
                    .base()
                    .iter()
                    .map(|(value, records)| (value.clone(), (**records).clone()))
                    .collect(),
                range: self.range_index.as_ref().map(RangeIndex::to_payload),
            }),
        ))
    }

    pub fn from_payload(ids: &dyn IdGenerator, payload: FilterPayload) -> IndexResult<Self> {
        let range_index = match (payload.value_type, payload.range) {
            (ValueType::Range, Some(range)) => Some(RangeIndex::from_payload(ids, range)),
            (ValueType::Range, None) => {
                return Err(IndexError::invalid_usage("range filter payload lacks its range index"))
            }
            (_, _) => None,
        };
        Ok(Self {
            id: ids.next_id(),
            value_type: payload.value_type,
            histogram: TransactionalMap::from_map(
                payload
                    .histogram
                    .into_iter()
                    .map(|(value, records)| (value, Arc::new(records)))
                    .collect(),
            ),
            range_index,
            all_records: OnceLock::new(),
            dirty: false,
        })
    }
}

impl TransactionalLayerProducer for FilterIndex {
    type Layer = FilterIndexLayer;
    type Committed = FilterIndex;

    fn structure_id(&self) -> StructureId {
        self.id
    }

    fn create_layer(&self) -> FilterIndexLayer {
        FilterIndexLayer::default()
    }

    fn create_copy_with_merged_layer(
        &self,
        layer: Option<FilterIndexLayer>,
        _tx: &mut Transaction,
    ) -> IndexResult<FilterIndex> {
        let Some(layer) = layer else {
            return Ok(self.clone());
        };
        let range_dirty = layer.range.as_ref().is_some_and(RangeIndexLayer::is_dirty);
        Ok(FilterIndex {
            id: self.id,
            value_type: self.value_type,
            histogram: self.histogram.merged(Some(layer.histogram)),
            range_index: self.range_index.as_ref().map(|range| range.merged(layer.range)),
            all_records: OnceLock::new(),
            dirty: self.dirty || layer.dirty || range_dirty,
        })
    }
}

pub struct FilterIndexView<'a> {
    value_type: ValueType,
    histogram: MapView<'a, Value, Arc<RecordBitmap>>,
    range: Option<RangeIndexView<'a>>,
    memo: Option<&'a OnceLock<Arc<RecordBitmap>>>,
}

impl FilterIndexView<'_> {
    /// Number of distinct values
    pub fn size(&self) -> usize {
        self.histogram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    pub fn values(&self) -> Vec<Value> {
        self.histogram.keys().cloned().collect()
    }

    /// Buckets in value order
    pub fn histogram(&self) -> Vec<(Value, RecordBitmap)> {
        self.histogram
            .iter()
            .map(|(value, records)| (value.clone(), (**records).clone()))
            .collect()
    }

    pub fn all_records(&self) -> Arc<RecordBitmap> {
        match self.memo {
            Some(memo) => Arc::clone(memo.get_or_init(|| Arc::new(self.compute_all_records()))),
            None => Arc::new(self.compute_all_records()),
        }
    }

    fn compute_all_records(&self) -> RecordBitmap {
        let mut result = RecordBitmap::new();
        for records in self.histogram.values() {
            result.union_with(records);
        }
        result
    }

    fn key(&self, value: &Value) -> IndexResult<Value> {
        value.expect_type(self.value_type)?;
        Ok(value.normalize())
    }

    fn union(&self, from: Bound<&Value>, to: Bound<&Value>) -> RecordSet {
        RecordSet::or(
            self.histogram
                .range(from, to)
                .map(|(_, records)| RecordSet::shared(Arc::clone(records)))
                .collect(),
        )
    }

    pub fn records_equal_to(&self, value: &Value) -> IndexResult<RecordSet> {
        let key = self.key(value)?;
        Ok(self
            .histogram
            .get(&key)
            .map(|records| RecordSet::shared(Arc::clone(records)))
            .unwrap_or(RecordSet::Empty))
    }

    pub fn records_lesser_than(&self, value: &Value) -> IndexResult<RecordSet> {
        let key = self.key(value)?;
        Ok(self.union(Bound::Unbounded, Bound::Excluded(&key)))
    }

    pub fn records_lesser_than_eq(&self, value: &Value) -> IndexResult<RecordSet> {
        let key = self.key(value)?;
        Ok(self.union(Bound::Unbounded, Bound::Included(&key)))
    }

    pub fn records_greater_than(&self, value: &Value) -> IndexResult<RecordSet> {
        let key = self.key(value)?;
        Ok(self.union(Bound::Excluded(&key), Bound::Unbounded))
    }

    pub fn records_greater_than_eq(&self, value: &Value) -> IndexResult<RecordSet> {
        let key = self.key(value)?;
        Ok(self.union(Bound::Included(&key), Bound::Unbounded))
    }

    /// Inclusive on both ends
    pub fn records_between(&self, from: &Value, to: &Value) -> IndexResult<RecordSet> {
        let from = self.key(from)?;
        let to = self.key(to)?;
        Ok(self.union(Bound::Included(&from), Bound::Included(&to)))
    }

    fn text_scan(&self, needle: &str, matches: impl Fn(&str, &str) -> bool) -> IndexResult<RecordSet> {
        ensure(self.value_type.is_textual(), || {
            format!("text search is not supported for {} values", self.value_type)
        })?;
        let needle = match self.value_type {
            ValueType::Currency => Value::Currency(needle.to_string()),
            ValueType::Locale => Value::Locale(needle.to_string()),
            _ => Value::String(needle.to_string()),
        }
        .normalize();
        let needle = needle.as_text().unwrap_or_default();
        Ok(RecordSet::or(
            self.histogram
                .iter()
                .filter(|(value, _)| value.as_text().is_some_and(|text| matches(text, needle)))
                .map(|(_, records)| RecordSet::shared(Arc::clone(records)))
                .collect(),
        ))
    }

    pub fn records_starting_with(&self, prefix: &str) -> IndexResult<RecordSet> {
        self.text_scan(prefix, |text, needle| text.starts_with(needle))
    }

    pub fn records_ending_with(&self, suffix: &str) -> IndexResult<RecordSet> {
        self.text_scan(suffix, |text, needle| text.ends_with(needle))
    }

    pub fn records_containing(&self, infix: &str) -> IndexResult<RecordSet> {
        self.text_scan(infix, |text, needle| text.contains(needle))
    }

    fn range_view(&self) -> IndexResult<RangeIndexView<'_>> {
        self.range
            .ok_or_else(|| IndexError::invalid_usage(ERROR_RANGE_TYPE_NOT_SUPPORTED))
    }

    pub fn records_valid_in(&self, point: i64) -> IndexResult<RecordSet> {
        Ok(self.range_view()?.valid_at(point))
    }

    pub fn records_overlapping(&self, from: i64, to: i64) -> IndexResult<RecordSet> {
        self.range_view()?.overlapping(from, to)
    }
}

pub struct FilterIndexWriter<'a> {
    value_type: ValueType,
    histogram: MapAccess<'a, Value, Arc<RecordBitmap>>,
    range: Option<RangeIndexWriter<'a>>,
    memo: Option<&'a mut OnceLock<Arc<RecordBitmap>>>,
    dirty: &'a mut bool,
}

impl FilterIndexWriter<'_> {
    pub fn view(&self) -> FilterIndexView<'_> {
        FilterIndexView {
            value_type: self.value_type,
            histogram: self.histogram.view(),
            range: self.range.as_ref().map(RangeIndexWriter::view),
            memo: None,
        }
    }

    fn validated(&self, value: &AttributeValue) -> IndexResult<Vec<Value>> {
        for element in value.elements() {
            element.expect_type(self.value_type)?;
        }
        Ok(value.normalized_elements())
    }

    fn touched(&mut self) {
        if let Some(memo) = self.memo.as_mut() {
            memo.take();
        }
        *self.dirty = true;
    }

    /// Register `record` under every element of `value`
    pub fn add_record(&mut self, record: RecordId, value: &AttributeValue) -> IndexResult<()> {
        let keys = self.validated(value)?;
        if let Some(range) = self.range.as_mut() {
            for consolidated in consolidate(&ranges(&keys)) {
                range.add_record(consolidated, record);
            }
        }
        for key in keys {
            add_to_bucket(&mut self.histogram, key, record);
        }
        self.touched();
        Ok(())
    }

    /// Unregister `record` from every element of `value`
    pub fn remove_record(&mut self, record: RecordId, value: &AttributeValue) -> IndexResult<()> {
        let keys = self.validated(value)?;
        self.verify_registered(record, &keys)?;
        if let Some(range) = self.range.as_mut() {
            for consolidated in consolidate(&ranges(&keys)) {
                range.remove_record(consolidated, record)?;
            }
        }
        for key in &keys {
            remove_from_bucket(&mut self.histogram, key, record);
        }
        self.touched();
        Ok(())
    }

    /// Register additional array elements of a record already in the index
    pub fn add_record_delta(&mut self, record: RecordId, delta: &[Value]) -> IndexResult<()> {
        let keys = self.validated(&AttributeValue::Array(delta.to_vec()))?;
        let before = self.record_ranges(record);
        for key in keys {
            add_to_bucket(&mut self.histogram, key, record);
        }
        self.reindex_ranges(record, before)?;
        self.touched();
        Ok(())
    }

    /// Unregister some array elements of a record
    pub fn remove_record_delta(&mut self, record: RecordId, delta: &[Value]) -> IndexResult<()> {
        let keys = self.validated(&AttributeValue::Array(delta.to_vec()))?;
        self.verify_registered(record, &keys)?;
        let before = self.record_ranges(record);
        for key in &keys {
            remove_from_bucket(&mut self.histogram, key, record);
        }
        self.reindex_ranges(record, before)?;
        self.touched();
        Ok(())
    }

    fn verify_registered(&self, record: RecordId, keys: &[Value]) -> IndexResult<()> {
        for key in keys {
            let registered = self
                .histogram
                .get(key)
                .is_some_and(|records| records.contains(record));
            ensure(registered, || {
                format!("record {} is not registered under value `{}`", record, key)
            })?;
        }
        Ok(())
    }

    /// Consolidated ranges of `record` as recorded in the histogram
    fn record_ranges(&self, record: RecordId) -> Vec<Range> {
        if self.range.is_none() {
            return Vec::new();
        }
        let keys: Vec<Value> = self
            .histogram
            .view()
            .iter()
            .filter(|(_, records)| records.contains(record))
            .map(|(value, _)| value.clone())
            .collect();
        consolidate(&ranges(&keys))
    }

    fn reindex_ranges(&mut self, record: RecordId, before: Vec<Range>) -> IndexResult<()> {
        if self.range.is_none() {
            return Ok(());
        }
        let after = self.record_ranges(record);
        if let Some(range) = self.range.as_mut() {
            for old in before {
                range.remove_record(old, record)?;
            }
            for new in after {
                range.add_record(new, record);
            }
        }
        Ok(())
    }
}

fn ranges(values: &[Value]) -> Vec<Range> {
    values.iter().filter_map(Value::as_range).copied().collect()
}

fn add_to_bucket(histogram: &mut MapAccess<'_, Value, Arc<RecordBitmap>>, key: Value, record: RecordId) {
    let bucket = histogram.get_or_insert_with(key, Default::default);
    Arc::make_mut(bucket).add(record);
}

fn remove_from_bucket(histogram: &mut MapAccess<'_, Value, Arc<RecordBitmap>>, key: &Value, record: RecordId) {
    let now_empty = match histogram.get_mut(key) {
        Some(bucket) => {
            let bucket = Arc::make_mut(bucket);
            bucket.remove(record);
            bucket.is_empty()
        }
        None => false,
    };
    if now_empty {
        histogram.remove(key);
    }
}
