//! Unique index: one-to-one mapping from normalized value to record
//!
//! Array values claim every element. All elements are validated before
//! any of them is written, so a failed call leaves the index untouched.

use super::bitmap::RecordBitmap;
use super::errors::{IndexError, IndexResult};
use super::key::{AttributeKey, RecordId};
use super::storage::{Payload, StoragePart, UniquePayload};
use super::value::{AttributeValue, Value, ValueType};
use crate::transaction::{
    BitmapAccess, BitmapLayer, BitmapView, IdGenerator, MapAccess, MapLayer, MapView, StructureId,
    Transaction, TransactionalBitmap, TransactionalLayerProducer, TransactionalMap,
};

#[derive(Debug, Clone)]
pub struct UniqueIndex {
    id: StructureId,
    attribute: AttributeKey,
    value_type: ValueType,
    owners: TransactionalMap<Value, RecordId>,
    records: TransactionalBitmap,
    dirty: bool,
}

#[derive(Debug, Default)]
pub struct UniqueIndexLayer {
    owners: MapLayer<Value, RecordId>,
    records: BitmapLayer,
    dirty: bool,
}

impl UniqueIndex {
    pub fn new(ids: &dyn IdGenerator, attribute: AttributeKey, value_type: ValueType) -> Self {
        Self {
            id: ids.next_id(),
            attribute,
            value_type,
            owners: TransactionalMap::new(),
            records: TransactionalBitmap::new(),
            dirty: false,
        }
    }

    pub fn attribute(&self) -> &AttributeKey {
        &self.attribute
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn read<'a>(&'a self, tx: Option<&'a Transaction>) -> UniqueIndexView<'a> {
        let layer = tx.and_then(|tx| tx.layer::<UniqueIndexLayer>(self.id));
        UniqueIndexView {
            value_type: self.value_type,
            owners: self.owners.view(layer.map(|l| &l.owners)),
            records: self.records.view(layer.map(|l| &l.records)),
        }
    }

    pub fn write(&mut self) -> UniqueIndexWriter<'_> {
        UniqueIndexWriter {
            attribute: &self.attribute,
            value_type: self.value_type,
            owners: self.owners.access(),
            records: self.records.access(),
            dirty: &mut self.dirty,
        }
    }

    pub fn write_in<'a>(&'a self, tx: &'a mut Transaction) -> IndexResult<UniqueIndexWriter<'a>> {
        let UniqueIndexLayer {
            owners,
            records,
            dirty,
        } = self.begin_layer(tx)?;
        Ok(UniqueIndexWriter {
            attribute: &self.attribute,
            value_type: self.value_type,
            owners: self.owners.access_layered(owners),
            records: self.records.access_layered(records),
            dirty,
        })
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn reset_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn create_storage_part(&self, container: u32) -> Option<StoragePart> {
        if !self.dirty {
            return None;
        }
        Some(StoragePart::new(
            container,
            self.attribute.clone(),
            Payload::Unique(UniquePayload {
                value_type: self.value_type,
                owners: self
                    .owners
                    .base()
                    .iter()
                    .map(|(value, record)| (value.clone(), *record))
                    .collect(),
                records: self.records.base().clone(),
            }),
        ))
    }

    pub fn from_payload(ids: &dyn IdGenerator, attribute: AttributeKey, payload: UniquePayload) -> Self {
        Self {
            id: ids.next_id(),
            attribute,
            value_type: payload.value_type,
            owners: TransactionalMap::from_map(payload.owners.into_iter().collect()),
            records: TransactionalBitmap::from_bitmap(payload.records),
            dirty: false,
        }
    }
}

impl TransactionalLayerProducer for UniqueIndex {
    type Layer = UniqueIndexLayer;
    type Committed = UniqueIndex;

    fn structure_id(&self) -> StructureId {
        self.id
    }

    fn create_layer(&self) -> UniqueIndexLayer {
        UniqueIndexLayer::default()
    }

    fn create_copy_with_merged_layer(
        &self,
        layer: Option<UniqueIndexLayer>,
        _tx: &mut Transaction,
    ) -> IndexResult<UniqueIndex> {
        let Some(layer) = layer else {
            return Ok(self.clone());
        };
        Ok(UniqueIndex {
            id: self.id,
            attribute: self.attribute.clone(),
            value_type: self.value_type,
            owners: self.owners.merged(Some(layer.owners)),
            records: self.records.merged(Some(layer.records)),
            dirty: self.dirty || layer.dirty,
        })
    }
}

pub struct UniqueIndexView<'a> {
    value_type: ValueType,
    owners: MapView<'a, Value, RecordId>,
    records: BitmapView<'a>,
}

impl UniqueIndexView<'_> {
    /// Owner of `value`, if any
    pub fn record_by_value(&self, value: &Value) -> IndexResult<Option<RecordId>> {
        value.expect_type(self.value_type)?;
        Ok(self.owners.get(&value.normalize()).copied())
    }

    /// Owners of the elements of `value`, in element order
    pub fn records_by_values(&self, values: &[Value]) -> IndexResult<Vec<Option<RecordId>>> {
        values.iter().map(|value| self.record_by_value(value)).collect()
    }

    pub fn records(&self) -> RecordBitmap {
        self.records.to_bitmap()
    }

    /// Number of owned values
    pub fn size(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn values(&self) -> Vec<Value> {
        self.owners.keys().cloned().collect()
    }
}

pub struct UniqueIndexWriter<'a> {
    attribute: &'a AttributeKey,
    value_type: ValueType,
    owners: MapAccess<'a, Value, RecordId>,
    records: BitmapAccess<'a>,
    dirty: &'a mut bool,
}

impl UniqueIndexWriter<'_> {
    fn keys(&self, value: &AttributeValue) -> IndexResult<Vec<Value>> {
        for element in value.elements() {
            element.expect_type(self.value_type)?;
        }
        Ok(value.normalized_elements())
    }

    /// Claim every element of `value` for `record`
    pub fn register(&mut self, value: &AttributeValue, record: RecordId) -> IndexResult<()> {
        let keys = self.keys(value)?;
        for key in &keys {
            if let Some(existing) = self.owners.get(key) {
                if *existing != record {
                    return Err(IndexError::UniqueValueViolation {
                        attribute: self.attribute.name().to_string(),
                        locale: self.attribute.locale().map(str::to_string),
                        value: key.to_string(),
                        existing_owner: existing.to_string(),
                        requested_owner: record.to_string(),
                    });
                }
            }
        }
        for key in keys {
            self.owners.insert(key, record);
        }
        self.records.add(record);
        *self.dirty = true;
        Ok(())
    }

    /// Release every element of `value` owned by `record`
    pub fn unregister(&mut self, value: &AttributeValue, record: RecordId) -> IndexResult<()> {
        let keys = self.keys(value)?;
        for key in &keys {
            let actual = self.owners.get(key).copied();
            if actual != Some(record) {
                return Err(IndexError::OwnershipMismatch {
                    attribute: self.attribute.name().to_string(),
                    locale: self.attribute.locale().map(str::to_string),
                    value: key.to_string(),
                    expected_owner: record.to_string(),
                    actual_owner: actual.map(|owner| owner.to_string()),
                });
            }
        }
        for key in &keys {
            self.owners.remove(key);
        }
        self.records.remove(record);
        *self.dirty = true;
        Ok(())
    }

    pub fn view(&self) -> UniqueIndexView<'_> {
        UniqueIndexView {
            value_type: self.value_type,
            owners: self.owners.view(),
            records: self.records.view(),
        }
    }
}
