//! Catalog-wide unique index
//!
//! Values are unique across all entity types of a catalog. Owners are kept
//! as compact `(entity type id, record id, locale id)` tuples; the entity
//! type and locale dictionaries are transactional as well so a rolled back
//! registration leaves no trace.

use serde::{Deserialize, Serialize};

use super::errors::{IndexError, IndexResult};
use super::key::{AttributeKey, RecordId};
use super::storage::{GlobalUniquePayload, Payload, StoragePart};
use super::value::{canonical_locale, AttributeValue, Value, ValueType};
use crate::transaction::{
    IdGenerator, MapAccess, MapLayer, MapView, StructureId, Transaction, TransactionalLayerProducer,
    TransactionalMap,
};

/// Compact owner of a catalog-wide unique value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlobalOwner {
    pub entity_type: u32,
    pub record: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<u32>,
}

/// Owner resolved back to names
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityReference {
    pub entity_type: String,
    pub record: RecordId,
    pub locale: Option<String>,
}

impl std::fmt::Display for EntityReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.locale {
            Some(locale) => write!(f, "{} {} ({})", self.entity_type, self.record, locale),
            None => write!(f, "{} {}", self.entity_type, self.record),
        }
    }
}

/// Bidirectional name dictionary
#[derive(Debug, Clone, Default)]
struct Dictionary {
    by_name: TransactionalMap<String, u32>,
    by_id: TransactionalMap<u32, String>,
}

#[derive(Debug, Default)]
struct DictionaryLayer {
    by_name: MapLayer<String, u32>,
    by_id: MapLayer<u32, String>,
}

struct DictionaryView<'a> {
    by_name: MapView<'a, String, u32>,
    by_id: MapView<'a, u32, String>,
}

struct DictionaryAccess<'a> {
    by_name: MapAccess<'a, String, u32>,
    by_id: MapAccess<'a, u32, String>,
}

impl Dictionary {
    fn from_names(names: Vec<String>) -> Self {
        let mut dictionary = Dictionary::default();
        {
            let mut access = dictionary.access();
            for name in names {
                access.id_of(&name);
            }
        }
        dictionary
    }

    fn view<'a>(&'a self, layer: Option<&'a DictionaryLayer>) -> DictionaryView<'a> {
        DictionaryView {
            by_name: self.by_name.view(layer.map(|l| &l.by_name)),
            by_id: self.by_id.view(layer.map(|l| &l.by_id)),
        }
    }

    fn access(&mut self) -> DictionaryAccess<'_> {
        DictionaryAccess {
            by_name: self.by_name.access(),
            by_id: self.by_id.access(),
        }
    }

    fn access_layered<'a>(&'a self, layer: &'a mut DictionaryLayer) -> DictionaryAccess<'a> {
        DictionaryAccess {
            by_name: self.by_name.access_layered(&mut layer.by_name),
            by_id: self.by_id.access_layered(&mut layer.by_id),
        }
    }

    fn merged(&self, layer: DictionaryLayer) -> Self {
        Dictionary {
            by_name: self.by_name.merged(Some(layer.by_name)),
            by_id: self.by_id.merged(Some(layer.by_id)),
        }
    }

    /// Names ordered by id
    fn names(&self) -> Vec<String> {
        self.by_id.base().values().cloned().collect()
    }
}

impl DictionaryView<'_> {
    fn name_of(&self, id: u32) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    fn id_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(&name.to_string()).copied()
    }
}

impl DictionaryAccess<'_> {
    /// Id of `name`, assigning the next free id on first use
    fn id_of(&mut self, name: &str) -> u32 {
        if let Some(id) = self.by_name.get(&name.to_string()) {
            return *id;
        }
        let id = self.by_id.view().len() as u32 + 1;
        self.by_name.insert(name.to_string(), id);
        self.by_id.insert(id, name.to_string());
        id
    }

    fn view(&self) -> DictionaryView<'_> {
        DictionaryView {
            by_name: self.by_name.view(),
            by_id: self.by_id.view(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GlobalUniqueIndex {
    id: StructureId,
    attribute: AttributeKey,
    value_type: ValueType,
    owners: TransactionalMap<Value, GlobalOwner>,
    entity_types: Dictionary,
    locales: Dictionary,
    dirty: bool,
}

#[derive(Debug, Default)]
pub struct GlobalUniqueIndexLayer {
    owners: MapLayer<Value, GlobalOwner>,
    entity_types: DictionaryLayer,
    locales: DictionaryLayer,
    dirty: bool,
}

impl GlobalUniqueIndex {
    pub fn new(ids: &dyn IdGenerator, attribute: AttributeKey, value_type: ValueType) -> Self {
        Self {
            id: ids.next_id(),
            attribute,
            value_type,
            owners: TransactionalMap::new(),
            entity_types: Dictionary::default(),
            locales: Dictionary::default(),
            dirty: false,
        }
    }

    pub fn attribute(&self) -> &AttributeKey {
        &self.attribute
    }

    pub fn read<'a>(&'a self, tx: Option<&'a Transaction>) -> GlobalUniqueIndexView<'a> {
        let layer = tx.and_then(|tx| tx.layer::<GlobalUniqueIndexLayer>(self.id));
        GlobalUniqueIndexView {
            value_type: self.value_type,
            owners: self.owners.view(layer.map(|l| &l.owners)),
            entity_types: self.entity_types.view(layer.map(|l| &l.entity_types)),
            locales: self.locales.view(layer.map(|l| &l.locales)),
        }
    }

    pub fn write(&mut self) -> GlobalUniqueIndexWriter<'_> {
        GlobalUniqueIndexWriter {
            attribute: &self.attribute,
            value_type: self.value_type,
            owners: self.owners.access(),
            entity_types: self.entity_types.access(),
            locales: self.locales.access(),
            dirty: &mut self.dirty,
        }
    }

    pub fn write_in<'a>(&'a self, tx: &'a mut Transaction) -> IndexResult<GlobalUniqueIndexWriter<'a>> {
        let GlobalUniqueIndexLayer {
            owners,
            entity_types,
            locales,
            dirty,
        } = self.begin_layer(tx)?;
        Ok(GlobalUniqueIndexWriter {
            attribute: &self.attribute,
            value_type: self.value_type,
            owners: self.owners.access_layered(owners),
            entity_types: self.entity_types.access_layered(entity_types),
            locales: self.locales.access_layered(locales),
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
            Payload::GlobalUnique(GlobalUniquePayload {
                value_type: self.value_type,
                owners: self
                    .owners
                    .base()
                    .iter()
                    .map(|(value, owner)| (value.clone(), *owner))
                    .collect(),
                entity_types: self.entity_types.names(),
                locales: self.locales.names(),
            }),
        ))
    }

    pub fn from_payload(
        ids: &dyn IdGenerator,
        attribute: AttributeKey,
        payload: GlobalUniquePayload,
    ) -> Self {
        Self {
            id: ids.next_id(),
            attribute,
            value_type: payload.value_type,
            owners: TransactionalMap::from_map(payload.owners.into_iter().collect()),
            entity_types: Dictionary::from_names(payload.entity_types),
            locales: Dictionary::from_names(payload.locales),
            dirty: false,
        }
    }
}

impl TransactionalLayerProducer for GlobalUniqueIndex {
    type Layer = GlobalUniqueIndexLayer;
    type Committed = GlobalUniqueIndex;

    fn structure_id(&self) -> StructureId {
        self.id
    }

    fn create_layer(&self) -> GlobalUniqueIndexLayer {
        GlobalUniqueIndexLayer::default()
    }

    fn create_copy_with_merged_layer(
        &self,
        layer: Option<GlobalUniqueIndexLayer>,
        _tx: &mut Transaction,
    ) -> IndexResult<GlobalUniqueIndex> {
        let Some(layer) = layer else {
            return Ok(self.clone());
        };
        Ok(GlobalUniqueIndex {
            id: self.id,
            attribute: self.attribute.clone(),
            value_type: self.value_type,
            owners: self.owners.merged(Some(layer.owners)),
            entity_types: self.entity_types.merged(layer.entity_types),
            locales: self.locales.merged(layer.locales),
            dirty: self.dirty || layer.dirty,
        })
    }
}

pub struct GlobalUniqueIndexView<'a> {
    value_type: ValueType,
    owners: MapView<'a, Value, GlobalOwner>,
    entity_types: DictionaryView<'a>,
    locales: DictionaryView<'a>,
}

impl GlobalUniqueIndexView<'_> {
    /// Entity owning `value`
    pub fn entity_reference_by_value(&self, value: &Value) -> IndexResult<Option<EntityReference>> {
        value.expect_type(self.value_type)?;
        match self.owners.get(&value.normalize()) {
            None => Ok(None),
            Some(owner) => resolve(owner, &self.entity_types, &self.locales).map(Some),
        }
    }

    pub fn size(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

fn resolve(
    owner: &GlobalOwner,
    entity_types: &DictionaryView<'_>,
    locales: &DictionaryView<'_>,
) -> IndexResult<EntityReference> {
    let entity_type = entity_types.name_of(owner.entity_type).ok_or_else(|| {
        IndexError::internal(format!("entity type id {} is not registered", owner.entity_type))
    })?;
    let locale = match owner.locale {
        None => None,
        Some(id) => Some(
            locales
                .name_of(id)
                .ok_or_else(|| IndexError::internal(format!("locale id {} is not registered", id)))?
                .to_string(),
        ),
    };
    Ok(EntityReference {
        entity_type: entity_type.to_string(),
        record: owner.record,
        locale,
    })
}

pub struct GlobalUniqueIndexWriter<'a> {
    attribute: &'a AttributeKey,
    value_type: ValueType,
    owners: MapAccess<'a, Value, GlobalOwner>,
    entity_types: DictionaryAccess<'a>,
    locales: DictionaryAccess<'a>,
    dirty: &'a mut bool,
}

impl GlobalUniqueIndexWriter<'_> {
    fn keys(&self, value: &AttributeValue) -> IndexResult<Vec<Value>> {
        for element in value.elements() {
            element.expect_type(self.value_type)?;
        }
        Ok(value.normalized_elements())
    }

    fn describe(&self, owner: &GlobalOwner) -> IndexResult<String> {
        resolve(owner, &self.entity_types.view(), &self.locales.view()).map(|r| r.to_string())
    }

    /// Claim every element of `value` for the entity
    pub fn register(
        &mut self,
        value: &AttributeValue,
        entity_type: &str,
        locale: Option<&str>,
        record: RecordId,
    ) -> IndexResult<()> {
        let keys = self.keys(value)?;
        let requested = EntityReference {
            entity_type: entity_type.to_string(),
            record,
            locale: locale.map(canonical_locale),
        };
        let known = GlobalOwner {
            entity_type: self.entity_types.view().id_of(entity_type).unwrap_or(0),
            record,
            locale: requested
                .locale
                .as_deref()
                .map(|l| self.locales.view().id_of(l).unwrap_or(0)),
        };
        for key in &keys {
            if let Some(existing) = self.owners.get(key) {
                if *existing != known {
                    return Err(IndexError::UniqueValueViolation {
                        attribute: self.attribute.name().to_string(),
                        locale: requested.locale.clone(),
                        value: key.to_string(),
                        existing_owner: self.describe(existing)?,
                        requested_owner: requested.to_string(),
                    });
                }
            }
        }

        let owner = GlobalOwner {
            entity_type: self.entity_types.id_of(entity_type),
            record,
            locale: requested.locale.as_deref().map(|l| self.locales.id_of(l)),
        };
        for key in keys {
            self.owners.insert(key, owner);
        }
        *self.dirty = true;
        Ok(())
    }

    /// Release every element of `value` owned by the entity
    pub fn unregister(
        &mut self,
        value: &AttributeValue,
        entity_type: &str,
        locale: Option<&str>,
        record: RecordId,
    ) -> IndexResult<EntityReference> {
        let keys = self.keys(value)?;
        let expected = EntityReference {
            entity_type: entity_type.to_string(),
            record,
            locale: locale.map(canonical_locale),
        };
        for key in &keys {
            let actual = match self.owners.get(key) {
                Some(owner) => Some(resolve(owner, &self.entity_types.view(), &self.locales.view())?),
                None => None,
            };
            if actual.as_ref() != Some(&expected) {
                return Err(IndexError::OwnershipMismatch {
                    attribute: self.attribute.name().to_string(),
                    locale: expected.locale.clone(),
                    value: key.to_string(),
                    expected_owner: expected.to_string(),
                    actual_owner: actual.map(|owner| owner.to_string()),
                });
            }
        }
        for key in &keys {
            self.owners.remove(key);
        }
        *self.dirty = true;
        Ok(expected)
    }
}
