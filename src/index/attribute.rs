//! Attribute index: every secondary index of one entity collection
//!
//! Holds one child index per attribute key and index kind. Children are
//! created on the first value written for their key and dropped when their
//! last value is removed. Children are shared through `Arc`, so a committed
//! copy reuses every child its transaction did not touch.
//!
//! # Invariants
//!
//! - Localized attributes are keyed by `(name, locale)`; the locale must be
//!   among the configured allowed locales
//! - A child never stays registered while empty
//! - Commit merges the child layers of the transaction recursively

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::chain::{ChainIndex, ChainIndexView, ChainIndexWriter, ConsistencyState};
use super::comparator::{ComparatorSource, SortComparator};
use super::config::IndexConfig;
use super::errors::{IndexError, IndexResult};
use super::filter::{FilterIndex, FilterIndexView, FilterIndexWriter};
use super::key::{AttributeKey, Predecessor, RecordId};
use super::sort::{SortIndex, SortIndexView, SortIndexWriter};
use super::storage::{Payload, StoragePart};
use super::unique::{UniqueIndex, UniqueIndexView, UniqueIndexWriter};
use super::value::{canonical_locale, AttributeValue, Value, ValueType};
use crate::observability::{log_event_with_fields, Event, MetricsRegistry};
use crate::transaction::{
    IdGenerator, MapLayer, MapView, StructureId, Transaction, TransactionalLayerProducer, TransactionalMap,
};

/// Schema facts of one indexed attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeSchema {
    pub name: String,
    pub value_type: ValueType,
    pub localized: bool,
}

impl AttributeSchema {
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            localized: false,
        }
    }

    pub fn localized(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            localized: true,
            ..Self::new(name, value_type)
        }
    }
}

/// Schema of a sort over several attributes combined into one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompoundSchema {
    pub name: String,
    pub sources: Vec<ComparatorSource>,
    pub localized: bool,
}

impl CompoundSchema {
    pub fn new(name: impl Into<String>, sources: Vec<ComparatorSource>) -> Self {
        Self {
            name: name.into(),
            sources,
            localized: false,
        }
    }

    pub fn localized(name: impl Into<String>, sources: Vec<ComparatorSource>) -> Self {
        Self {
            localized: true,
            ..Self::new(name, sources)
        }
    }
}

type Children<C> = TransactionalMap<AttributeKey, Arc<C>>;

#[derive(Clone)]
pub struct AttributeIndex {
    id: StructureId,
    ids: Arc<dyn IdGenerator>,
    config: Arc<IndexConfig>,
    metrics: Arc<MetricsRegistry>,
    unique: Children<UniqueIndex>,
    filter: Children<FilterIndex>,
    sort: Children<SortIndex>,
    chain: Children<ChainIndex>,
}

#[derive(Debug, Default)]
pub struct AttributeIndexLayer {
    unique: MapLayer<AttributeKey, Arc<UniqueIndex>>,
    filter: MapLayer<AttributeKey, Arc<FilterIndex>>,
    sort: MapLayer<AttributeKey, Arc<SortIndex>>,
    chain: MapLayer<AttributeKey, Arc<ChainIndex>>,
}

impl AttributeIndex {
    pub fn new(ids: Arc<dyn IdGenerator>, config: IndexConfig) -> Self {
        Self {
            id: ids.next_id(),
            ids,
            config: Arc::new(config),
            metrics: Arc::new(MetricsRegistry::new()),
            unique: Children::new(),
            filter: Children::new(),
            sort: Children::new(),
            chain: Children::new(),
        }
    }

    /// Rebuild an attribute index from previously exported storage parts
    pub fn from_storage_parts(
        ids: Arc<dyn IdGenerator>,
        config: IndexConfig,
        parts: Vec<StoragePart>,
    ) -> IndexResult<Self> {
        let mut index = Self::new(ids, config);
        let memoize = index.config.memoize_resolved_order;
        for part in parts {
            let StoragePart {
                container,
                attribute,
                payload,
            } = part;
            let kind = payload.kind();
            let ids = index.ids.as_ref();
            match payload {
                Payload::Unique(payload) => {
                    let child = UniqueIndex::from_payload(ids, attribute.clone(), payload);
                    index.unique.access().insert(attribute.clone(), Arc::new(child));
                }
                Payload::Filter(payload) => {
                    let child = FilterIndex::from_payload(ids, payload)?;
                    index.filter.access().insert(attribute.clone(), Arc::new(child));
                }
                Payload::Sort(payload) => {
                    let child = SortIndex::from_payload(ids, payload)?;
                    index.sort.access().insert(attribute.clone(), Arc::new(child));
                }
                Payload::Chain(payload) => {
                    let child = ChainIndex::from_payload(ids, payload)?.memoizing(memoize);
                    index.chain.access().insert(attribute.clone(), Arc::new(child));
                }
                Payload::GlobalUnique(_) => {
                    return Err(IndexError::invalid_usage(format!(
                        "Catalog-wide unique index `{}` cannot be restored into an attribute index!",
                        attribute
                    )));
                }
            }
            log_event_with_fields(
                Event::StoragePartRestored,
                &[
                    ("container", &container.to_string()),
                    ("attribute", &attribute.to_string()),
                    ("kind", kind),
                ],
            );
        }
        Ok(index)
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Counters shared with every committed copy of this index
    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn read<'a>(&'a self, tx: Option<&'a Transaction>) -> AttributeIndexView<'a> {
        let layer = tx.and_then(|tx| tx.layer::<AttributeIndexLayer>(self.id));
        AttributeIndexView {
            tx,
            unique: self.unique.view(layer.map(|l| &l.unique)),
            filter: self.filter.view(layer.map(|l| &l.filter)),
            sort: self.sort.view(layer.map(|l| &l.sort)),
            chain: self.chain.view(layer.map(|l| &l.chain)),
        }
    }

    pub fn write(&mut self) -> AttributeIndexWriter<'_> {
        AttributeIndexWriter {
            target: Target::Direct(self),
        }
    }

    pub fn write_in<'a>(&'a self, tx: &'a mut Transaction) -> AttributeIndexWriter<'a> {
        AttributeIndexWriter {
            target: Target::Layered { index: self, tx },
        }
    }

    /// Layer of this index in `tx`, counted when allocated
    fn own_layer<'t>(&self, tx: &'t mut Transaction) -> IndexResult<&'t mut AttributeIndexLayer> {
        if !tx.has_layer(self.id) {
            self.metrics.increment_layers_created();
        }
        self.begin_layer(tx)
    }

    /// Key of `name` in `locale`, validated against the allowed locales
    fn attribute_key(&self, name: &str, localized: bool, locale: Option<&str>) -> IndexResult<AttributeKey> {
        if !localized {
            return Ok(AttributeKey::new(name));
        }
        let locale = locale.map(canonical_locale).ok_or_else(|| {
            IndexError::invalid_usage(format!(
                "Attribute `{}` is marked as localized, but no locale was given!",
                name
            ))
        })?;
        let allowed = self.config.canonical_locales();
        if !allowed.is_empty() && !allowed.contains(&locale) {
            let listed: Vec<String> = allowed.iter().map(|l| format!("`{}`", l)).collect();
            return Err(IndexError::invalid_usage(format!(
                "Attribute `{}` is in locale `{}` that is not among allowed locales for this entity: {}!",
                name,
                locale,
                listed.join(", ")
            )));
        }
        Ok(AttributeKey::localized(name, &locale))
    }

    /// Dirty children of the committed state as storage parts, counted and
    /// logged as exported
    pub fn modified_storage_parts(&self, container: u32) -> Vec<StoragePart> {
        let parts = self.dirty_storage_parts(container);
        if !parts.is_empty() {
            self.metrics.add_storage_parts_exported(parts.len() as u64);
            log_event_with_fields(
                Event::StoragePartsExported,
                &[
                    ("container", &container.to_string()),
                    ("count", &parts.len().to_string()),
                ],
            );
        }
        parts
    }

    /// Dirty children of the committed state as storage parts
    pub fn dirty_storage_parts(&self, container: u32) -> Vec<StoragePart> {
        let mut parts = Vec::new();
        parts.extend(
            self.unique
                .base()
                .values()
                .filter_map(|child| child.create_storage_part(container)),
        );
        parts.extend(
            self.filter
                .base()
                .iter()
                .filter_map(|(key, child)| child.create_storage_part(container, key)),
        );
        parts.extend(
            self.sort
                .base()
                .iter()
                .filter_map(|(key, child)| child.create_storage_part(container, key)),
        );
        parts.extend(
            self.chain
                .base()
                .iter()
                .filter_map(|(key, child)| child.create_storage_part(container, key)),
        );
        parts
    }

    /// Mark every child as flushed
    pub fn reset_dirty(&mut self) {
        reset_children(&mut self.unique, UniqueIndex::reset_dirty);
        reset_children(&mut self.filter, FilterIndex::reset_dirty);
        reset_children(&mut self.sort, SortIndex::reset_dirty);
        reset_children(&mut self.chain, ChainIndex::reset_dirty);
    }

    /// Check chain children touched by a commit
    fn verify_chains(&self, changed: &[AttributeKey], chains: &Children<ChainIndex>) -> IndexResult<()> {
        for key in changed {
            let Some(chain) = chains.base().get(key) else {
                continue;
            };
            let view = chain.read(None);
            if self.config.verify_chains_on_commit {
                let report = view.consistency_report();
                if report.state == ConsistencyState::Broken {
                    log_event_with_fields(Event::ChainBroken, &[("attribute", &key.to_string())]);
                    return Err(IndexError::internal(format!(
                        "Chain index of attribute `{}` is broken:\n{}",
                        key, report.report
                    )));
                }
            }
            if !view.is_consistent() {
                self.metrics.increment_inconsistent_chains();
                log_event_with_fields(
                    Event::ChainInconsistent,
                    &[
                        ("attribute", &key.to_string()),
                        ("fragments", &view.fragments().len().to_string()),
                    ],
                );
            }
        }
        Ok(())
    }
}

impl fmt::Debug for AttributeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeIndex")
            .field("id", &self.id)
            .field("unique", &self.unique.base().keys().collect::<Vec<_>>())
            .field("filter", &self.filter.base().keys().collect::<Vec<_>>())
            .field("sort", &self.sort.base().keys().collect::<Vec<_>>())
            .field("chain", &self.chain.base().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn reset_children<C: Clone>(children: &mut Children<C>, reset: fn(&mut C)) {
    let keys: Vec<AttributeKey> = children.base().keys().cloned().collect();
    let mut access = children.access();
    for key in keys {
        if let Some(child) = access.get_mut(&key) {
            reset(Arc::make_mut(child));
        }
    }
}

/// Children merged with `layer`, each touched child committed on its own.
///
/// Layers of children removed by the transaction are dropped from `tx`.
/// Returns the keys of the committed children as well.
fn commit_children<C>(
    children: &Children<C>,
    layer: Option<MapLayer<AttributeKey, Arc<C>>>,
    tx: &mut Transaction,
) -> IndexResult<(Children<C>, Vec<AttributeKey>)>
where
    C: TransactionalLayerProducer<Committed = C>,
{
    let merged = children.merged(layer);
    for (key, child) in children.base() {
        if !merged.base().contains_key(key) {
            child.discard(tx);
        }
    }
    let mut committed = BTreeMap::new();
    let mut changed = Vec::new();
    for (key, child) in merged.base() {
        if tx.has_layer(child.structure_id()) {
            committed.insert(key.clone(), Arc::new(child.commit(tx)?));
            changed.push(key.clone());
        } else {
            committed.insert(key.clone(), Arc::clone(child));
        }
    }
    Ok((TransactionalMap::from_map(committed), changed))
}

/// Discard the layers of every child visible through `view`
fn discard_children<C: TransactionalLayerProducer>(
    view: MapView<'_, AttributeKey, Arc<C>>,
    tx: &mut Transaction,
) {
    let children: Vec<Arc<C>> = view.values().cloned().collect();
    for child in children {
        child.discard(tx);
    }
}

impl TransactionalLayerProducer for AttributeIndex {
    type Layer = AttributeIndexLayer;
    type Committed = AttributeIndex;

    fn structure_id(&self) -> StructureId {
        self.id
    }

    fn create_layer(&self) -> AttributeIndexLayer {
        AttributeIndexLayer::default()
    }

    fn create_copy_with_merged_layer(
        &self,
        layer: Option<AttributeIndexLayer>,
        tx: &mut Transaction,
    ) -> IndexResult<AttributeIndex> {
        let (unique, filter, sort, chain) = match layer {
            Some(layer) => (Some(layer.unique), Some(layer.filter), Some(layer.sort), Some(layer.chain)),
            None => (None, None, None, None),
        };
        let (unique, _) = commit_children(&self.unique, unique, tx)?;
        let (filter, _) = commit_children(&self.filter, filter, tx)?;
        let (sort, _) = commit_children(&self.sort, sort, tx)?;
        let (chain, changed_chains) = commit_children(&self.chain, chain, tx)?;
        self.verify_chains(&changed_chains, &chain)?;
        self.metrics.increment_commits();

        Ok(AttributeIndex {
            id: self.id,
            ids: Arc::clone(&self.ids),
            config: Arc::clone(&self.config),
            metrics: Arc::clone(&self.metrics),
            unique,
            filter,
            sort,
            chain,
        })
    }

    /// Discard this layer together with the layers of all children
    fn discard(&self, tx: &mut Transaction) {
        let layer = match tx.take_layer::<AttributeIndexLayer>(self.id) {
            Ok(layer) => layer.unwrap_or_default(),
            Err(err) => {
                log_event_with_fields(
                    Event::LayerRejected,
                    &[
                        ("structure", &self.id.to_string()),
                        ("reason", &err.to_string()),
                    ],
                );
                AttributeIndexLayer::default()
            }
        };
        discard_children(self.unique.view(Some(&layer.unique)), tx);
        discard_children(self.filter.view(Some(&layer.filter)), tx);
        discard_children(self.sort.view(Some(&layer.sort)), tx);
        discard_children(self.chain.view(Some(&layer.chain)), tx);
        self.metrics.increment_rollbacks();
    }
}

/// Child with key `key`, falling back to the non-localized key
fn lookup<'a, C>(
    children: MapView<'a, AttributeKey, Arc<C>>,
    name: &str,
    locale: Option<&str>,
) -> Option<&'a Arc<C>> {
    locale
        .and_then(|locale| children.get(&AttributeKey::localized(name, &canonical_locale(locale))))
        .or_else(|| children.get(&AttributeKey::new(name)))
}

pub struct AttributeIndexView<'a> {
    tx: Option<&'a Transaction>,
    unique: MapView<'a, AttributeKey, Arc<UniqueIndex>>,
    filter: MapView<'a, AttributeKey, Arc<FilterIndex>>,
    sort: MapView<'a, AttributeKey, Arc<SortIndex>>,
    chain: MapView<'a, AttributeKey, Arc<ChainIndex>>,
}

impl<'a> AttributeIndexView<'a> {
    pub fn unique_keys(&self) -> Vec<AttributeKey> {
        self.unique.keys().cloned().collect()
    }

    pub fn filter_keys(&self) -> Vec<AttributeKey> {
        self.filter.keys().cloned().collect()
    }

    pub fn sort_keys(&self) -> Vec<AttributeKey> {
        self.sort.keys().cloned().collect()
    }

    pub fn chain_keys(&self) -> Vec<AttributeKey> {
        self.chain.keys().cloned().collect()
    }

    pub fn unique_index(&self, name: &str, locale: Option<&str>) -> Option<UniqueIndexView<'a>> {
        lookup(self.unique, name, locale).map(|child| child.read(self.tx))
    }

    pub fn unique_index_by_key(&self, key: &AttributeKey) -> Option<UniqueIndexView<'a>> {
        self.unique.get(key).map(|child| child.read(self.tx))
    }

    pub fn filter_index(&self, name: &str, locale: Option<&str>) -> Option<FilterIndexView<'a>> {
        lookup(self.filter, name, locale).map(|child| child.read(self.tx))
    }

    pub fn filter_index_by_key(&self, key: &AttributeKey) -> Option<FilterIndexView<'a>> {
        self.filter.get(key).map(|child| child.read(self.tx))
    }

    pub fn sort_index(&self, name: &str, locale: Option<&str>) -> Option<SortIndexView<'a>> {
        lookup(self.sort, name, locale).map(|child| child.read(self.tx))
    }

    pub fn sort_index_by_key(&self, key: &AttributeKey) -> Option<SortIndexView<'a>> {
        self.sort.get(key).map(|child| child.read(self.tx))
    }

    pub fn chain_index(&self, name: &str, locale: Option<&str>) -> Option<ChainIndexView<'a>> {
        lookup(self.chain, name, locale).map(|child| child.read(self.tx))
    }

    pub fn chain_index_by_key(&self, key: &AttributeKey) -> Option<ChainIndexView<'a>> {
        self.chain.get(key).map(|child| child.read(self.tx))
    }

    pub fn is_empty(&self) -> bool {
        self.unique.is_empty() && self.filter.is_empty() && self.sort.is_empty() && self.chain.is_empty()
    }
}

enum Target<'a> {
    Direct(&'a mut AttributeIndex),
    Layered {
        index: &'a AttributeIndex,
        tx: &'a mut Transaction,
    },
}

/// Routes attribute mutations to child indexes.
///
/// Direct writers mutate the children in place (cloning children still
/// shared with an older committed copy). Layered writers record child
/// creation and removal in the attribute index layer and every child write
/// in the child's own layer.
pub struct AttributeIndexWriter<'a> {
    target: Target<'a>,
}

/// Child index kept by an attribute index
trait ChildIndex: Clone + TransactionalLayerProducer<Committed = Self> {
    fn is_empty_in(&self, tx: Option<&Transaction>) -> bool;
}

impl ChildIndex for UniqueIndex {
    fn is_empty_in(&self, tx: Option<&Transaction>) -> bool {
        self.read(tx).is_empty()
    }
}

impl ChildIndex for FilterIndex {
    fn is_empty_in(&self, tx: Option<&Transaction>) -> bool {
        self.read(tx).is_empty()
    }
}

impl ChildIndex for SortIndex {
    fn is_empty_in(&self, tx: Option<&Transaction>) -> bool {
        self.read(tx).is_empty()
    }
}

impl ChildIndex for ChainIndex {
    fn is_empty_in(&self, tx: Option<&Transaction>) -> bool {
        self.read(tx).is_empty()
    }
}

type ChildLayer<C> = MapLayer<AttributeKey, Arc<C>>;

fn unique_layer(layer: &mut AttributeIndexLayer) -> &mut ChildLayer<UniqueIndex> {
    &mut layer.unique
}

fn filter_layer(layer: &mut AttributeIndexLayer) -> &mut ChildLayer<FilterIndex> {
    &mut layer.filter
}

fn sort_layer(layer: &mut AttributeIndexLayer) -> &mut ChildLayer<SortIndex> {
    &mut layer.sort
}

fn chain_layer(layer: &mut AttributeIndexLayer) -> &mut ChildLayer<ChainIndex> {
    &mut layer.chain
}

/// Apply `apply` to the child for `key` in place.
///
/// A missing child is obtained from `create`; a child left empty is
/// unregistered, even when `apply` failed.
fn apply_direct<C: ChildIndex, T>(
    children: &mut Children<C>,
    key: &AttributeKey,
    create: impl FnOnce() -> IndexResult<C>,
    apply: impl FnOnce(&mut C) -> IndexResult<T>,
) -> IndexResult<T> {
    let mut access = children.access();
    if !access.contains_key(key) {
        access.insert(key.clone(), Arc::new(create()?));
    }
    let child = access
        .get_mut(key)
        .ok_or_else(|| IndexError::internal(format!("Child index of attribute `{}` vanished!", key)))?;
    let child = Arc::make_mut(child);
    let result = apply(child);
    if child.is_empty_in(None) {
        access.remove(key);
    }
    result
}

/// Apply `apply` to the child for `key` through the layers of `tx`
fn apply_layered<C: ChildIndex, T>(
    index: &AttributeIndex,
    tx: &mut Transaction,
    children: &Children<C>,
    layer_of: fn(&mut AttributeIndexLayer) -> &mut ChildLayer<C>,
    key: &AttributeKey,
    create: impl FnOnce() -> IndexResult<C>,
    apply: impl FnOnce(&C, &mut Transaction) -> IndexResult<T>,
) -> IndexResult<T> {
    let child = {
        let mut access = children.access_layered(layer_of(index.own_layer(tx)?));
        match access.get(key) {
            Some(child) => Arc::clone(child),
            None => {
                let child = Arc::new(create()?);
                access.insert(key.clone(), Arc::clone(&child));
                child
            }
        }
    };
    let result = apply(&child, tx);
    if child.is_empty_in(Some(tx)) {
        child.discard(tx);
        children
            .access_layered(layer_of(index.own_layer(tx)?))
            .remove(key);
    }
    result
}

fn missing_child(kind: &str, key: &AttributeKey) -> IndexError {
    IndexError::invalid_usage(format!("{} index for attribute `{}` not found!", kind, key))
}

impl AttributeIndexWriter<'_> {
    fn index(&self) -> &AttributeIndex {
        match &self.target {
            Target::Direct(index) => index,
            Target::Layered { index, .. } => index,
        }
    }

    fn key_of(&self, name: &str, localized: bool, locale: Option<&str>) -> IndexResult<AttributeKey> {
        self.index().attribute_key(name, localized, locale)
    }

    /// Count and log rejected unique registrations
    fn observe<T>(&self, result: IndexResult<T>) -> IndexResult<T> {
        if let Err(IndexError::UniqueValueViolation {
            attribute,
            value,
            existing_owner,
            ..
        }) = &result
        {
            self.index().metrics.increment_unique_violations();
            log_event_with_fields(
                Event::UniqueViolation,
                &[
                    ("attribute", attribute),
                    ("value", value),
                    ("owner", existing_owner),
                ],
            );
        }
        result
    }

    fn unique<T>(
        &mut self,
        key: &AttributeKey,
        create: impl FnOnce(&dyn IdGenerator) -> IndexResult<UniqueIndex>,
        apply: impl FnOnce(&mut UniqueIndexWriter<'_>) -> IndexResult<T>,
    ) -> IndexResult<T> {
        match &mut self.target {
            Target::Direct(index) => {
                let ids = Arc::clone(&index.ids);
                apply_direct(&mut index.unique, key, || create(ids.as_ref()), |child| {
                    apply(&mut child.write())
                })
            }
            Target::Layered { index, tx } => apply_layered(
                *index,
                tx,
                &index.unique,
                unique_layer,
                key,
                || create(index.ids.as_ref()),
                |child, tx| apply(&mut child.write_in(tx)?),
            ),
        }
    }

    fn filter<T>(
        &mut self,
        key: &AttributeKey,
        create: impl FnOnce(&dyn IdGenerator) -> IndexResult<FilterIndex>,
        apply: impl FnOnce(&mut FilterIndexWriter<'_>) -> IndexResult<T>,
    ) -> IndexResult<T> {
        match &mut self.target {
            Target::Direct(index) => {
                let ids = Arc::clone(&index.ids);
                apply_direct(&mut index.filter, key, || create(ids.as_ref()), |child| {
                    apply(&mut child.write())
                })
            }
            Target::Layered { index, tx } => apply_layered(
                *index,
                tx,
                &index.filter,
                filter_layer,
                key,
                || create(index.ids.as_ref()),
                |child, tx| apply(&mut child.write_in(tx)?),
            ),
        }
    }

    fn sort<T>(
        &mut self,
        key: &AttributeKey,
        create: impl FnOnce(&dyn IdGenerator) -> IndexResult<SortIndex>,
        apply: impl FnOnce(&mut SortIndexWriter<'_>) -> IndexResult<T>,
    ) -> IndexResult<T> {
        match &mut self.target {
            Target::Direct(index) => {
                let ids = Arc::clone(&index.ids);
                apply_direct(&mut index.sort, key, || create(ids.as_ref()), |child| {
                    apply(&mut child.write())
                })
            }
            Target::Layered { index, tx } => apply_layered(
                *index,
                tx,
                &index.sort,
                sort_layer,
                key,
                || create(index.ids.as_ref()),
                |child, tx| apply(&mut child.write_in(tx)?),
            ),
        }
    }

    fn chain<T>(
        &mut self,
        key: &AttributeKey,
        create: impl FnOnce(&dyn IdGenerator) -> IndexResult<ChainIndex>,
        apply: impl FnOnce(&mut ChainIndexWriter<'_>) -> IndexResult<T>,
    ) -> IndexResult<T> {
        match &mut self.target {
            Target::Direct(index) => {
                let ids = Arc::clone(&index.ids);
                apply_direct(&mut index.chain, key, || create(ids.as_ref()), |child| {
                    apply(&mut child.write())
                })
            }
            Target::Layered { index, tx } => apply_layered(
                *index,
                tx,
                &index.chain,
                chain_layer,
                key,
                || create(index.ids.as_ref()),
                |child, tx| apply(&mut child.write_in(tx)?),
            ),
        }
    }

    /// Claim `value` of a unique attribute for `record`
    pub fn insert_unique(
        &mut self,
        schema: &AttributeSchema,
        locale: Option<&str>,
        value: &AttributeValue,
        record: RecordId,
    ) -> IndexResult<()> {
        let key = self.key_of(&schema.name, schema.localized, locale)?;
        let result = self.unique(
            &key,
            |ids| Ok(UniqueIndex::new(ids, key.clone(), schema.value_type)),
            |writer| writer.register(value, record),
        );
        self.observe(result)
    }

    /// Release `value` of a unique attribute held by `record`
    pub fn remove_unique(
        &mut self,
        schema: &AttributeSchema,
        locale: Option<&str>,
        value: &AttributeValue,
        record: RecordId,
    ) -> IndexResult<()> {
        let key = self.key_of(&schema.name, schema.localized, locale)?;
        self.unique(
            &key,
            |_| Err(missing_child("Unique", &key)),
            |writer| writer.unregister(value, record),
        )
    }

    /// Index `value` of a filterable attribute for `record`
    pub fn insert_filter(
        &mut self,
        schema: &AttributeSchema,
        locale: Option<&str>,
        value: &AttributeValue,
        record: RecordId,
    ) -> IndexResult<()> {
        let key = self.key_of(&schema.name, schema.localized, locale)?;
        self.filter(
            &key,
            |ids| Ok(FilterIndex::new(ids, schema.value_type)),
            |writer| writer.add_record(record, value),
        )
    }

    /// Remove `value` of a filterable attribute of `record`
    pub fn remove_filter(
        &mut self,
        schema: &AttributeSchema,
        locale: Option<&str>,
        value: &AttributeValue,
        record: RecordId,
    ) -> IndexResult<()> {
        let key = self.key_of(&schema.name, schema.localized, locale)?;
        self.filter(
            &key,
            |_| Err(missing_child("Filter", &key)),
            |writer| writer.remove_record(record, value),
        )
    }

    /// Index additional array elements of a filterable attribute
    pub fn add_filter_delta(
        &mut self,
        schema: &AttributeSchema,
        locale: Option<&str>,
        delta: &[Value],
        record: RecordId,
    ) -> IndexResult<()> {
        let key = self.key_of(&schema.name, schema.localized, locale)?;
        self.filter(
            &key,
            |_| Err(missing_child("Filter", &key)),
            |writer| writer.add_record_delta(record, delta),
        )
    }

    /// Remove some array elements of a filterable attribute
    pub fn remove_filter_delta(
        &mut self,
        schema: &AttributeSchema,
        locale: Option<&str>,
        delta: &[Value],
        record: RecordId,
    ) -> IndexResult<()> {
        let key = self.key_of(&schema.name, schema.localized, locale)?;
        self.filter(
            &key,
            |_| Err(missing_child("Filter", &key)),
            |writer| writer.remove_record_delta(record, delta),
        )
    }

    /// Place `record` in the sort order of a sortable attribute
    pub fn insert_sort(
        &mut self,
        schema: &AttributeSchema,
        locale: Option<&str>,
        value: &Value,
        record: RecordId,
    ) -> IndexResult<()> {
        let key = self.key_of(&schema.name, schema.localized, locale)?;
        self.sort(
            &key,
            |ids| Ok(SortIndex::new(ids, SortComparator::single(schema.value_type)?)),
            |writer| writer.add_record(value, record),
        )
    }

    /// Remove `record` from the sort order of a sortable attribute
    pub fn remove_sort(
        &mut self,
        schema: &AttributeSchema,
        locale: Option<&str>,
        value: &Value,
        record: RecordId,
    ) -> IndexResult<()> {
        let key = self.key_of(&schema.name, schema.localized, locale)?;
        self.sort(
            &key,
            |_| Err(missing_child("Sort", &key)),
            |writer| writer.remove_record(value, record),
        )
    }

    /// Place `record` in the order of a compound sort
    pub fn insert_compound_sort(
        &mut self,
        schema: &CompoundSchema,
        locale: Option<&str>,
        slots: &[Option<Value>],
        record: RecordId,
    ) -> IndexResult<()> {
        let key = self.key_of(&schema.name, schema.localized, locale)?;
        self.sort(
            &key,
            |ids| Ok(SortIndex::new(ids, SortComparator::compound(schema.sources.clone())?)),
            |writer| writer.add_compound_record(slots, record),
        )
    }

    /// Remove `record` from the order of a compound sort
    pub fn remove_compound_sort(
        &mut self,
        schema: &CompoundSchema,
        locale: Option<&str>,
        slots: &[Option<Value>],
        record: RecordId,
    ) -> IndexResult<()> {
        let key = self.key_of(&schema.name, schema.localized, locale)?;
        self.sort(
            &key,
            |_| Err(missing_child("Sort", &key)),
            |writer| writer.remove_compound_record(slots, record),
        )
    }

    /// Record the predecessor fact of `record` in a chained attribute
    pub fn insert_chain(
        &mut self,
        schema: &AttributeSchema,
        locale: Option<&str>,
        predecessor: Predecessor,
        record: RecordId,
    ) -> IndexResult<()> {
        let key = self.key_of(&schema.name, schema.localized, locale)?;
        let memoize = self.index().config.memoize_resolved_order;
        self.chain(
            &key,
            |ids| Ok(ChainIndex::new(ids).memoizing(memoize)),
            |writer| writer.upsert_predecessor(predecessor, record),
        )
    }

    /// Forget the predecessor fact of `record` in a chained attribute
    pub fn remove_chain(&mut self, schema: &AttributeSchema, locale: Option<&str>, record: RecordId) -> IndexResult<()> {
        let key = self.key_of(&schema.name, schema.localized, locale)?;
        self.chain(
            &key,
            |_| Err(missing_child("Chain", &key)),
            |writer| writer.remove_predecessor(record),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{SequenceIdGenerator, TransactionId};

    fn index() -> AttributeIndex {
        AttributeIndex::new(Arc::new(SequenceIdGenerator::new()), IndexConfig::default())
    }

    fn code() -> AttributeSchema {
        AttributeSchema::new("code", ValueType::String)
    }

    fn s(value: &str) -> AttributeValue {
        AttributeValue::Scalar(Value::string(value))
    }

    #[test]
    fn test_children_created_and_dropped() {
        let mut index = index();
        index.write().insert_unique(&code(), None, &s("A"), 1).unwrap();
        index.write().insert_filter(&code(), None, &s("A"), 1).unwrap();
        assert_eq!(index.read(None).unique_keys(), vec![AttributeKey::new("code")]);
        assert_eq!(index.read(None).filter_keys(), vec![AttributeKey::new("code")]);

        index.write().remove_unique(&code(), None, &s("A"), 1).unwrap();
        index.write().remove_filter(&code(), None, &s("A"), 1).unwrap();
        assert!(index.read(None).is_empty());
    }

    #[test]
    fn test_failed_first_insert_leaves_no_child() {
        let mut index = index();
        let err = index
            .write()
            .insert_unique(&code(), None, &AttributeValue::Scalar(Value::Int(4)), 1)
            .unwrap_err();
        assert_eq!(err.code(), "IDX_INVALID_USAGE");
        assert!(index.read(None).unique_keys().is_empty());
    }

    #[test]
    fn test_unique_violation_counted() {
        let mut index = index();
        index.write().insert_unique(&code(), None, &s("A"), 1).unwrap();
        let err = index.write().insert_unique(&code(), None, &s("A"), 2).unwrap_err();
        assert_eq!(err.code(), "IDX_UNIQUE_VALUE_VIOLATION");
        assert_eq!(index.metrics().snapshot().unique_violations, 1);
        assert_eq!(
            index
                .read(None)
                .unique_index("code", None)
                .unwrap()
                .record_by_value(&Value::string("A"))
                .unwrap(),
            Some(1)
        );
    }

    #[test]
    fn test_localized_lookup_falls_back() {
        let mut index = AttributeIndex::new(
            Arc::new(SequenceIdGenerator::new()),
            IndexConfig {
                allowed_locales: vec!["en-US".to_string(), "cs-CZ".to_string()],
                ..Default::default()
            },
        );
        let name = AttributeSchema::localized("name", ValueType::String);
        index.write().insert_filter(&name, Some("en_us"), &s("Hello"), 1).unwrap();
        index.write().insert_filter(&code(), None, &s("X"), 2).unwrap();

        let view = index.read(None);
        assert!(view.filter_index("name", Some("en-US")).is_some());
        assert!(view.filter_index("name", Some("cs-CZ")).is_none());
        assert!(view.filter_index("code", Some("cs-CZ")).is_some());

        let err = index.write().insert_filter(&name, None, &s("Hi"), 3).unwrap_err();
        assert_eq!(err.code(), "IDX_INVALID_USAGE");
        let err = index.write().insert_filter(&name, Some("de-DE"), &s("Hallo"), 3).unwrap_err();
        assert!(err.to_string().contains("not among allowed locales"));
    }

    #[test]
    fn test_missing_child_is_reported() {
        let mut index = index();
        let err = index.write().remove_sort(&code(), None, &Value::string("A"), 1).unwrap_err();
        assert_eq!(
            err.to_string(),
            "[IDX_INVALID_USAGE] Sort index for attribute `code` not found!"
        );
    }

    #[test]
    fn test_transaction_isolation_and_commit() {
        let index = index();
        let order = AttributeSchema::new("order", ValueType::Int);
        let mut tx = Transaction::new(TransactionId::new(1));
        {
            let mut writer = index.write_in(&mut tx);
            writer.insert_chain(&order, None, Predecessor::Head, 5).unwrap();
            writer.insert_chain(&order, None, Predecessor::Of(5), 3).unwrap();
            writer.insert_sort(&order, None, &Value::Int(20), 5).unwrap();
            writer.insert_sort(&order, None, &Value::Int(10), 3).unwrap();
        }
        assert!(index.read(None).is_empty());
        let view = index.read(Some(&tx));
        assert_eq!(view.chain_index("order", None).unwrap().resolve(), vec![5, 3]);
        assert_eq!(view.sort_index("order", None).unwrap().sorted_records(), vec![3, 5]);

        let committed = index.commit(&mut tx).unwrap();
        assert_eq!(tx.layer_count(), 0);
        assert!(index.read(None).is_empty());
        assert_eq!(
            committed.read(None).chain_index("order", None).unwrap().resolve(),
            vec![5, 3]
        );
        assert_eq!(committed.metrics().snapshot().commits, 1);
        assert_eq!(committed.metrics().snapshot().layers_created, 1);
    }

    #[test]
    fn test_untouched_children_are_shared() {
        let mut index = index();
        index.write().insert_filter(&code(), None, &s("A"), 1).unwrap();
        let other = AttributeSchema::new("other", ValueType::Int);

        let mut tx = Transaction::new(TransactionId::new(1));
        index
            .write_in(&mut tx)
            .insert_filter(&other, None, &AttributeValue::Scalar(Value::Int(1)), 1)
            .unwrap();
        let committed = index.commit(&mut tx).unwrap();

        let key = AttributeKey::new("code");
        assert!(Arc::ptr_eq(
            index.filter.base().get(&key).unwrap(),
            committed.filter.base().get(&key).unwrap()
        ));
        assert_eq!(committed.read(None).filter_keys().len(), 2);
    }

    #[test]
    fn test_removal_in_transaction_drops_child() {
        let mut index = index();
        index.write().insert_unique(&code(), None, &s("A"), 1).unwrap();

        let mut tx = Transaction::new(TransactionId::new(1));
        index.write_in(&mut tx).remove_unique(&code(), None, &s("A"), 1).unwrap();
        assert!(index.read(Some(&tx)).unique_keys().is_empty());
        assert_eq!(index.read(None).unique_keys().len(), 1);

        let committed = index.commit(&mut tx).unwrap();
        assert!(committed.read(None).is_empty());
        assert_eq!(tx.layer_count(), 0);
    }

    #[test]
    fn test_emptied_children_leave_no_layers() {
        let order = AttributeSchema::new("order", ValueType::Int);
        let mut index = index();
        index.write().insert_chain(&order, None, Predecessor::Head, 1).unwrap();
        index.write().insert_filter(&code(), None, &s("A"), 1).unwrap();

        let mut tx = Transaction::new(TransactionId::new(1));
        {
            let mut writer = index.write_in(&mut tx);
            writer.remove_chain(&order, None, 1).unwrap();
            writer.insert_unique(&code(), None, &s("B"), 2).unwrap();
            writer.remove_unique(&code(), None, &s("B"), 2).unwrap();
            writer.remove_filter(&code(), None, &s("A"), 1).unwrap();
        }
        let committed = index.commit(&mut tx).unwrap();
        assert!(committed.read(None).is_empty());
        assert_eq!(tx.layer_count(), 0);
    }

    #[test]
    fn test_rollback_drops_foreign_layer() {
        let index = index();
        let mut tx = Transaction::new(TransactionId::new(1));
        tx.layer_or_insert_with(index.structure_id(), || 7u32).unwrap();
        index.discard(&mut tx);
        assert_eq!(tx.layer_count(), 0);
        assert_eq!(index.metrics().snapshot().rollbacks, 1);
    }

    #[test]
    fn test_rollback_discards_child_layers() {
        let index = index();
        let mut tx = Transaction::new(TransactionId::new(1));
        index.write_in(&mut tx).insert_unique(&code(), None, &s("A"), 1).unwrap();
        assert!(tx.layer_count() >= 2);
        index.discard(&mut tx);
        assert_eq!(tx.layer_count(), 0);
        assert_eq!(index.metrics().snapshot().rollbacks, 1);
    }

    #[test]
    fn test_compound_sort() {
        let mut index = index();
        let schema = CompoundSchema::new(
            "byNameAndAge",
            vec![
                ComparatorSource::ascending(ValueType::String),
                ComparatorSource::descending(ValueType::Int),
            ],
        );
        let mut writer = index.write();
        writer
            .insert_compound_sort(&schema, None, &[Some(Value::string("b")), Some(Value::Int(1))], 1)
            .unwrap();
        writer
            .insert_compound_sort(&schema, None, &[Some(Value::string("a")), Some(Value::Int(1))], 2)
            .unwrap();
        writer
            .insert_compound_sort(&schema, None, &[Some(Value::string("a")), Some(Value::Int(9))], 3)
            .unwrap();
        let view = index.read(None);
        assert_eq!(
            view.sort_index("byNameAndAge", None).unwrap().sorted_records(),
            vec![3, 2, 1]
        );
    }

    #[test]
    fn test_storage_parts_round_trip() {
        let mut index = index();
        let order = AttributeSchema::new("order", ValueType::Int);
        {
            let mut writer = index.write();
            writer.insert_unique(&code(), None, &s("A"), 1).unwrap();
            writer.insert_filter(&code(), None, &s("A"), 1).unwrap();
            writer.insert_sort(&order, None, &Value::Int(3), 1).unwrap();
            writer.insert_chain(&order, None, Predecessor::Head, 1).unwrap();
            writer.insert_chain(&order, None, Predecessor::Of(1), 2).unwrap();
        }
        let parts = index.modified_storage_parts(7);
        assert_eq!(parts.len(), 4);
        index.reset_dirty();
        assert!(index.modified_storage_parts(7).is_empty());
        assert_eq!(index.metrics().snapshot().storage_parts_exported, 4);

        let restored = AttributeIndex::from_storage_parts(
            Arc::new(SequenceIdGenerator::starting_at(100)),
            IndexConfig::default(),
            parts,
        )
        .unwrap();
        let view = restored.read(None);
        assert_eq!(view.chain_index("order", None).unwrap().resolve(), vec![1, 2]);
        assert_eq!(view.sort_index("order", None).unwrap().sorted_records(), vec![1]);
        assert_eq!(
            view.unique_index("code", None)
                .unwrap()
                .record_by_value(&Value::string("A"))
                .unwrap(),
            Some(1)
        );
        assert!(restored.modified_storage_parts(7).is_empty());
    }

    #[test]
    fn test_verified_commit_counts_inconsistent_chains() {
        let index = AttributeIndex::new(Arc::new(SequenceIdGenerator::new()), IndexConfig::verifying());
        let order = AttributeSchema::new("order", ValueType::Int);
        let mut tx = Transaction::new(TransactionId::new(1));
        {
            let mut writer = index.write_in(&mut tx);
            writer.insert_chain(&order, None, Predecessor::Head, 1).unwrap();
            writer.insert_chain(&order, None, Predecessor::Of(9), 2).unwrap();
        }
        let committed = index.commit(&mut tx).unwrap();
        assert_eq!(committed.metrics().snapshot().inconsistent_chains, 1);
    }
}
