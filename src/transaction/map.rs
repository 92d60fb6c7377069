//! Ordered map with a sparse transactional diff
//!
//! The layer records modified entries and removed keys of the base:
//! - `removed` only holds keys present in the base
//! - `removed` and `modified` are disjoint
//!
//! Reads consult `removed`, then `modified`, then the base.

use std::collections::{BTreeMap, BTreeSet};
use std::iter::Peekable;
use std::ops::Bound;

/// Committed map state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionalMap<K, V> {
    base: BTreeMap<K, V>,
}

/// Pending changes of one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapLayer<K, V> {
    modified: BTreeMap<K, V>,
    removed: BTreeSet<K>,
}

impl<K: Ord, V> Default for MapLayer<K, V> {
    fn default() -> Self {
        Self {
            modified: BTreeMap::new(),
            removed: BTreeSet::new(),
        }
    }
}

impl<K: Ord, V> MapLayer<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.removed.is_empty()
    }
}

impl<K: Ord, V> Default for TransactionalMap<K, V> {
    fn default() -> Self {
        Self {
            base: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone, V: Clone> TransactionalMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(base: BTreeMap<K, V>) -> Self {
        Self { base }
    }

    /// Committed entries
    pub fn base(&self) -> &BTreeMap<K, V> {
        &self.base
    }

    /// Read view overlaying `layer` on the base
    pub fn view<'a>(&'a self, layer: Option<&'a MapLayer<K, V>>) -> MapView<'a, K, V> {
        MapView {
            base: &self.base,
            layer,
        }
    }

    /// Writer mutating the base in place
    pub fn access(&mut self) -> MapAccess<'_, K, V> {
        MapAccess::Direct(&mut self.base)
    }

    /// Writer recording changes into `layer`
    pub fn access_layered<'a>(&'a self, layer: &'a mut MapLayer<K, V>) -> MapAccess<'a, K, V> {
        MapAccess::Layered {
            base: &self.base,
            layer,
        }
    }

    /// New committed map: the base with `layer` applied
    pub fn merged(&self, layer: Option<MapLayer<K, V>>) -> Self {
        let mut base = self.base.clone();
        if let Some(layer) = layer {
            for key in &layer.removed {
                base.remove(key);
            }
            base.extend(layer.modified);
        }
        Self { base }
    }
}

/// Read-only view of a map, optionally through a layer
pub struct MapView<'a, K, V> {
    base: &'a BTreeMap<K, V>,
    layer: Option<&'a MapLayer<K, V>>,
}

impl<K, V> Clone for MapView<'_, K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for MapView<'_, K, V> {}

impl<'a, K: Ord + 'a, V: 'a> MapView<'a, K, V> {
    pub fn get(&self, key: &K) -> Option<&'a V> {
        match self.layer {
            None => self.base.get(key),
            Some(layer) => {
                if layer.removed.contains(key) {
                    None
                } else {
                    layer.modified.get(key).or_else(|| self.base.get(key))
                }
            }
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        match self.layer {
            None => self.base.len(),
            Some(layer) => {
                let added = layer
                    .modified
                    .keys()
                    .filter(|key| !self.base.contains_key(key))
                    .count();
                self.base.len() - layer.removed.len() + added
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries in ascending key order
    pub fn iter(&self) -> Box<dyn Iterator<Item = (&'a K, &'a V)> + 'a> {
        match self.layer {
            None => Box::new(self.base.iter()),
            Some(layer) => Box::new(merge(layer, self.base.iter(), layer.modified.iter())),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &'a K> + 'a {
        self.iter().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl Iterator<Item = &'a V> + 'a {
        self.iter().map(|(_, value)| value)
    }

    /// Entries whose key lies within the bounds, ascending.
    ///
    /// Inverted bounds yield nothing.
    pub fn range(&self, from: Bound<&K>, to: Bound<&K>) -> Box<dyn Iterator<Item = (&'a K, &'a V)> + 'a> {
        if !is_valid_range(from, to) {
            return Box::new(std::iter::empty());
        }
        match self.layer {
            None => Box::new(self.base.range::<K, _>((from, to))),
            Some(layer) => Box::new(merge(
                layer,
                self.base.range::<K, _>((from, to)),
                layer.modified.range::<K, _>((from, to)),
            )),
        }
    }
}

fn is_valid_range<K: Ord>(from: Bound<&K>, to: Bound<&K>) -> bool {
    match (from, to) {
        (Bound::Included(a), Bound::Included(b)) => a <= b,
        (Bound::Included(a), Bound::Excluded(b))
        | (Bound::Excluded(a), Bound::Included(b))
        | (Bound::Excluded(a), Bound::Excluded(b)) => a < b,
        _ => true,
    }
}

fn merge<'a, K, V, B, M>(layer: &'a MapLayer<K, V>, base: B, modified: M) -> MergeByKey<'a, K, V, impl Iterator<Item = (&'a K, &'a V)>, M>
where
    K: Ord + 'a,
    V: 'a,
    B: Iterator<Item = (&'a K, &'a V)>,
    M: Iterator<Item = (&'a K, &'a V)>,
{
    let base = base.filter(move |(key, _)| {
        !layer.removed.contains(*key) && !layer.modified.contains_key(*key)
    });
    MergeByKey {
        left: base.peekable(),
        right: modified.peekable(),
    }
}

/// Merge of two ascending iterators with disjoint keys
struct MergeByKey<'a, K: 'a, V: 'a, L, R>
where
    L: Iterator<Item = (&'a K, &'a V)>,
    R: Iterator<Item = (&'a K, &'a V)>,
{
    left: Peekable<L>,
    right: Peekable<R>,
}

impl<'a, K: Ord + 'a, V: 'a, L, R> Iterator for MergeByKey<'a, K, V, L, R>
where
    L: Iterator<Item = (&'a K, &'a V)>,
    R: Iterator<Item = (&'a K, &'a V)>,
{
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        match (self.left.peek(), self.right.peek()) {
            (Some((l, _)), Some((r, _))) => {
                if l < r {
                    self.left.next()
                } else {
                    self.right.next()
                }
            }
            (Some(_), None) => self.left.next(),
            (None, _) => self.right.next(),
        }
    }
}

/// Writer over a map: either the base itself or a layer over it
pub enum MapAccess<'a, K, V> {
    Direct(&'a mut BTreeMap<K, V>),
    Layered {
        base: &'a BTreeMap<K, V>,
        layer: &'a mut MapLayer<K, V>,
    },
}

impl<K: Ord + Clone, V: Clone> MapAccess<'_, K, V> {
    pub fn view(&self) -> MapView<'_, K, V> {
        match self {
            MapAccess::Direct(map) => MapView {
                base: &**map,
                layer: None,
            },
            MapAccess::Layered { base, layer } => MapView {
                base: *base,
                layer: Some(&**layer),
            },
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        match self {
            MapAccess::Direct(map) => map.get(key),
            MapAccess::Layered { base, layer } => {
                if layer.removed.contains(key) {
                    None
                } else {
                    layer.modified.get(key).or_else(|| base.get(key))
                }
            }
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.view().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace; returns the previous value
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        match self {
            MapAccess::Direct(map) => map.insert(key, value),
            MapAccess::Layered { base, layer } => {
                let was_removed = layer.removed.remove(&key);
                let previous = if was_removed {
                    None
                } else if let Some(modified) = layer.modified.get(&key) {
                    Some(modified.clone())
                } else {
                    base.get(&key).cloned()
                };
                layer.modified.insert(key, value);
                previous
            }
        }
    }

    /// Remove; returns the removed value
    pub fn remove(&mut self, key: &K) -> Option<V> {
        match self {
            MapAccess::Direct(map) => map.remove(key),
            MapAccess::Layered { base, layer } => {
                if let Some(previous) = layer.modified.remove(key) {
                    if base.contains_key(key) {
                        layer.removed.insert(key.clone());
                    }
                    return Some(previous);
                }
                if layer.removed.contains(key) {
                    return None;
                }
                let previous = base.get(key).cloned();
                if previous.is_some() {
                    layer.removed.insert(key.clone());
                }
                previous
            }
        }
    }

    /// Mutable access; the base value is copied into the layer on first write
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        match self {
            MapAccess::Direct(map) => map.get_mut(key),
            MapAccess::Layered { base, layer } => {
                if layer.removed.contains(key) {
                    return None;
                }
                if !layer.modified.contains_key(key) {
                    let value = base.get(key)?.clone();
                    layer.modified.insert(key.clone(), value);
                }
                layer.modified.get_mut(key)
            }
        }
    }

    /// Mutable access, inserting `create()` when the key is absent
    pub fn get_or_insert_with<F: FnOnce() -> V>(&mut self, key: K, create: F) -> &mut V {
        match self {
            MapAccess::Direct(map) => map.entry(key).or_insert_with(create),
            MapAccess::Layered { base, layer } => {
                let was_removed = layer.removed.remove(&key);
                let inherited = if was_removed { None } else { base.get(&key) };
                layer
                    .modified
                    .entry(key)
                    .or_insert_with(|| inherited.cloned().unwrap_or_else(create))
            }
        }
    }
}
