//! Positional array with a sparse transactional diff
//!
//! The layer is keyed by base position: `inserted[p]` holds elements that
//! precede base element `p` (`p == base.len()` means "at the end"), and
//! `removed` holds base positions that are gone. Untouched base slots are
//! shared with the committed array.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Committed array state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionalArray<T> {
    base: Vec<T>,
}

/// Pending changes of one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayLayer<T> {
    inserted: BTreeMap<usize, Vec<T>>,
    removed: BTreeSet<usize>,
}

impl<T> Default for ArrayLayer<T> {
    fn default() -> Self {
        Self {
            inserted: BTreeMap::new(),
            removed: BTreeSet::new(),
        }
    }
}

impl<T> ArrayLayer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.removed.is_empty()
    }
}

impl<T> Default for TransactionalArray<T> {
    fn default() -> Self {
        Self { base: Vec::new() }
    }
}

/// Where a logical index falls in base + layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Base(usize),
    Inserted(usize, usize),
    End,
}

impl<T: Clone> TransactionalArray<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(base: Vec<T>) -> Self {
        Self { base }
    }

    pub fn base(&self) -> &[T] {
        &self.base
    }

    pub fn view<'a>(&'a self, layer: Option<&'a ArrayLayer<T>>) -> ArrayView<'a, T> {
        ArrayView {
            base: &self.base,
            layer: layer.filter(|layer| !layer.is_empty()),
        }
    }

    pub fn access(&mut self) -> ArrayAccess<'_, T> {
        ArrayAccess::Direct(&mut self.base)
    }

    pub fn access_layered<'a>(&'a self, layer: &'a mut ArrayLayer<T>) -> ArrayAccess<'a, T> {
        ArrayAccess::Layered {
            base: &self.base,
            layer,
        }
    }

    /// New committed array: the base with `layer` applied
    pub fn merged(&self, layer: Option<ArrayLayer<T>>) -> Self {
        match layer {
            None => self.clone(),
            Some(layer) => Self {
                base: self.view(Some(&layer)).iter().cloned().collect(),
            },
        }
    }
}

fn locate<T>(base_len: usize, layer: &ArrayLayer<T>, index: usize) -> Slot {
    let mut points: BTreeSet<usize> = layer.inserted.keys().copied().collect();
    points.extend(layer.removed.iter().copied());

    // logical index minus base position for the plain base run being walked
    let mut shift: isize = 0;
    let index = index as isize;
    for p in points {
        let start = p as isize + shift;
        if index < start {
            return Slot::Base((index - shift) as usize);
        }
        let inserted = layer.inserted.get(&p).map_or(0, Vec::len) as isize;
        if index < start + inserted {
            return Slot::Inserted(p, (index - start) as usize);
        }
        shift += inserted;
        if p < base_len {
            if layer.removed.contains(&p) {
                shift -= 1;
            } else if index == p as isize + shift {
                return Slot::Base(p);
            }
        }
    }
    let position = index - shift;
    if position < base_len as isize {
        Slot::Base(position as usize)
    } else {
        Slot::End
    }
}

/// Read-only view of an array, optionally through a layer
pub struct ArrayView<'a, T> {
    base: &'a [T],
    layer: Option<&'a ArrayLayer<T>>,
}

impl<T> Clone for ArrayView<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ArrayView<'_, T> {}

impl<'a, T: 'a> ArrayView<'a, T> {
    pub fn len(&self) -> usize {
        match self.layer {
            None => self.base.len(),
            Some(layer) => {
                let inserted: usize = layer.inserted.values().map(Vec::len).sum();
                self.base.len() - layer.removed.len() + inserted
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<&'a T> {
        match self.layer {
            None => self.base.get(index),
            Some(layer) => match locate(self.base.len(), layer, index) {
                Slot::Base(p) => self.base.get(p),
                Slot::Inserted(p, offset) => layer.inserted.get(&p).and_then(|v| v.get(offset)),
                Slot::End => None,
            },
        }
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = &'a T> + 'a> {
        match self.layer {
            None => Box::new(self.base.iter()),
            Some(layer) => {
                let base = self.base;
                Box::new((0..=base.len()).flat_map(move |p| {
                    let inserted = layer.inserted.get(&p).into_iter().flatten();
                    let own = base.get(p).filter(|_| !layer.removed.contains(&p));
                    inserted.chain(own)
                }))
            }
        }
    }

    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.iter().cloned().collect()
    }

    /// Binary search within `[from, to)`; same contract as `slice::binary_search_by`
    pub fn binary_search_in<F>(&self, from: usize, to: usize, mut f: F) -> Result<usize, usize>
    where
        F: FnMut(&T) -> Ordering,
    {
        if self.layer.is_none() {
            return self.base[from..to]
                .binary_search_by(f)
                .map(|i| i + from)
                .map_err(|i| i + from);
        }
        let mut low = from;
        let mut high = to;
        while low < high {
            let mid = low + (high - low) / 2;
            let Some(item) = self.get(mid) else {
                return Err(mid);
            };
            match f(item) {
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
                Ordering::Equal => return Ok(mid),
            }
        }
        Err(low)
    }

    pub fn binary_search_by<F>(&self, f: F) -> Result<usize, usize>
    where
        F: FnMut(&T) -> Ordering,
    {
        self.binary_search_in(0, self.len(), f)
    }
}

/// Writer over an array: either the base itself or a layer over it
pub enum ArrayAccess<'a, T> {
    Direct(&'a mut Vec<T>),
    Layered {
        base: &'a [T],
        layer: &'a mut ArrayLayer<T>,
    },
}

impl<T: Clone> ArrayAccess<'_, T> {
    pub fn view(&self) -> ArrayView<'_, T> {
        match self {
            ArrayAccess::Direct(base) => ArrayView {
                base: base.as_slice(),
                layer: None,
            },
            ArrayAccess::Layered { base, layer } => ArrayView {
                base,
                layer: Some(&**layer),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.view().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert at logical `index`; `index == len()` appends
    pub fn insert(&mut self, index: usize, item: T) {
        match self {
            ArrayAccess::Direct(base) => base.insert(index, item),
            ArrayAccess::Layered { base, layer } => match locate(base.len(), layer, index) {
                Slot::Base(p) => layer.inserted.entry(p).or_default().push(item),
                Slot::Inserted(p, offset) => layer.inserted.entry(p).or_default().insert(offset, item),
                Slot::End => layer.inserted.entry(base.len()).or_default().push(item),
            },
        }
    }

    /// Remove the element at logical `index`
    pub fn remove(&mut self, index: usize) -> Option<T> {
        match self {
            ArrayAccess::Direct(base) => {
                if index < base.len() {
                    Some(base.remove(index))
                } else {
                    None
                }
            }
            ArrayAccess::Layered { base, layer } => match locate(base.len(), layer, index) {
                Slot::Base(p) => {
                    layer.removed.insert(p);
                    base.get(p).cloned()
                }
                Slot::Inserted(p, offset) => {
                    let items = layer.inserted.get_mut(&p)?;
                    let item = items.remove(offset);
                    if items.is_empty() {
                        layer.inserted.remove(&p);
                    }
                    Some(item)
                }
                Slot::End => None,
            },
        }
    }
}
