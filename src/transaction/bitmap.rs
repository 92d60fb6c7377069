//! Record bitmap with a transactional diff
//!
//! `added` never overlaps the base and `removed` is a subset of it.

use crate::index::{RecordBitmap, RecordId};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionalBitmap {
    base: RecordBitmap,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BitmapLayer {
    added: RecordBitmap,
    removed: RecordBitmap,
}

impl BitmapLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl TransactionalBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bitmap(base: RecordBitmap) -> Self {
        Self { base }
    }

    pub fn base(&self) -> &RecordBitmap {
        &self.base
    }

    pub fn view<'a>(&'a self, layer: Option<&'a BitmapLayer>) -> BitmapView<'a> {
        BitmapView {
            base: &self.base,
            layer,
        }
    }

    pub fn access(&mut self) -> BitmapAccess<'_> {
        BitmapAccess::Direct(&mut self.base)
    }

    pub fn access_layered<'a>(&'a self, layer: &'a mut BitmapLayer) -> BitmapAccess<'a> {
        BitmapAccess::Layered {
            base: &self.base,
            layer,
        }
    }

    pub fn merged(&self, layer: Option<BitmapLayer>) -> Self {
        Self {
            base: self.view(layer.as_ref()).to_bitmap(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BitmapView<'a> {
    base: &'a RecordBitmap,
    layer: Option<&'a BitmapLayer>,
}

impl<'a> BitmapView<'a> {
    pub fn contains(&self, id: RecordId) -> bool {
        match self.layer {
            None => self.base.contains(id),
            Some(layer) => {
                layer.added.contains(id) || (self.base.contains(id) && !layer.removed.contains(id))
            }
        }
    }

    pub fn len(&self) -> usize {
        match self.layer {
            None => self.base.len(),
            Some(layer) => self.base.len() - layer.removed.len() + layer.added.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materialized content
    pub fn to_bitmap(&self) -> RecordBitmap {
        match self.layer {
            None => self.base.clone(),
            Some(layer) if layer.is_empty() => self.base.clone(),
            Some(layer) => {
                let mut result = self.base.and_not(&layer.removed);
                result.union_with(&layer.added);
                result
            }
        }
    }

    /// The committed bitmap when no diff applies
    pub fn as_base(&self) -> Option<&'a RecordBitmap> {
        match self.layer {
            Some(layer) if !layer.is_empty() => None,
            _ => Some(self.base),
        }
    }
}

pub enum BitmapAccess<'a> {
    Direct(&'a mut RecordBitmap),
    Layered {
        base: &'a RecordBitmap,
        layer: &'a mut BitmapLayer,
    },
}

impl BitmapAccess<'_> {
    pub fn view(&self) -> BitmapView<'_> {
        match self {
            BitmapAccess::Direct(base) => BitmapView {
                base: &**base,
                layer: None,
            },
            BitmapAccess::Layered { base, layer } => BitmapView {
                base: *base,
                layer: Some(&**layer),
            },
        }
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.view().contains(id)
    }

    /// Add `id`; false if it was already present
    pub fn add(&mut self, id: RecordId) -> bool {
        match self {
            BitmapAccess::Direct(base) => base.add(id),
            BitmapAccess::Layered { base, layer } => {
                if layer.removed.remove(id) {
                    return true;
                }
                if base.contains(id) {
                    return false;
                }
                layer.added.add(id)
            }
        }
    }

    /// Remove `id`; false if it was absent
    pub fn remove(&mut self, id: RecordId) -> bool {
        match self {
            BitmapAccess::Direct(base) => base.remove(id),
            BitmapAccess::Layered { base, layer } => {
                if layer.added.remove(id) {
                    return true;
                }
                if base.contains(id) {
                    layer.removed.add(id)
                } else {
                    false
                }
            }
        }
    }
}
