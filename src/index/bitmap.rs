//! Record-id bitmaps and lazily evaluated set formulas
//!
//! Record ids are signed; they are stored in a roaring bitmap after
//! flipping the sign bit, which keeps the unsigned order equal to the
//! signed one.

use std::fmt;
use std::sync::Arc;

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use super::key::RecordId;

#[inline]
fn encode(id: RecordId) -> u32 {
    (id as u32) ^ 0x8000_0000
}

#[inline]
fn decode(raw: u32) -> RecordId {
    (raw ^ 0x8000_0000) as RecordId
}

/// Compressed set of record ids, iterated in ascending order
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<RecordId>", into = "Vec<RecordId>")]
pub struct RecordBitmap {
    inner: RoaringBitmap,
}

impl RecordBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: RecordId) -> bool {
        self.inner.insert(encode(id))
    }

    pub fn remove(&mut self, id: RecordId) -> bool {
        self.inner.remove(encode(id))
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.inner.contains(encode(id))
    }

    pub fn len(&self) -> usize {
        self.inner.len() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.inner.iter().map(decode)
    }

    pub fn to_vec(&self) -> Vec<RecordId> {
        self.iter().collect()
    }

    pub fn first(&self) -> Option<RecordId> {
        self.inner.min().map(decode)
    }

    pub fn last(&self) -> Option<RecordId> {
        self.inner.max().map(decode)
    }

    /// Number of ids lower than or equal to `id`
    pub fn rank(&self, id: RecordId) -> usize {
        self.inner.rank(encode(id)) as usize
    }

    /// Zero-based position of `id` in ascending order
    pub fn index_of(&self, id: RecordId) -> Option<usize> {
        if self.contains(id) {
            Some(self.rank(id) - 1)
        } else {
            None
        }
    }

    pub fn union_with(&mut self, other: &RecordBitmap) {
        self.inner |= &other.inner;
    }

    pub fn intersect_with(&mut self, other: &RecordBitmap) {
        self.inner &= &other.inner;
    }

    pub fn difference_with(&mut self, other: &RecordBitmap) {
        self.inner -= &other.inner;
    }

    /// Keep ids present in exactly one of the two bitmaps
    pub fn symmetric_difference_with(&mut self, other: &RecordBitmap) {
        self.inner ^= &other.inner;
    }

    pub fn or(&self, other: &RecordBitmap) -> RecordBitmap {
        RecordBitmap {
            inner: &self.inner | &other.inner,
        }
    }

    pub fn and(&self, other: &RecordBitmap) -> RecordBitmap {
        RecordBitmap {
            inner: &self.inner & &other.inner,
        }
    }

    pub fn and_not(&self, other: &RecordBitmap) -> RecordBitmap {
        RecordBitmap {
            inner: &self.inner - &other.inner,
        }
    }
}

impl FromIterator<RecordId> for RecordBitmap {
    fn from_iter<I: IntoIterator<Item = RecordId>>(iter: I) -> Self {
        Self {
            inner: iter.into_iter().map(encode).collect(),
        }
    }
}

impl From<Vec<RecordId>> for RecordBitmap {
    fn from(ids: Vec<RecordId>) -> Self {
        ids.into_iter().collect()
    }
}

impl From<RecordBitmap> for Vec<RecordId> {
    fn from(bitmap: RecordBitmap) -> Self {
        bitmap.to_vec()
    }
}

impl fmt::Debug for RecordBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl fmt::Display for RecordBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, id) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", id)?;
        }
        write!(f, "]")
    }
}

/// Lazily evaluated boolean formula over record bitmaps
///
/// Index queries return formulas instead of materialized bitmaps so the
/// consumer can combine them before paying for the computation.
#[derive(Debug, Clone)]
pub enum RecordSet {
    Empty,
    Constant(Arc<RecordBitmap>),
    Or(Vec<RecordSet>),
    And(Vec<RecordSet>),
    AndNot(Box<RecordSet>, Box<RecordSet>),
}

impl RecordSet {
    pub fn constant(bitmap: RecordBitmap) -> Self {
        if bitmap.is_empty() {
            RecordSet::Empty
        } else {
            RecordSet::Constant(Arc::new(bitmap))
        }
    }

    pub fn shared(bitmap: Arc<RecordBitmap>) -> Self {
        if bitmap.is_empty() {
            RecordSet::Empty
        } else {
            RecordSet::Constant(bitmap)
        }
    }

    /// Union of `sets`, collapsing trivial cases
    pub fn or(sets: Vec<RecordSet>) -> Self {
        let mut sets: Vec<RecordSet> = sets.into_iter().filter(|s| !s.is_trivially_empty()).collect();
        match sets.len() {
            0 => RecordSet::Empty,
            1 => sets.remove(0),
            _ => RecordSet::Or(sets),
        }
    }

    /// Intersection of `sets`; empty when any operand is trivially empty
    pub fn and(mut sets: Vec<RecordSet>) -> Self {
        if sets.is_empty() || sets.iter().any(RecordSet::is_trivially_empty) {
            return RecordSet::Empty;
        }
        if sets.len() == 1 {
            return sets.remove(0);
        }
        RecordSet::And(sets)
    }

    pub fn and_not(self, subtrahend: RecordSet) -> Self {
        if self.is_trivially_empty() {
            return RecordSet::Empty;
        }
        if subtrahend.is_trivially_empty() {
            return self;
        }
        RecordSet::AndNot(Box::new(self), Box::new(subtrahend))
    }

    /// Empty without computing anything
    pub fn is_trivially_empty(&self) -> bool {
        matches!(self, RecordSet::Empty)
    }

    /// Evaluate the formula
    pub fn compute(&self) -> RecordBitmap {
        match self {
            RecordSet::Empty => RecordBitmap::new(),
            RecordSet::Constant(bitmap) => (**bitmap).clone(),
            RecordSet::Or(sets) => {
                let mut result = RecordBitmap::new();
                for set in sets {
                    match set {
                        RecordSet::Constant(bitmap) => result.union_with(bitmap),
                        other => result.union_with(&other.compute()),
                    }
                }
                result
            }
            RecordSet::And(sets) => {
                let mut iter = sets.iter();
                let mut result = match iter.next() {
                    Some(first) => first.compute(),
                    None => return RecordBitmap::new(),
                };
                for set in iter {
                    if result.is_empty() {
                        break;
                    }
                    result.intersect_with(&set.compute());
                }
                result
            }
            RecordSet::AndNot(minuend, subtrahend) => {
                let mut result = minuend.compute();
                result.difference_with(&subtrahend.compute());
                result
            }
        }
    }

    pub fn to_vec(&self) -> Vec<RecordId> {
        self.compute().to_vec()
    }
}

impl From<RecordBitmap> for RecordSet {
    fn from(bitmap: RecordBitmap) -> Self {
        RecordSet::constant(bitmap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap(ids: &[RecordId]) -> RecordBitmap {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_signed_ids_iterate_in_order() {
        let b = bitmap(&[5, -3, 0, i32::MIN, i32::MAX, -1]);
        assert_eq!(b.to_vec(), vec![i32::MIN, -3, -1, 0, 5, i32::MAX]);
        assert_eq!(b.first(), Some(i32::MIN));
        assert_eq!(b.last(), Some(i32::MAX));
    }

    #[test]
    fn test_rank_and_index_of() {
        let b = bitmap(&[-10, 2, 7, 40]);
        assert_eq!(b.rank(7), 3);
        assert_eq!(b.rank(8), 3);
        assert_eq!(b.index_of(-10), Some(0));
        assert_eq!(b.index_of(40), Some(3));
        assert_eq!(b.index_of(41), None);
    }

    #[test]
    fn test_add_remove() {
        let mut b = RecordBitmap::new();
        assert!(b.add(1));
        assert!(!b.add(1));
        assert!(b.contains(1));
        assert!(b.remove(1));
        assert!(!b.remove(1));
        assert!(b.is_empty());
    }

    #[test]
    fn test_formula() {
        let a = RecordSet::constant(bitmap(&[1, 2, 3, 4]));
        let b = RecordSet::constant(bitmap(&[3, 4, 5]));
        let c = RecordSet::constant(bitmap(&[4]));

        assert_eq!(RecordSet::or(vec![a.clone(), b.clone()]).to_vec(), vec![1, 2, 3, 4, 5]);
        assert_eq!(RecordSet::and(vec![a.clone(), b.clone()]).to_vec(), vec![3, 4]);
        assert_eq!(RecordSet::and(vec![a, b]).and_not(c).to_vec(), vec![3]);
    }

    #[test]
    fn test_formula_short_circuits_empty() {
        let a = RecordSet::constant(bitmap(&[1]));
        assert!(RecordSet::and(vec![a.clone(), RecordSet::Empty]).is_trivially_empty());
        assert!(RecordSet::or(vec![RecordSet::Empty]).is_trivially_empty());
        assert!(RecordSet::constant(RecordBitmap::new()).is_trivially_empty());
        assert!(matches!(a.and_not(RecordSet::Empty), RecordSet::Constant(_)));
    }

    #[test]
    fn test_serde_as_sorted_list() {
        let b = bitmap(&[9, -2, 4]);
        let json = serde_json::to_string(&b).unwrap();
        assert_eq!(json, "[-2,4,9]");
        let back: RecordBitmap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
    }
}
