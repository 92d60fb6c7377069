//! Sort keys and their comparators
//!
//! A sort index orders records by a `SortKey`: one slot for a plain sortable
//! attribute, several slots for a compound sort. Each slot has its own
//! direction and null placement.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::{ensure, IndexResult};
use super::value::{Value, ValueType};

/// Values of one sort key, slot by slot
pub type SortKey = Vec<Option<Value>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderDirection {
    Asc,
    Desc,
}

/// Placement of missing slot values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullsOrder {
    First,
    Last,
}

/// Descriptor of one sort key slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComparatorSource {
    pub value_type: ValueType,
    pub direction: OrderDirection,
    pub nulls: NullsOrder,
}

impl ComparatorSource {
    pub fn new(value_type: ValueType, direction: OrderDirection, nulls: NullsOrder) -> Self {
        Self {
            value_type,
            direction,
            nulls,
        }
    }

    /// Ascending slot with nulls last
    pub fn ascending(value_type: ValueType) -> Self {
        Self::new(value_type, OrderDirection::Asc, NullsOrder::Last)
    }

    pub fn descending(value_type: ValueType) -> Self {
        Self::new(value_type, OrderDirection::Desc, NullsOrder::Last)
    }

    /// Null placement is absolute; direction only flips present values
    pub fn compare(&self, a: Option<&Value>, b: Option<&Value>) -> Ordering {
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => match self.nulls {
                NullsOrder::First => Ordering::Less,
                NullsOrder::Last => Ordering::Greater,
            },
            (Some(_), None) => match self.nulls {
                NullsOrder::First => Ordering::Greater,
                NullsOrder::Last => Ordering::Less,
            },
            (Some(a), Some(b)) => match self.direction {
                OrderDirection::Asc => a.cmp(b),
                OrderDirection::Desc => b.cmp(a),
            },
        }
    }
}

impl fmt::Display for ComparatorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match self.direction {
            OrderDirection::Asc => "asc",
            OrderDirection::Desc => "desc",
        };
        let nulls = match self.nulls {
            NullsOrder::First => "nulls first",
            NullsOrder::Last => "nulls last",
        };
        write!(f, "{} {} {}", self.value_type, direction, nulls)
    }
}

/// Lexicographic comparator over sort keys, one source per slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortComparator {
    sources: Vec<ComparatorSource>,
}

impl SortComparator {
    /// Comparator of a plain sortable attribute
    pub fn single(value_type: ValueType) -> IndexResult<Self> {
        Self::from_sources(vec![ComparatorSource::ascending(value_type)])
    }

    /// Comparator of a compound sort over at least two slots
    pub fn compound(sources: Vec<ComparatorSource>) -> IndexResult<Self> {
        ensure(sources.len() >= 2, || {
            format!(
                "compound sort needs at least two slots, {} given",
                sources.len()
            )
        })?;
        Self::from_sources(sources)
    }

    pub(crate) fn from_sources(sources: Vec<ComparatorSource>) -> IndexResult<Self> {
        ensure(!sources.is_empty(), || "sort comparator has no slots".to_string())?;
        for source in &sources {
            ensure(source.value_type != ValueType::Range, || {
                "range values cannot be sorted".to_string()
            })?;
        }
        Ok(Self { sources })
    }

    pub fn sources(&self) -> &[ComparatorSource] {
        &self.sources
    }

    pub fn is_compound(&self) -> bool {
        self.sources.len() > 1
    }

    /// Validated and normalized key of `slots`.
    ///
    /// Every present slot must match its declared type and at least one
    /// slot must be present.
    pub fn key(&self, slots: &[Option<Value>]) -> IndexResult<SortKey> {
        ensure(slots.len() == self.sources.len(), || {
            format!(
                "sort key must have {} slots, {} given",
                self.sources.len(),
                slots.len()
            )
        })?;
        ensure(slots.iter().any(Option::is_some), || {
            "sort key must contain at least one value".to_string()
        })?;
        slots
            .iter()
            .zip(&self.sources)
            .map(|(slot, source)| match slot {
                Some(value) => {
                    value.expect_type(source.value_type)?;
                    Ok(Some(value.normalize()))
                }
                None => Ok(None),
            })
            .collect()
    }

    /// Key of a single-slot comparator
    pub fn scalar_key(&self, value: &Value) -> IndexResult<SortKey> {
        self.key(std::slice::from_ref(&Some(value.clone())))
    }

    pub fn compare(&self, a: &[Option<Value>], b: &[Option<Value>]) -> Ordering {
        for (i, source) in self.sources.iter().enumerate() {
            let ordering = source.compare(
                a.get(i).and_then(Option::as_ref),
                b.get(i).and_then(Option::as_ref),
            );
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

pub(crate) fn format_key(key: &[Option<Value>]) -> String {
    let slots: Vec<String> = key
        .iter()
        .map(|slot| match slot {
            Some(value) => value.to_string(),
            None => "null".to_string(),
        })
        .collect();
    if slots.len() == 1 {
        slots.join("")
    } else {
        format!("[{}]", slots.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(value: i64) -> Option<Value> {
        Some(Value::Int(value))
    }

    #[test]
    fn test_nulls_ignore_direction() {
        let desc_first = ComparatorSource::new(ValueType::Int, OrderDirection::Desc, NullsOrder::First);
        assert_eq!(desc_first.compare(None, Some(&Value::Int(1))), Ordering::Less);
        assert_eq!(
            desc_first.compare(Some(&Value::Int(1)), Some(&Value::Int(2))),
            Ordering::Greater
        );

        let asc_last = ComparatorSource::ascending(ValueType::Int);
        assert_eq!(asc_last.compare(None, Some(&Value::Int(1))), Ordering::Greater);
        assert_eq!(asc_last.compare(None, None), Ordering::Equal);
    }

    #[test]
    fn test_compound_compares_slot_by_slot() {
        let comparator = SortComparator::compound(vec![
            ComparatorSource::ascending(ValueType::String),
            ComparatorSource::descending(ValueType::Int),
        ])
        .unwrap();
        let a = vec![Some(Value::string("a")), int(1)];
        let b = vec![Some(Value::string("a")), int(2)];
        let c = vec![Some(Value::string("b")), int(9)];
        assert_eq!(comparator.compare(&a, &b), Ordering::Greater);
        assert_eq!(comparator.compare(&b, &c), Ordering::Less);
        assert_eq!(comparator.compare(&a, &a), Ordering::Equal);
    }

    #[test]
    fn test_compound_requires_two_slots() {
        let err = SortComparator::compound(vec![ComparatorSource::ascending(ValueType::Int)]).unwrap_err();
        assert_eq!(err.code(), "IDX_INVALID_USAGE");
    }

    #[test]
    fn test_range_is_not_sortable() {
        assert!(SortComparator::single(ValueType::Range).is_err());
    }

    #[test]
    fn test_key_validates_and_normalizes() {
        let comparator = SortComparator::compound(vec![
            ComparatorSource::ascending(ValueType::String),
            ComparatorSource::ascending(ValueType::Int),
        ])
        .unwrap();

        let key = comparator
            .key(&[Some(Value::string("caf\u{00e9}")), None])
            .unwrap();
        assert_eq!(key, vec![Some(Value::string("cafe\u{0301}")), None]);

        assert!(comparator.key(&[int(1), int(1)]).is_err());
        assert!(comparator.key(&[None, None]).is_err());
        assert!(comparator.key(&[int(1)]).is_err());
    }

    #[test]
    fn test_format_key() {
        assert_eq!(format_key(&[int(3)]), "3");
        assert_eq!(format_key(&[int(3), None]), "[3, null]");
    }
}
