//! Attribute index subsystem for attrindex
//!
//! Per-entity indexes over attribute values of records, grouped by an
//! `AttributeIndex` and written directly or through transaction layers.
//!
//! # Index kinds
//!
//! - Unique: value to single owner, rejects duplicates
//! - Filter: value to record bitmap, with a range index for range values
//! - Sort: records ordered by (compound) sort key
//! - Chain: records ordered by predecessor links
//! - Global unique: catalog-wide value ownership across entity types
//!
//! # Invariants
//!
//! - Committed structures are immutable; a commit produces a new copy with
//!   the same structure id
//! - Reads inside a transaction see base + layer, reads outside see base only
//! - Values are normalized before they are stored or looked up
//! - Only dirty structures produce storage parts

mod attribute;
mod bitmap;
mod chain;
mod comparator;
mod config;
mod errors;
mod filter;
mod global_unique;
mod key;
mod range;
mod sort;
mod storage;
mod supplier;
mod unique;
mod value;

pub use attribute::{
    AttributeIndex, AttributeIndexLayer, AttributeIndexView, AttributeIndexWriter, AttributeSchema,
    CompoundSchema,
};
pub use bitmap::{RecordBitmap, RecordSet};
pub use chain::{
    ChainElementState, ChainIndex, ChainIndexView, ChainIndexWriter, ConsistencyReport,
    ConsistencyState, ElementState,
};
pub use comparator::{ComparatorSource, NullsOrder, OrderDirection, SortComparator, SortKey};
pub use config::IndexConfig;
pub use errors::{IndexError, IndexResult};
pub use filter::{FilterIndex, FilterIndexView, FilterIndexWriter};
pub use global_unique::{
    EntityReference, GlobalOwner, GlobalUniqueIndex, GlobalUniqueIndexView, GlobalUniqueIndexWriter,
};
pub use key::{AttributeKey, Predecessor, RecordId};
pub use range::{RangeIndex, RangeIndexView, RangeIndexWriter, RangePoint};
pub use sort::{ComparableSeeker, SortIndex, SortIndexView, SortIndexWriter};
pub use storage::{
    ChainPayload, FilterPayload, GlobalUniquePayload, Payload, RangePayload, SortPayload,
    StoragePart, UniquePayload,
};
pub use supplier::SortedRecordsSupplier;
pub use unique::{UniqueIndex, UniqueIndexView, UniqueIndexWriter};
pub use value::{canonical_locale, consolidate, AttributeValue, Decimal, Range, Value, ValueType};
