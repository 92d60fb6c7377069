//! Persisted snapshots of index structures
//!
//! A structure emits a storage part only while it is dirty; the caller
//! flushes the part and then resets the dirty flag. The binary layout on
//! disk is the caller's concern, parts are plain serde values.

use serde::{Deserialize, Serialize};

use super::bitmap::RecordBitmap;
use super::chain::ChainElementState;
use super::comparator::{ComparatorSource, SortKey};
use super::errors::{IndexError, IndexResult};
use super::global_unique::GlobalOwner;
use super::key::{AttributeKey, RecordId};
use super::range::RangePoint;
use super::value::{Value, ValueType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniquePayload {
    pub value_type: ValueType,
    pub owners: Vec<(Value, RecordId)>,
    pub records: RecordBitmap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangePayload {
    pub points: Vec<(i64, RangePoint)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterPayload {
    pub value_type: ValueType,
    pub histogram: Vec<(Value, RecordBitmap)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<RangePayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortPayload {
    pub comparators: Vec<ComparatorSource>,
    pub records: Vec<RecordId>,
    pub values: Vec<SortKey>,
    pub cardinalities: Vec<(SortKey, u32)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainPayload {
    pub elements: Vec<(RecordId, ChainElementState)>,
    pub fragments: Vec<(RecordId, Vec<RecordId>)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalUniquePayload {
    pub value_type: ValueType,
    pub owners: Vec<(Value, GlobalOwner)>,
    pub entity_types: Vec<String>,
    pub locales: Vec<String>,
}

/// Content of a storage part, one variant per index flavor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Unique(UniquePayload),
    GlobalUnique(GlobalUniquePayload),
    Filter(FilterPayload),
    Sort(SortPayload),
    Chain(ChainPayload),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Unique(_) => "unique",
            Payload::GlobalUnique(_) => "global_unique",
            Payload::Filter(_) => "filter",
            Payload::Sort(_) => "sort",
            Payload::Chain(_) => "chain",
        }
    }
}

/// Snapshot of one index structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoragePart {
    /// Key of the owning container (entity index)
    pub container: u32,
    pub attribute: AttributeKey,
    pub payload: Payload,
}

impl StoragePart {
    pub fn new(container: u32, attribute: AttributeKey, payload: Payload) -> Self {
        Self {
            container,
            attribute,
            payload,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    pub fn to_json(&self) -> IndexResult<String> {
        serde_json::to_string(self)
            .map_err(|e| IndexError::internal(format!("storage part is not serializable: {}", e)))
    }

    pub fn from_json(json: &str) -> IndexResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| IndexError::invalid_usage(format!("malformed storage part: {}", e)))
    }

    /// CRC32 of the serialized part
    pub fn checksum(&self) -> IndexResult<u32> {
        Ok(crc32fast::hash(self.to_json()?.as_bytes()))
    }
}
