//! Identities of transactions and transactional structures
//!
//! - A structure id is allocated once and kept by every committed copy
//! - Layers inside a transaction are keyed by structure id

use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of a transactional structure.
///
/// Copies produced by a commit keep the id of the structure they were
/// merged from, so a layer created against one generation can be found
/// again for the next.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StructureId(u64);

impl StructureId {
    #[inline]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for StructureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a transaction
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TransactionId(u64);

impl TransactionId {
    #[inline]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Source of fresh structure ids
pub trait IdGenerator: Send + Sync {
    /// Allocate an id never returned before by this generator
    fn next_id(&self) -> StructureId;
}

/// Monotonic id generator
#[derive(Debug)]
pub struct SequenceIdGenerator {
    next: AtomicU64,
}

impl SequenceIdGenerator {
    /// Generator starting at 1
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Generator starting at `first`; used when restoring persisted structures
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }
}

impl Default for SequenceIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for SequenceIdGenerator {
    fn next_id(&self) -> StructureId {
        StructureId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}
