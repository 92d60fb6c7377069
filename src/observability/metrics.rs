//! Metrics registry for the index subsystem
//!
//! - Counters only
//! - Monotonic increase
//! - Thread-safe but lock-free

use std::sync::atomic::{AtomicU64, Ordering};

/// Operational counters shared by an attribute index and its committed copies
///
/// All counters use Relaxed ordering; exact cross-counter consistency is not
/// required.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    /// Layers allocated by first transactional writes
    layers_created: AtomicU64,
    /// Layers merged by commit
    commits: AtomicU64,
    /// Layers discarded by rollback
    rollbacks: AtomicU64,
    /// Storage parts emitted for dirty structures
    storage_parts_exported: AtomicU64,
    /// Rejected unique value registrations
    unique_violations: AtomicU64,
    /// Commits that left a chain index with more than one fragment
    inconsistent_chains: AtomicU64,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment layers created
    pub fn increment_layers_created(&self) {
        self.layers_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment commits
    pub fn increment_commits(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment rollbacks
    pub fn increment_rollbacks(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Add exported storage parts
    pub fn add_storage_parts_exported(&self, count: u64) {
        self.storage_parts_exported.fetch_add(count, Ordering::Relaxed);
    }

    /// Increment unique violations
    pub fn increment_unique_violations(&self) {
        self.unique_violations.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment inconsistent chains observed at commit
    pub fn increment_inconsistent_chains(&self) {
        self.inconsistent_chains.fetch_add(1, Ordering::Relaxed);
    }

    /// Get all metrics as JSON
    pub fn to_json(&self) -> String {
        let snapshot = self.snapshot();
        format!(
            r#"{{"layers_created":{},"commits":{},"rollbacks":{},"storage_parts_exported":{},"unique_violations":{},"inconsistent_chains":{}}}"#,
            snapshot.layers_created,
            snapshot.commits,
            snapshot.rollbacks,
            snapshot.storage_parts_exported,
            snapshot.unique_violations,
            snapshot.inconsistent_chains,
        )
    }

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            layers_created: self.layers_created.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            storage_parts_exported: self.storage_parts_exported.load(Ordering::Relaxed),
            unique_violations: self.unique_violations.load(Ordering::Relaxed),
            inconsistent_chains: self.inconsistent_chains.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub layers_created: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub storage_parts_exported: u64,
    pub unique_violations: u64,
    pub inconsistent_chains: u64,
}
