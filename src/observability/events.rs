//! Observable events of the index subsystem
//!
//! Events are explicit and typed; each maps to a stable upper-case name.

use std::fmt;

/// Observable events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    // Transactional layers
    /// First write of a transaction allocated a layer for a structure
    LayerCreated,
    /// Layer merged into a new committed structure
    LayerCommitted,
    /// Layer thrown away on rollback
    LayerDiscarded,
    /// Layer registered under a structure holds a foreign layer type (FATAL)
    LayerRejected,

    // Persistence
    /// Dirty structures exported as storage parts
    StoragePartsExported,
    /// Structure restored from a storage part
    StoragePartRestored,

    // Data conflicts
    /// Unique value already owned by another record
    UniqueViolation,

    // Chain ordering
    /// Chain index holds more than one fragment after commit
    ChainInconsistent,
    /// Chain index failed its structural verification (FATAL)
    ChainBroken,

    // Configuration
    /// Index configuration loaded
    ConfigLoaded,

    // Replay tool
    /// Mutation script replay begins
    ReplayBegin,
    /// Mutation script replay complete
    ReplayComplete,
}

impl Event {
    /// Returns the string representation of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::LayerCreated => "LAYER_CREATED",
            Event::LayerCommitted => "LAYER_COMMITTED",
            Event::LayerDiscarded => "LAYER_DISCARDED",
            Event::LayerRejected => "LAYER_REJECTED",

            Event::StoragePartsExported => "STORAGE_PARTS_EXPORTED",
            Event::StoragePartRestored => "STORAGE_PART_RESTORED",

            Event::UniqueViolation => "UNIQUE_VALUE_VIOLATION",

            Event::ChainInconsistent => "CHAIN_INCONSISTENT",
            Event::ChainBroken => "CHAIN_BROKEN",

            Event::ConfigLoaded => "CONFIG_LOADED",

            Event::ReplayBegin => "REPLAY_BEGIN",
            Event::ReplayComplete => "REPLAY_COMPLETE",
        }
    }

    /// Returns true if this event indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(self, Event::ChainBroken | Event::LayerRejected)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_events_have_string_representation() {
        let events = [
            Event::LayerCreated,
            Event::LayerCommitted,
            Event::LayerDiscarded,
            Event::LayerRejected,
            Event::StoragePartsExported,
            Event::StoragePartRestored,
            Event::UniqueViolation,
            Event::ChainInconsistent,
            Event::ChainBroken,
            Event::ConfigLoaded,
            Event::ReplayBegin,
            Event::ReplayComplete,
        ];

        for event in events {
            let s = event.as_str();
            assert!(!s.is_empty());
            assert!(s.chars().all(|c| c.is_uppercase() || c == '_'));
        }
    }

    #[test]
    fn test_fatal_events() {
        assert!(Event::ChainBroken.is_fatal());
        assert!(Event::LayerRejected.is_fatal());
        assert!(!Event::ChainInconsistent.is_fatal());
        assert!(!Event::LayerCommitted.is_fatal());
    }

    #[test]
    fn test_event_display() {
        assert_eq!(format!("{}", Event::LayerDiscarded), "LAYER_DISCARDED");
    }
}
