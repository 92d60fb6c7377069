//! Attribute Index Tests
//!
//! Tests for the attribute index as a whole:
//! - Writes route to the child index of the attribute kind and locale
//! - Transactions commit every touched child at once, or none on rollback
//! - Dirty children flush to storage parts that restore the same state
//! - Configuration loads from disk and drives chain verification

use std::sync::Arc;

use attrindex::index::{
    AttributeIndex, AttributeKey, AttributeSchema, AttributeValue, ComparatorSource,
    CompoundSchema, IndexConfig, Predecessor, StoragePart, Value, ValueType,
};
use attrindex::transaction::{
    SequenceIdGenerator, Transaction, TransactionId, TransactionalLayerProducer,
};

// =============================================================================
// Helper Functions
// =============================================================================

fn new_index(config: IndexConfig) -> AttributeIndex {
    AttributeIndex::new(Arc::new(SequenceIdGenerator::new()), config)
}

fn s(value: &str) -> AttributeValue {
    AttributeValue::Scalar(Value::string(value))
}

fn code() -> AttributeSchema {
    AttributeSchema::new("code", ValueType::String)
}

fn name() -> AttributeSchema {
    AttributeSchema::localized("name", ValueType::String)
}

fn order() -> AttributeSchema {
    AttributeSchema::new("order", ValueType::Int)
}

/// Product catalog with codes, localized names, priorities and a manual order
fn catalog(index: &mut AttributeIndex) {
    let priority = CompoundSchema::new(
        "priority",
        vec![
            ComparatorSource::descending(ValueType::Int),
            ComparatorSource::ascending(ValueType::String),
        ],
    );
    let rows = [(1, "A-1", "Apple", 3), (2, "B-2", "Banana", 1), (3, "C-3", "Cherry", 3)];
    let mut writer = index.write();
    for (record, code_value, name_value, rank) in rows {
        writer.insert_unique(&code(), None, &s(code_value), record).unwrap();
        writer.insert_filter(&code(), None, &s(code_value), record).unwrap();
        writer.insert_filter(&name(), Some("en"), &s(name_value), record).unwrap();
        writer
            .insert_compound_sort(
                &priority,
                None,
                &[Some(Value::Int(rank)), Some(Value::string(name_value))],
                record,
            )
            .unwrap();
    }
    writer.insert_chain(&order(), None, Predecessor::Head, 2).unwrap();
    writer.insert_chain(&order(), None, Predecessor::Of(2), 3).unwrap();
    writer.insert_chain(&order(), None, Predecessor::Of(3), 1).unwrap();
}

// =============================================================================
// Routing Tests
// =============================================================================

/// Each kind of write lands in its own child index.
#[test]
fn test_catalog_routing() {
    let mut index = new_index(IndexConfig::default());
    catalog(&mut index);

    let view = index.read(None);
    assert_eq!(view.unique_keys(), vec![AttributeKey::new("code")]);
    assert_eq!(
        view.filter_keys(),
        vec![AttributeKey::new("code"), AttributeKey::localized("name", "en")]
    );
    assert_eq!(view.sort_keys(), vec![AttributeKey::new("priority")]);
    assert_eq!(view.chain_keys(), vec![AttributeKey::new("order")]);

    assert_eq!(view.sort_index("priority", None).unwrap().sorted_records(), vec![1, 3, 2]);
    assert_eq!(view.chain_index("order", None).unwrap().resolve(), vec![2, 3, 1]);
    assert_eq!(
        view.filter_index("name", Some("en"))
            .unwrap()
            .records_starting_with("B")
            .unwrap()
            .to_vec(),
        vec![2]
    );
    assert!(view.filter_index("name", Some("de")).is_none());
}

/// Removing the last value of an attribute drops its child index.
#[test]
fn test_empty_children_disappear() {
    let mut index = new_index(IndexConfig::default());
    catalog(&mut index);
    {
        let mut writer = index.write();
        for record in [2, 3, 1] {
            writer.remove_chain(&order(), None, record).unwrap();
        }
    }
    assert!(index.read(None).chain_keys().is_empty());
    assert!(index.read(None).chain_index("order", None).is_none());
}

// =============================================================================
// Transaction Tests
// =============================================================================

/// A transaction spanning several children commits them together.
#[test]
fn test_multi_child_transaction() {
    let mut index = new_index(IndexConfig::default());
    catalog(&mut index);

    let mut tx = Transaction::new(TransactionId::new(9));
    {
        let mut writer = index.write_in(&mut tx);
        writer.remove_unique(&code(), None, &s("A-1"), 1).unwrap();
        writer.insert_unique(&code(), None, &s("A-1"), 4).unwrap();
        writer.insert_chain(&order(), None, Predecessor::Of(1), 4).unwrap();
        writer.insert_sort(&AttributeSchema::new("price", ValueType::Int), None, &Value::Int(5), 4).unwrap();
    }

    let base = index.read(None);
    assert_eq!(
        base.unique_index("code", None).unwrap().record_by_value(&Value::string("A-1")).unwrap(),
        Some(1)
    );
    assert!(base.sort_index("price", None).is_none());

    let committed = index.commit(&mut tx).unwrap();
    assert_eq!(tx.layer_count(), 0);
    let view = committed.read(None);
    assert_eq!(
        view.unique_index("code", None).unwrap().record_by_value(&Value::string("A-1")).unwrap(),
        Some(4)
    );
    assert_eq!(view.chain_index("order", None).unwrap().resolve(), vec![2, 3, 1, 4]);
    assert_eq!(view.sort_index("price", None).unwrap().sorted_records(), vec![4]);
}

/// Rollback leaves the committed index and the transaction empty.
#[test]
fn test_rollback_restores_nothing_new() {
    let mut index = new_index(IndexConfig::default());
    catalog(&mut index);

    let mut tx = Transaction::new(TransactionId::new(3));
    index
        .write_in(&mut tx)
        .insert_filter(&name(), Some("cs"), &s("Jablko"), 1)
        .unwrap();
    assert!(index.read(Some(&tx)).filter_index("name", Some("cs")).is_some());

    index.discard(&mut tx);
    assert_eq!(tx.layer_count(), 0);
    assert!(index.read(Some(&tx)).filter_index("name", Some("cs")).is_none());
    assert_eq!(index.metrics().snapshot().rollbacks, 1);
}

// =============================================================================
// Storage Tests
// =============================================================================

/// Storage parts survive JSON and restore the same catalog.
#[test]
fn test_storage_parts_restore_catalog() {
    let mut index = new_index(IndexConfig::default());
    catalog(&mut index);

    let parts = index.modified_storage_parts(11);
    assert_eq!(parts.len(), 5);
    let kinds: Vec<&str> = parts.iter().map(StoragePart::kind).collect();
    assert_eq!(kinds, vec!["unique", "filter", "filter", "sort", "chain"]);

    let reloaded: Vec<StoragePart> = parts
        .iter()
        .map(|part| StoragePart::from_json(&part.to_json().unwrap()).unwrap())
        .collect();
    for (before, after) in parts.iter().zip(&reloaded) {
        assert_eq!(before.checksum().unwrap(), after.checksum().unwrap());
    }

    let restored = AttributeIndex::from_storage_parts(
        Arc::new(SequenceIdGenerator::starting_at(1000)),
        IndexConfig::default(),
        reloaded,
    )
    .unwrap();
    let view = restored.read(None);
    assert_eq!(view.sort_index("priority", None).unwrap().sorted_records(), vec![1, 3, 2]);
    assert_eq!(view.chain_index("order", None).unwrap().resolve(), vec![2, 3, 1]);
    assert_eq!(
        view.unique_index("code", None).unwrap().record_by_value(&Value::string("C-3")).unwrap(),
        Some(3)
    );

    index.reset_dirty();
    assert!(index.modified_storage_parts(11).is_empty());
}

/// Only children touched since the last flush are exported again.
#[test]
fn test_only_touched_children_flush() {
    let mut index = new_index(IndexConfig::default());
    catalog(&mut index);
    index.reset_dirty();

    index.write().insert_chain(&order(), None, Predecessor::Of(1), 7).unwrap();
    let parts = index.modified_storage_parts(0);
    assert_eq!(parts.len(), 1);
    assert_eq!(parts[0].attribute, AttributeKey::new("order"));
}

// =============================================================================
// Configuration Tests
// =============================================================================

/// Configuration files fill missing fields with defaults.
#[test]
fn test_config_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.json");
    std::fs::write(&path, r#"{ "allowed_locales": ["en", "cs_CZ"], "log_level": "warn" }"#).unwrap();

    let config = IndexConfig::load(&path).unwrap();
    assert!(config.memoize_resolved_order);
    assert!(!config.verify_chains_on_commit);
    assert_eq!(config.canonical_locales(), vec!["cs-CZ".to_string(), "en".to_string()]);

    let mut index = new_index(config);
    index.write().insert_filter(&name(), Some("cs-cz"), &s("Jablko"), 1).unwrap();
    let err = index.write().insert_filter(&name(), Some("de"), &s("Apfel"), 1).unwrap_err();
    assert_eq!(err.code(), "IDX_INVALID_USAGE");
}

/// Broken or invalid configuration files are rejected.
#[test]
fn test_invalid_config_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.json");

    std::fs::write(&path, "{ not json").unwrap();
    assert_eq!(IndexConfig::load(&path).unwrap_err().code(), "IDX_CONFIG_INVALID");

    std::fs::write(&path, r#"{ "log_level": "chatty" }"#).unwrap();
    assert_eq!(IndexConfig::load(&path).unwrap_err().code(), "IDX_CONFIG_INVALID");

    assert!(IndexConfig::load(&dir.path().join("missing.json")).is_err());
}

/// Verified commits count chains left in several fragments.
#[test]
fn test_verified_commit_reports_fragments() {
    let index = new_index(IndexConfig::verifying());
    let mut tx = Transaction::new(TransactionId::new(1));
    {
        let mut writer = index.write_in(&mut tx);
        writer.insert_chain(&order(), None, Predecessor::Head, 1).unwrap();
        writer.insert_chain(&order(), None, Predecessor::Of(40), 2).unwrap();
    }
    let committed = index.commit(&mut tx).unwrap();
    assert_eq!(committed.metrics().snapshot().inconsistent_chains, 1);
    assert_eq!(committed.read(None).chain_index("order", None).unwrap().resolve(), vec![1, 2]);
}
