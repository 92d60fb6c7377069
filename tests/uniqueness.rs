//! Uniqueness Tests
//!
//! Tests for unique index invariants:
//! - A value has at most one owner at any time
//! - Violations and mismatched removals change nothing
//! - Catalog-wide uniqueness spans entity types and resolves owners back
//! - Storage parts restore the same ownership

use attrindex::index::{
    AttributeKey, AttributeValue, EntityReference, GlobalUniqueIndex, IndexError, Payload,
    RecordId, UniqueIndex, Value, ValueType,
};
use attrindex::transaction::{
    SequenceIdGenerator, Transaction, TransactionId, TransactionalLayerProducer,
};
use proptest::prelude::*;
use std::collections::BTreeMap;

// =============================================================================
// Helper Functions
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Register(i64, RecordId),
    Unregister(i64, RecordId),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..8i64, 1..5i32).prop_map(|(v, r)| Op::Register(v, r)),
        (0..8i64, 1..5i32).prop_map(|(v, r)| Op::Unregister(v, r)),
    ]
}

fn scalar(value: i64) -> AttributeValue {
    AttributeValue::Scalar(Value::Int(value))
}

// =============================================================================
// Property Tests
// =============================================================================

proptest! {
    /// Unique index ownership follows a simple map model.
    #[test]
    fn prop_unique_follows_model(ops in prop::collection::vec(op_strategy(), 0..80)) {
        let ids = SequenceIdGenerator::new();
        let mut index = UniqueIndex::new(&ids, AttributeKey::new("code"), ValueType::Int);
        let mut model: BTreeMap<i64, RecordId> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Register(value, record) => {
                    let result = index.write().register(&scalar(value), record);
                    match model.get(&value) {
                        Some(owner) if *owner != record => {
                            let is_violation = matches!(result, Err(IndexError::UniqueValueViolation { .. }));
                            prop_assert!(is_violation);
                        }
                        _ => {
                            prop_assert!(result.is_ok());
                            model.insert(value, record);
                        }
                    }
                }
                Op::Unregister(value, record) => {
                    let result = index.write().unregister(&scalar(value), record);
                    if model.get(&value) == Some(&record) {
                        prop_assert!(result.is_ok());
                        model.remove(&value);
                    } else {
                        let is_mismatch = matches!(result, Err(IndexError::OwnershipMismatch { .. }));
                        prop_assert!(is_mismatch);
                    }
                }
            }
        }

        let view = index.read(None);
        prop_assert_eq!(view.size(), model.len());
        for value in 0..8 {
            prop_assert_eq!(
                view.record_by_value(&Value::Int(value)).unwrap(),
                model.get(&value).copied()
            );
        }
    }
}

// =============================================================================
// Unique Index Tests
// =============================================================================

/// Array values are claimed all or nothing.
#[test]
fn test_array_claim_is_atomic() {
    let ids = SequenceIdGenerator::new();
    let mut index = UniqueIndex::new(&ids, AttributeKey::new("tags"), ValueType::String);
    index
        .write()
        .register(&AttributeValue::Scalar(Value::string("b")), 1)
        .unwrap();

    let both = AttributeValue::Array(vec![Value::string("a"), Value::string("b")]);
    let err = index.write().register(&both, 2).unwrap_err();
    assert_eq!(
        err.to_string(),
        "[IDX_UNIQUE_VALUE_VIOLATION] value `b` of attribute `tags` is already owned by 1, cannot assign it to 2"
    );
    assert_eq!(index.read(None).record_by_value(&Value::string("a")).unwrap(), None);
}

/// Normalized strings collide.
#[test]
fn test_normalized_values_collide() {
    let ids = SequenceIdGenerator::new();
    let mut index = UniqueIndex::new(&ids, AttributeKey::new("name"), ValueType::String);
    index
        .write()
        .register(&AttributeValue::Scalar(Value::string("caf\u{00e9}")), 1)
        .unwrap();
    assert!(index
        .write()
        .register(&AttributeValue::Scalar(Value::string("cafe\u{0301}")), 2)
        .is_err());
}

/// Two transactions claiming the same value see only their own claim.
#[test]
fn test_transactions_are_isolated() {
    let ids = SequenceIdGenerator::new();
    let index = UniqueIndex::new(&ids, AttributeKey::new("code"), ValueType::Int);
    let mut first = Transaction::new(TransactionId::new(1));
    let mut second = Transaction::new(TransactionId::new(2));

    index.write_in(&mut first).unwrap().register(&scalar(7), 1).unwrap();
    index.write_in(&mut second).unwrap().register(&scalar(7), 2).unwrap();

    assert_eq!(index.read(Some(&first)).record_by_value(&Value::Int(7)).unwrap(), Some(1));
    assert_eq!(index.read(Some(&second)).record_by_value(&Value::Int(7)).unwrap(), Some(2));
    assert_eq!(index.read(None).record_by_value(&Value::Int(7)).unwrap(), None);

    let committed = index.commit(&mut first).unwrap();
    assert_eq!(committed.read(None).record_by_value(&Value::Int(7)).unwrap(), Some(1));
    index.discard(&mut second);
    assert_eq!(second.layer_count(), 0);
}

// =============================================================================
// Global Unique Index Tests
// =============================================================================

/// Owners resolve back to entity type, record and locale.
#[test]
fn test_global_owner_resolution() {
    let ids = SequenceIdGenerator::new();
    let mut index = GlobalUniqueIndex::new(&ids, AttributeKey::new("url"), ValueType::String);
    index
        .write()
        .register(&AttributeValue::Scalar(Value::string("/home")), "Page", Some("en_us"), 5)
        .unwrap();
    index
        .write()
        .register(&AttributeValue::Scalar(Value::string("/shoe")), "Product", None, 5)
        .unwrap();

    let view = index.read(None);
    assert_eq!(
        view.entity_reference_by_value(&Value::string("/home")).unwrap(),
        Some(EntityReference {
            entity_type: "Page".to_string(),
            record: 5,
            locale: Some("en-US".to_string()),
        })
    );
    assert_eq!(
        view.entity_reference_by_value(&Value::string("/shoe"))
            .unwrap()
            .map(|r| r.entity_type),
        Some("Product".to_string())
    );
    assert_eq!(view.size(), 2);
}

/// The same record id of another entity type is a different owner.
#[test]
fn test_global_violation_across_entity_types() {
    let ids = SequenceIdGenerator::new();
    let mut index = GlobalUniqueIndex::new(&ids, AttributeKey::new("url"), ValueType::String);
    let value = AttributeValue::Scalar(Value::string("/a"));
    index.write().register(&value, "Page", None, 1).unwrap();

    let err = index.write().register(&value, "Product", None, 1).unwrap_err();
    assert_eq!(err.code(), "IDX_UNIQUE_VALUE_VIOLATION");
    assert!(err.to_string().contains("already owned by Page 1"));

    let err = index.write().unregister(&value, "Product", None, 1).unwrap_err();
    assert_eq!(err.code(), "IDX_OWNERSHIP_MISMATCH");

    let released = index.write().unregister(&value, "Page", None, 1).unwrap();
    assert_eq!(released.entity_type, "Page");
    assert!(index.read(None).is_empty());
}

/// A flushed global index restores with identical ownership.
#[test]
fn test_global_storage_part_restores() {
    let ids = SequenceIdGenerator::new();
    let mut index = GlobalUniqueIndex::new(&ids, AttributeKey::new("url"), ValueType::String);
    index
        .write()
        .register(&AttributeValue::Scalar(Value::string("/x")), "Page", Some("cs"), 3)
        .unwrap();

    let part = index.create_storage_part(0).unwrap();
    index.reset_dirty();
    assert!(index.create_storage_part(0).is_none());

    let restored = match part.payload {
        Payload::GlobalUnique(payload) => GlobalUniqueIndex::from_payload(&ids, part.attribute, payload),
        other => panic!("unexpected payload {}", other.kind()),
    };
    assert_eq!(
        restored
            .read(None)
            .entity_reference_by_value(&Value::string("/x"))
            .unwrap()
            .map(|r| (r.entity_type, r.record, r.locale)),
        Some(("Page".to_string(), 3, Some("cs".to_string())))
    );
}
