//! Property-based test generators using proptest.
//!
//! Provides strategies for generating operations and entity snapshots that
//! satisfy the queue's validation rules.

use proptest::prelude::*;
use resync_protocol::{OperationPriority, OperationType, Record, SyncOperation};
use serde_json::{Map, Value};

/// Strategy for generating priorities.
pub fn priority_strategy() -> impl Strategy<Value = OperationPriority> {
    prop::sample::select(OperationPriority::ALL.to_vec())
}

/// Strategy for generating valid collection names.
pub fn collection_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for generating field names.
pub fn field_name_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("title".to_string()),
        Just("status".to_string()),
        Just("count".to_string()),
        Just("successRate".to_string()),
        Just("isActive".to_string()),
        Just("tags".to_string()),
        Just("updatedAt".to_string()),
        Just("settings".to_string()),
        prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex"),
    ]
}

/// Strategy for generating JSON leaves.
pub fn leaf_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        (-1000i64..1000).prop_map(Value::from),
        (0.0f64..1.0).prop_map(Value::from),
        prop::string::string_regex("[a-z ]{0,12}")
            .expect("Invalid regex")
            .prop_map(Value::String),
        (1_600_000_000i64..1_800_000_000)
            .prop_map(|secs| Value::String(rfc3339(secs))),
    ]
}

fn rfc3339(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// Strategy for generating JSON values up to two levels deep.
pub fn json_value_strategy() -> impl Strategy<Value = Value> {
    leaf_value_strategy().prop_recursive(2, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,4}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect::<Map<_, _>>())),
        ]
    })
}

/// Strategy for generating entity snapshots.
pub fn record_strategy() -> impl Strategy<Value = Record> {
    prop::collection::btree_map(field_name_strategy(), json_value_strategy(), 0..6)
        .prop_map(|m| m.into_iter().collect())
}

/// Strategy for generating a snapshot and a perturbed copy of it.
pub fn record_pair_strategy() -> impl Strategy<Value = (Record, Record)> {
    (record_strategy(), record_strategy()).prop_map(|(base, changes)| {
        let mut remote = base.clone();
        for (key, value) in changes {
            remote.insert(key, value);
        }
        (base, remote)
    })
}

/// Strategy for generating valid operations.
pub fn operation_strategy() -> impl Strategy<Value = SyncOperation> {
    (
        collection_name_strategy(),
        priority_strategy(),
        prop::sample::select(vec![
            OperationType::Create,
            OperationType::Update,
            OperationType::Delete,
        ]),
        "[a-z0-9]{1,8}",
    )
        .prop_map(|(collection, priority, op_type, entity_id)| {
            let mut payload = Record::new();
            payload.insert("id".into(), Value::String(entity_id));
            SyncOperation::new(collection, op_type, payload).with_priority(priority)
        })
}

/// Strategy for generating batches of operations.
pub fn operation_batch_strategy(max: usize) -> impl Strategy<Value = Vec<SyncOperation>> {
    prop::collection::vec(operation_strategy(), 0..max)
}
