//! Property-Based Tests for Cache Module
//!
//! Uses proptest to verify the key hashing and storage properties of the engine.

use proptest::prelude::*;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::cache::{hash_key_fields, structural_hash, CacheEngine, FindQuery};
use crate::config::CacheConfig;
use crate::storage::MemoryBackend;

// == Strategies ==
/// Generates scalar JSON values
fn leaf_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(|n| json!(n)),
        "[a-zA-Z0-9_]{0,16}".prop_map(Value::String),
    ]
}

/// Generates nested JSON values, as found in query parameters
fn value_strategy() -> impl Strategy<Value = Value> {
    leaf_strategy().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

/// Generates parameter objects
fn params_strategy() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map("[a-z]{1,8}", value_strategy(), 0..6)
        .prop_map(|m| m.into_iter().collect())
}

fn lookup(params: Map<String, Value>) -> Map<String, Value> {
    let mut key = Map::new();
    key.insert("params".to_string(), Value::Object(params));
    key
}

/// Rebuilds an object inserting keys in reverse order
fn reinserted(params: &Map<String, Value>) -> Map<String, Value> {
    let mut copy = Map::new();
    for (k, v) in params.iter().rev() {
        copy.insert(k.clone(), v.clone());
    }
    copy
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    // *For any* two structurally equal objects, the structural hashes are equal.
    #[test]
    fn prop_hash_ignores_identity(params in params_strategy()) {
        let a = Value::Object(params.clone());
        let b = Value::Object(reinserted(&params));
        prop_assert_eq!(structural_hash(&a), structural_hash(&b));
    }

    // *For any* two different objects, the structural hashes differ.
    #[test]
    fn prop_hash_separates_different_values(a in value_strategy(), b in value_strategy()) {
        prop_assume!(a != b);
        prop_assert_ne!(structural_hash(&a), structural_hash(&b));
    }

    // *For any* lookup object, hashing keeps exactly the non-null properties.
    #[test]
    fn prop_hashed_fields_drop_nulls(params in params_strategy(), extra in "[A-Z]{1,4}") {
        let mut with_null = params.clone();
        with_null.insert(extra, Value::Null);

        let hashed = hash_key_fields(&with_null);
        prop_assert_eq!(hashed, hash_key_fields(&params));
    }

    // *For any* structurally equal keys K1 and K2, save(K1) then find(K2)
    // returns the saved payload.
    #[test]
    fn prop_roundtrip_through_equal_keys(params in params_strategy(), data in value_strategy()) {
        let found = tokio_test::block_on(async {
            let engine = CacheEngine::new(Arc::new(MemoryBackend::new()), &CacheConfig::default()).unwrap();
            engine.open().await.unwrap();
            engine.save("transactions", data.clone(), lookup(params.clone())).await.unwrap();
            engine.find("transactions", FindQuery::matching(lookup(reinserted(&params)))).await
        });

        prop_assert_eq!(found.map(|e| e.data), Some(data));
    }

    // *For any* sequence of saves to one key submitted before the engine is
    // ready, the last submitted payload wins.
    #[test]
    fn prop_queued_saves_apply_in_order(values in prop::collection::vec(value_strategy(), 1..8)) {
        let found = tokio_test::block_on(async {
            let engine = CacheEngine::new(Arc::new(MemoryBackend::new()), &CacheConfig::default()).unwrap();
            let mut handles = Vec::new();
            for value in values.clone() {
                let engine = engine.clone();
                handles.push(tokio::spawn(async move {
                    engine.save("block", value, lookup(Map::new())).await
                }));
                // Let the spawned save reach the queue before the next one.
                tokio::task::yield_now().await;
            }
            engine.open().await.unwrap();
            for handle in handles {
                handle.await.unwrap().unwrap();
            }
            engine.find("block", FindQuery::matching(lookup(Map::new()))).await
        });

        prop_assert_eq!(found.map(|e| e.data), values.last().cloned());
    }

    // *For any* saved entry, delete removes it and reports one deletion.
    #[test]
    fn prop_delete_removes_entry(params in params_strategy(), data in value_strategy()) {
        let (deleted, found) = tokio_test::block_on(async {
            let engine = CacheEngine::new(Arc::new(MemoryBackend::new()), &CacheConfig::default()).unwrap();
            engine.open().await.unwrap();
            engine.save("asset", data, lookup(params.clone())).await.unwrap();
            let deleted = engine.delete("asset", FindQuery::matching(lookup(params.clone()))).await.unwrap();
            let found = engine.find("asset", FindQuery::matching(lookup(params))).await;
            (deleted, found)
        });

        prop_assert_eq!(deleted, 1);
        prop_assert!(found.is_none());
    }
}
