//! Key Hashing Module
//!
//! Turns caller-supplied lookup objects into index values with
//! deep-equality semantics.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::storage::KeyFields;

/// Deterministic structural hash of a JSON value.
///
/// Object key order does not matter; array order does.
pub fn structural_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    feed(&mut hasher, value);
    hex::encode(hasher.finalize())
}

fn feed(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update(b"n"),
        Value::Bool(b) => hasher.update(if *b { b"t" } else { b"f" }),
        Value::Number(n) => {
            hasher.update(b"#");
            hasher.update(n.to_string().as_bytes());
            hasher.update(b";");
        }
        Value::String(s) => {
            hasher.update(b"s");
            hasher.update((s.len() as u64).to_le_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                feed(hasher, item);
            }
            hasher.update(b"]");
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                hasher.update((key.len() as u64).to_le_bytes());
                hasher.update(key.as_bytes());
                feed(hasher, &map[key]);
            }
            hasher.update(b"}");
        }
    }
}

/// Hashes the object-valued properties of a lookup object.
///
/// Objects and arrays become their structural hash, scalars pass through,
/// `null` properties are dropped.
pub fn hash_key_fields(fields: &Map<String, Value>) -> KeyFields {
    fields
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let hashed = match v {
                Value::Object(_) | Value::Array(_) => Value::String(structural_hash(v)),
                scalar => scalar.clone(),
            };
            (k.clone(), hashed)
        })
        .collect()
}
