//! Payload helpers
//!
//! Upstream responses are kept as `serde_json::Value`; these functions
//! implement the few structural operations the orchestrator needs.

use serde_json::{Map, Value};

use crate::models::requests::PayloadFilter;

/// Response field carrying the continuation token (canonical case).
pub const NEXT_TOKEN_FIELD: &str = "nextToken";

/// Request parameter the continuation token is sent as.
pub const NEXT_PARAM: &str = "next";

/// Whether the payload is an `{ "error": ... }` marker.
pub fn is_error(payload: &Value) -> bool {
    payload
        .as_object()
        .map(|obj| obj.contains_key("error"))
        .unwrap_or(false)
}

/// Number of results in a payload.
///
/// The array length for arrays, or the longest top-level array field for objects.
pub fn result_count(payload: &Value) -> usize {
    match payload {
        Value::Array(items) => items.len(),
        Value::Object(obj) => obj
            .values()
            .filter_map(Value::as_array)
            .map(Vec::len)
            .max()
            .unwrap_or(0),
        _ => 0,
    }
}

/// Removes and returns a non-empty continuation token.
pub fn take_next_token(payload: &mut Value) -> Option<String> {
    let token = payload.as_object_mut()?.remove(NEXT_TOKEN_FIELD)?;
    match token {
        Value::String(s) if !s.is_empty() => Some(s),
        _ => None,
    }
}

pub fn has_next_token(payload: &Value) -> bool {
    matches!(payload.get(NEXT_TOKEN_FIELD), Some(Value::String(s)) if !s.is_empty())
}

/// Appends `page` onto `acc`.
///
/// Array fields are concatenated in page order. Other fields keep the
/// first page's value, except the continuation token which tracks the
/// latest page.
pub fn merge_page(acc: &mut Value, page: Value) {
    match (acc, page) {
        (Value::Array(items), Value::Array(more)) => items.extend(more),
        (Value::Object(acc), Value::Object(page)) => merge_objects(acc, page),
        (acc, page) => *acc = page,
    }
}

fn merge_objects(acc: &mut Map<String, Value>, page: Map<String, Value>) {
    acc.remove(NEXT_TOKEN_FIELD);
    for (field, value) in page {
        if field == NEXT_TOKEN_FIELD {
            acc.insert(field, value);
            continue;
        }
        if let Some(Value::Array(existing)) = acc.get_mut(&field) {
            if let Value::Array(more) = value {
                existing.extend(more);
            }
            continue;
        }
        acc.entry(field).or_insert(value);
    }
}

/// Keeps only items accepted by `filter`.
///
/// Filters the payload itself if it is an array, otherwise each top-level
/// array field.
pub fn apply_filter(payload: &mut Value, filter: &PayloadFilter) {
    match payload {
        Value::Array(items) => items.retain(|item| filter(item)),
        Value::Object(obj) => {
            for value in obj.values_mut() {
                if let Value::Array(items) = value {
                    items.retain(|item| filter(item));
                }
            }
        }
        _ => {}
    }
}
