//! Lookup queries for the cache engine.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::cache::CacheEntry;

/// Predicate applied to entries after the key match.
pub type EntryFilter = Arc<dyn Fn(&CacheEntry) -> bool + Send + Sync>;

/// Sort key for multi-entry results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderBy {
    Timestamp,
    /// A key field of the table
    Field(String),
}

// == Find Query ==
/// Which entries a `find`, `find_many` or `delete` touches.
///
/// `fields` are given pre-hash, the same way keys are passed to `save`.
#[derive(Clone, Default)]
pub struct FindQuery {
    pub fields: Map<String, Value>,
    pub filter: Option<EntryFilter>,
    pub order_by: Option<OrderBy>,
    pub reverse: bool,
    pub limit: Option<usize>,
    pub include_expired: bool,
}

impl fmt::Debug for FindQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FindQuery")
            .field("fields", &self.fields)
            .field("filter", &self.filter.as_ref().map(|_| "<fn>"))
            .field("order_by", &self.order_by)
            .field("reverse", &self.reverse)
            .field("limit", &self.limit)
            .field("include_expired", &self.include_expired)
            .finish()
    }
}

impl FindQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Query matching a lookup object, e.g. `{ "params": {...} }`.
    pub fn matching(fields: Map<String, Value>) -> Self {
        Self {
            fields,
            ..Self::default()
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CacheEntry) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(predicate));
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by = Some(order);
        self
    }

    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn include_expired(mut self) -> Self {
        self.include_expired = true;
        self
    }

    /// Applies expiry, predicate, ordering and limit to key-matched entries.
    pub(crate) fn refine(&self, entries: Vec<CacheEntry>, ttl: Option<Duration>) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = entries
            .into_iter()
            .filter(|e| self.include_expired || !e.is_expired(ttl))
            .filter(|e| self.filter.as_ref().map_or(true, |f| f(e)))
            .collect();

        match &self.order_by {
            Some(OrderBy::Timestamp) => entries.sort_by_key(|e| e.timestamp),
            Some(OrderBy::Field(name)) => {
                entries.sort_by(|a, b| compare_values(a.key.get(name), b.key.get(name)))
            }
            None => {}
        }
        if self.reverse {
            entries.reverse();
        }
        if let Some(limit) = self.limit {
            entries.truncate(limit);
        }
        entries
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
