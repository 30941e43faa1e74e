//! Cache Entry Module
//!
//! Defines the structure for individual cache entries with TTL support.

use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use crate::storage::{CacheRow, KeyFields};

// == Cache Entry ==
/// Represents a single cache entry with payload and metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Hashed key fields the entry is stored under
    pub key: KeyFields,
    /// The stored payload
    pub data: Value,
    /// Write timestamp (Unix milliseconds)
    pub timestamp: i64,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates a new entry stamped with the current time.
    pub fn new(key: KeyFields, data: Value) -> Self {
        Self::at(key, data, current_timestamp_ms())
    }

    /// Creates an entry with an explicit timestamp.
    pub fn at(key: KeyFields, data: Value, timestamp: i64) -> Self {
        Self {
            key,
            data,
            timestamp,
        }
    }

    // == Age ==
    /// Milliseconds elapsed since the entry was written.
    pub fn age_ms(&self) -> i64 {
        (current_timestamp_ms() - self.timestamp).max(0)
    }

    // == Is Expired ==
    /// Checks if the entry has outlived `ttl`.
    ///
    /// An entry is expired once its age is greater than or equal to the TTL.
    /// `None` means the table never expires.
    pub fn is_expired(&self, ttl: Option<Duration>) -> bool {
        match ttl {
            Some(ttl) => self.age_ms() >= ttl.as_millis() as i64,
            None => false,
        }
    }

    // == Time To Live ==
    /// Returns remaining TTL in milliseconds, or None if the table never expires.
    ///
    /// # Returns
    /// - `Some(0)` if the entry has expired
    /// - `Some(remaining_ms)` if the TTL hasn't elapsed
    /// - `None` if there is no expiration
    pub fn ttl_remaining_ms(&self, ttl: Option<Duration>) -> Option<i64> {
        ttl.map(|ttl| (ttl.as_millis() as i64 - self.age_ms()).max(0))
    }
}

impl From<CacheRow> for CacheEntry {
    fn from(row: CacheRow) -> Self {
        Self {
            key: row.key,
            data: row.data,
            timestamp: row.timestamp,
        }
    }
}

impl From<CacheEntry> for CacheRow {
    fn from(entry: CacheEntry) -> Self {
        Self {
            key: entry.key,
            data: entry.data,
            timestamp: entry.timestamp,
        }
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> i64 {
    Utc::now().timestamp_millis()
}
