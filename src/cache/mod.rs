//! Cache Module
//!
//! Client-side cache with per-table TTL expiration, layered over an
//! asynchronously opened storage backend.

mod engine;
mod entry;
mod find;
mod key;
mod queue;
mod schema;
mod stats;

#[cfg(test)]
mod property_tests;

// Re-export public types
pub use engine::{CacheEngine, Readiness};
pub use entry::{current_timestamp_ms, CacheEntry};
pub use find::{EntryFilter, FindQuery, OrderBy};
pub use key::{hash_key_fields, structural_hash};
pub use schema::{parse_index, TableDef, TableRegistry, BUILTIN_TABLES, PARAMS_FIELD, STATE_TABLE};
pub use stats::CacheStats;
