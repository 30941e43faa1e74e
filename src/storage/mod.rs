//! Storage Module
//!
//! The persistent key-value capability the cache engine is layered on:
//! versioned, table-based, opened asynchronously, accessed through scoped
//! read or read-write transactions.

mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StorageResult;

pub use memory::MemoryBackend;

/// Key fields of a row, already hashed by the cache engine.
pub type KeyFields = BTreeMap<String, Value>;

// == Rows and Schemas ==
/// A persisted row: `{ keyFields..., data, timestamp }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRow {
    /// Hashed key fields
    pub key: KeyFields,
    /// Stored payload
    pub data: Value,
    /// Write time (Unix milliseconds)
    pub timestamp: i64,
}

/// A named table and the fields forming its lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub key_fields: Vec<String>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, key_fields: &[&str]) -> Self {
        Self {
            name: name.into(),
            key_fields: key_fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// Primary key of a row under this schema.
    ///
    /// Missing key fields count as `null`, so rows differing only in
    /// non-indexed fields collapse to the same key.
    pub fn primary_key(&self, key: &KeyFields) -> String {
        let values: Vec<Value> = self
            .key_fields
            .iter()
            .map(|f| key.get(f).cloned().unwrap_or(Value::Null))
            .collect();
        Value::Array(values).to_string()
    }
}

/// Schema persisted by a backend from its last open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSchema {
    pub version: u32,
    pub tables: Vec<TableSchema>,
}

/// Transaction scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxScope {
    Read,
    ReadWrite,
}

// == Transaction ==
/// Table operations available inside a transaction.
pub trait Transaction {
    /// Row with exactly this key, if any
    fn get(&self, table: &str, key: &KeyFields) -> StorageResult<Option<CacheRow>>;

    /// All rows whose key contains every field of `fields` with an equal value.
    /// An empty `fields` selects the whole table.
    fn select(&self, table: &str, fields: &KeyFields) -> StorageResult<Vec<CacheRow>>;

    /// Inserts or overwrites the row with the same primary key
    fn put(&mut self, table: &str, row: CacheRow) -> StorageResult<()>;

    fn bulk_put(&mut self, table: &str, rows: Vec<CacheRow>) -> StorageResult<()> {
        for row in rows {
            self.put(table, row)?;
        }
        Ok(())
    }

    /// Deletes rows matched like `select`, returning how many were removed
    fn delete(&mut self, table: &str, fields: &KeyFields) -> StorageResult<usize>;
}

/// Work executed inside a transaction. Called exactly once per attempt.
pub type TxWork<'a> = &'a mut (dyn FnMut(&mut dyn Transaction) -> StorageResult<()> + Send);

// == Storage Backend ==
/// Storage capability consumed by the cache engine.
///
/// Only the engine talks to a backend; everything else goes through the
/// engine's queue.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Version and tables from the last successful open, if the store exists.
    async fn stored_schema(&self) -> StorageResult<Option<StoredSchema>>;

    /// Opens the store at `version` with `tables`, upgrading when the version
    /// is higher than the stored one.
    async fn open(&self, version: u32, tables: &[TableSchema]) -> StorageResult<()>;

    /// Closes the handle. Data is kept.
    async fn close(&self);

    /// Runs `work` atomically against `tables`. Nothing is committed if
    /// `work` fails.
    async fn transaction(
        &self,
        scope: TxScope,
        tables: &[String],
        work: TxWork<'_>,
    ) -> StorageResult<()>;
}
