//! In-memory storage backend
//!
//! Versioned tables kept in ordered maps, with optional JSON snapshot
//! persistence and one-shot failure injection for tests.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};
use crate::storage::{
    CacheRow, KeyFields, StorageBackend, StoredSchema, TableSchema, Transaction, TxScope, TxWork,
};

type Rows = BTreeMap<String, CacheRow>;

#[derive(Debug, Default)]
struct MemoryState {
    open: bool,
    version: Option<u32>,
    schemas: BTreeMap<String, TableSchema>,
    tables: BTreeMap<String, Rows>,
    injected: VecDeque<StorageError>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    schemas: Vec<TableSchema>,
    tables: BTreeMap<String, Vec<CacheRow>>,
}

// == Memory Backend ==
/// Storage backend holding every table in memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    snapshot: Option<PathBuf>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend persisted to `path` after every read-write commit.
    ///
    /// An existing snapshot is loaded; an unreadable one is ignored with a warning.
    pub fn with_snapshot(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut state = MemoryState::default();

        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Snapshot>(&content) {
                Ok(snapshot) => {
                    state.version = Some(snapshot.version);
                    state.schemas = snapshot
                        .schemas
                        .into_iter()
                        .map(|s| (s.name.clone(), s))
                        .collect();
                    for (name, rows) in snapshot.tables {
                        let schema = state.schemas.get(&name).cloned();
                        let rows = rows
                            .into_iter()
                            .map(|row| {
                                let pk = schema
                                    .as_ref()
                                    .map(|s| s.primary_key(&row.key))
                                    .unwrap_or_default();
                                (pk, row)
                            })
                            .collect();
                        state.tables.insert(name, rows);
                    }
                    debug!(path = %path.display(), "Loaded storage snapshot");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Ignoring unreadable snapshot"),
            },
            Err(_) => debug!(path = %path.display(), "No storage snapshot yet"),
        }

        Self {
            state: Mutex::new(state),
            snapshot: Some(path),
        }
    }

    /// Makes the next `open` or `transaction` call fail with `error`.
    pub fn fail_next(&self, error: StorageError) {
        if let Ok(mut state) = self.state.lock() {
            state.injected.push_back(error);
        }
    }

    /// Whether the handle is currently open.
    pub fn is_open(&self) -> bool {
        self.state.lock().map(|s| s.open).unwrap_or(false)
    }

    /// Number of rows in `table`, open or not.
    pub fn row_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .map(|s| s.tables.get(table).map(|t| t.len()).unwrap_or(0))
            .unwrap_or(0)
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| StorageError::Backend("memory backend lock poisoned".to_string()))
    }

    fn persist(&self, state: &MemoryState) {
        let (Some(path), Some(version)) = (&self.snapshot, state.version) else {
            return;
        };
        let snapshot = Snapshot {
            version,
            schemas: state.schemas.values().cloned().collect(),
            tables: state
                .tables
                .iter()
                .map(|(name, rows)| (name.clone(), rows.values().cloned().collect()))
                .collect(),
        };
        let result = serde_json::to_vec(&snapshot)
            .map_err(|e| e.to_string())
            .and_then(|bytes| std::fs::write(path, bytes).map_err(|e| e.to_string()));
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to write storage snapshot");
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn stored_schema(&self) -> StorageResult<Option<StoredSchema>> {
        let state = self.lock()?;
        Ok(state.version.map(|version| StoredSchema {
            version,
            tables: state.schemas.values().cloned().collect(),
        }))
    }

    async fn open(&self, version: u32, tables: &[TableSchema]) -> StorageResult<()> {
        let mut state = self.lock()?;
        if let Some(err) = state.injected.pop_front() {
            return Err(err);
        }

        let requested: BTreeMap<String, TableSchema> = tables
            .iter()
            .map(|t| (t.name.clone(), t.clone()))
            .collect();

        match state.version {
            Some(stored) if version < stored => {
                return Err(StorageError::Schema(format!(
                    "requested version {} is lower than stored version {}",
                    version, stored
                )));
            }
            Some(stored) if version == stored => {
                if requested != state.schemas {
                    return Err(StorageError::Schema(format!(
                        "schema changed without a version bump (version {})",
                        version
                    )));
                }
            }
            _ => {
                // Upgrade: keep rows of unchanged tables, drop the rest.
                let mut upgraded = BTreeMap::new();
                for (name, schema) in &requested {
                    let unchanged = state.schemas.get(name) == Some(schema);
                    let rows = match state.tables.remove(name) {
                        Some(rows) if unchanged => rows,
                        _ => Rows::new(),
                    };
                    upgraded.insert(name.clone(), rows);
                }
                debug!(
                    from = ?state.version,
                    to = version,
                    tables = requested.len(),
                    "Upgrading storage schema"
                );
                state.tables = upgraded;
                state.schemas = requested;
                state.version = Some(version);
                self.persist(&state);
            }
        }

        state.open = true;
        Ok(())
    }

    async fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.open = false;
        }
    }

    async fn transaction(
        &self,
        scope: TxScope,
        tables: &[String],
        work: TxWork<'_>,
    ) -> StorageResult<()> {
        let mut state = self.lock()?;
        if let Some(err) = state.injected.pop_front() {
            return Err(err);
        }
        if !state.open {
            return Err(StorageError::Closed);
        }

        let written = {
            let mut schemas = BTreeMap::new();
            for name in tables {
                let schema = state
                    .schemas
                    .get(name)
                    .ok_or_else(|| StorageError::MissingTable(name.clone()))?;
                schemas.insert(name.clone(), schema);
            }

            let mut tx = MemoryTransaction {
                scope,
                schemas,
                base: &state.tables,
                written: BTreeMap::new(),
            };
            work(&mut tx)?;
            tx.written
        };

        if scope == TxScope::ReadWrite && !written.is_empty() {
            for (name, rows) in written {
                state.tables.insert(name, rows);
            }
            self.persist(&state);
        }
        Ok(())
    }
}

// == Memory Transaction ==
static NO_ROWS: Rows = BTreeMap::new();

/// Reads go to the committed rows; a table is copied on its first write.
struct MemoryTransaction<'a> {
    scope: TxScope,
    schemas: BTreeMap<String, &'a TableSchema>,
    base: &'a BTreeMap<String, Rows>,
    written: BTreeMap<String, Rows>,
}

impl<'a> MemoryTransaction<'a> {
    fn schema(&self, name: &str) -> StorageResult<&'a TableSchema> {
        self.schemas.get(name).copied().ok_or_else(|| {
            StorageError::Backend(format!("table {} is not in the transaction scope", name))
        })
    }

    fn table(&self, name: &str) -> StorageResult<(&'a TableSchema, &Rows)> {
        let schema = self.schema(name)?;
        let rows = self
            .written
            .get(name)
            .or_else(|| self.base.get(name))
            .unwrap_or(&NO_ROWS);
        Ok((schema, rows))
    }

    fn table_mut(&mut self, name: &str) -> StorageResult<(&'a TableSchema, &mut Rows)> {
        if self.scope == TxScope::Read {
            return Err(StorageError::Backend(format!(
                "write to {} inside a read-only transaction",
                name
            )));
        }
        let schema = self.schema(name)?;
        let base = self.base;
        let rows = self
            .written
            .entry(name.to_string())
            .or_insert_with(|| base.get(name).cloned().unwrap_or_default());
        Ok((schema, rows))
    }
}

fn matches(row: &CacheRow, fields: &KeyFields) -> bool {
    fields.iter().all(|(k, v)| row.key.get(k) == Some(v))
}

impl Transaction for MemoryTransaction<'_> {
    fn get(&self, table: &str, key: &KeyFields) -> StorageResult<Option<CacheRow>> {
        let (schema, rows) = self.table(table)?;
        Ok(rows.get(&schema.primary_key(key)).cloned())
    }

    fn select(&self, table: &str, fields: &KeyFields) -> StorageResult<Vec<CacheRow>> {
        let (_, rows) = self.table(table)?;
        Ok(rows.values().filter(|r| matches(r, fields)).cloned().collect())
    }

    fn put(&mut self, table: &str, row: CacheRow) -> StorageResult<()> {
        let (schema, rows) = self.table_mut(table)?;
        rows.insert(schema.primary_key(&row.key), row);
        Ok(())
    }

    fn delete(&mut self, table: &str, fields: &KeyFields) -> StorageResult<usize> {
        let (_, rows) = self.table_mut(table)?;
        let before = rows.len();
        rows.retain(|_, r| !matches(r, fields));
        Ok(before - rows.len())
    }
}
