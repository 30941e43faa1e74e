//! Cache Engine Module
//!
//! TTL cache layered over an asynchronously opened storage backend.
//!
//! Every operation is captured on a FIFO queue and executed by a single
//! worker task once the backend is open. While the engine is not ready the
//! queue only grows; pruning is front-run ahead of queued work. Once an open
//! attempt has failed, reads resolve as misses until storage comes back.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::entry::current_timestamp_ms;
use crate::cache::key::hash_key_fields;
use crate::cache::queue::{OpOutput, Operation, QueuedOp, TransactionQueue};
use crate::cache::schema::{TableRegistry, STATE_KEY_FIELD, STATE_TABLE};
use crate::cache::{CacheEntry, CacheStats, FindQuery};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result, StorageError, StorageResult};
use crate::storage::{CacheRow, KeyFields, StorageBackend, TableSchema, Transaction, TxScope};

/// State table key holding the last prune time.
const LAST_PRUNED_KEY: &str = "lastPruned";

/// Reopen attempts after a schema failure before handing off to the background reopen loop.
const MAX_REINIT_ATTEMPTS: u32 = 5;

/// Floor and ceiling for the background reopen backoff.
const MIN_REOPEN_BACKOFF: Duration = Duration::from_millis(10);
const MAX_REOPEN_BACKOFF: Duration = Duration::from_secs(30);

// == Readiness ==
/// Engine readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    NotReady,
    Ready,
}

#[derive(Debug)]
struct EngineState {
    readiness: Readiness,
    queue: TransactionQueue,
    version: u32,
    opened_tables: BTreeSet<String>,
    /// Set when the last open attempt failed
    unavailable: bool,
}

/// Outcome of one attempt at a queued operation.
enum Step {
    Done,
    Requeue(QueuedOp),
    Reinitialize(QueuedOp, StorageError),
}

struct EngineInner {
    this: Weak<EngineInner>,
    backend: Arc<dyn StorageBackend>,
    registry: RwLock<TableRegistry>,
    state: Mutex<EngineState>,
    stats: Mutex<CacheStats>,
    wake: Arc<Notify>,
    max_requeue_attempts: Option<u32>,
    reopen_delay: Duration,
    reopen_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.reopen_task).take() {
            task.abort();
        }
        // Lets the worker observe that the engine is gone.
        self.wake.notify_one();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// == Cache Engine ==
/// Shared handle to the cache engine.
#[derive(Clone)]
pub struct CacheEngine {
    inner: Arc<EngineInner>,
}

impl CacheEngine {
    // == Constructor ==
    /// Creates an engine in the not-ready state and starts its queue worker.
    ///
    /// Must be called inside a Tokio runtime. Call [`CacheEngine::open`]
    /// (usually from a spawned task) to make it ready.
    pub fn new(backend: Arc<dyn StorageBackend>, config: &CacheConfig) -> Result<Self> {
        let registry = TableRegistry::from_config(config)?;
        let inner = Arc::new_cyclic(|this| EngineInner {
            this: this.clone(),
            backend,
            registry: RwLock::new(registry),
            state: Mutex::new(EngineState {
                readiness: Readiness::NotReady,
                queue: TransactionQueue::default(),
                version: 0,
                opened_tables: BTreeSet::new(),
                unavailable: false,
            }),
            stats: Mutex::new(CacheStats::new()),
            wake: Arc::new(Notify::new()),
            max_requeue_attempts: config.max_requeue_attempts,
            reopen_delay: Duration::from_millis(config.reopen_delay_ms),
            reopen_task: Mutex::new(None),
        });
        spawn_worker(&inner);
        Ok(Self { inner })
    }

    /// Opens the backend with the current schema and drains the queue.
    pub async fn open(&self) -> Result<()> {
        self.inner.open().await
    }

    /// Opens the backend from a spawned task, retrying with backoff until it
    /// succeeds or the engine is dropped or closed.
    pub fn open_in_background(&self) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.open().await {
                warn!(error = %e, "Cache storage failed to open, retrying in background");
                engine.inner.spawn_reopen();
            }
        })
    }

    /// Forces the engine back to not-ready, closes and reopens the backend.
    ///
    /// On failure the reopen continues in the background.
    pub async fn reset(&self) -> Result<()> {
        self.inner.set_not_ready();
        self.inner.backend.close().await;
        tokio::time::sleep(self.inner.reopen_delay).await;
        let result = self.inner.open().await;
        if result.is_err() {
            self.inner.spawn_reopen();
        }
        result
    }

    /// Closes the backend and stops any background reopen. Operations
    /// submitted afterwards wait for `open`.
    pub async fn close(&self) {
        if let Some(task) = lock(&self.inner.reopen_task).take() {
            task.abort();
        }
        self.inner.set_not_ready();
        lock(&self.inner.state).unavailable = false;
        self.inner.backend.close().await;
        info!("Cache engine closed");
    }

    /// Registers tables at runtime; a changed schema reopens the backend
    /// under a new version.
    pub async fn add_tables(&self, tables: Vec<TableSchema>) -> Result<()> {
        let changed = {
            let mut registry = self
                .inner
                .registry
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            tables
                .into_iter()
                .fold(false, |changed, schema| registry.insert(schema) || changed)
        };
        if changed && self.is_ready() {
            info!("Table schema changed, reopening cache storage");
            self.reset().await?;
        }
        Ok(())
    }

    pub fn readiness(&self) -> Readiness {
        lock(&self.inner.state).readiness
    }

    pub fn is_ready(&self) -> bool {
        self.readiness() == Readiness::Ready
    }

    /// True while not ready after a failed open; reads are misses meanwhile.
    pub fn is_unavailable(&self) -> bool {
        let state = lock(&self.inner.state);
        state.readiness == Readiness::NotReady && state.unavailable
    }

    /// Schema version the backend was last opened with; 0 before the first open.
    pub fn schema_version(&self) -> u32 {
        lock(&self.inner.state).version
    }

    /// Current statistics, including the queue length.
    pub fn stats(&self) -> CacheStats {
        let mut stats = lock(&self.inner.stats).clone();
        stats.queued = lock(&self.inner.state).queue.len();
        stats
    }

    /// TTL of `table`; `None` if it never expires or is unknown.
    pub fn ttl(&self, table: &str) -> Option<Duration> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ttl(table)
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(table)
    }

    /// Key fields of `table`'s index.
    pub fn key_fields(&self, table: &str) -> Option<Vec<String>> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .map(|def| def.schema.key_fields.clone())
    }

    // == Find ==
    /// Returns the first live entry matching `query`, or `None`.
    ///
    /// Never fails: backend errors count as a miss.
    pub async fn find(&self, table: &str, query: FindQuery) -> Option<CacheEntry> {
        let query = FindQuery {
            limit: Some(1),
            ..query
        };
        self.find_many(table, query).await.into_iter().next()
    }

    /// Returns every live entry matching `query`, up to its `limit`.
    pub async fn find_many(&self, table: &str, query: FindQuery) -> Vec<CacheEntry> {
        let op = Operation::Find {
            table: table.to_string(),
            query,
        };
        let entries = match self.inner.submit(op, false).await {
            Ok(OpOutput::Entries(entries)) => entries,
            Ok(_) => Vec::new(),
            Err(e) => {
                debug!(table, error = %e, "Cache read treated as miss");
                Vec::new()
            }
        };

        let mut stats = lock(&self.inner.stats);
        if entries.is_empty() {
            stats.record_miss();
        } else {
            stats.record_hit();
        }
        entries
    }

    // == Save ==
    /// Stores `data` under the hashed `key_fields`, replacing any entry with
    /// the same key.
    pub async fn save(&self, table: &str, data: Value, key_fields: Map<String, Value>) -> Result<()> {
        self.bulk_save(table, vec![(key_fields, data)]).await
    }

    /// Stores several entries atomically with one shared timestamp.
    pub async fn bulk_save(&self, table: &str, entries: Vec<(Map<String, Value>, Value)>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.inner.submit(save_op(table, entries), false).await.map(|_| ())
    }

    /// Queues a save without waiting for it to run.
    ///
    /// Queue order still holds: operations submitted afterwards observe the
    /// entry once the save succeeds. Failures are logged.
    pub fn queue_save(&self, table: &str, data: Value, key_fields: Map<String, Value>) -> Result<()> {
        let rx = self.inner.enqueue(save_op(table, vec![(key_fields, data)]), false)?;
        let table = table.to_string();
        tokio::spawn(async move {
            match rx.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(table = %table, error = %e, "Queued cache write failed"),
                Err(_) => debug!(table = %table, "Queued cache write dropped"),
            }
        });
        Ok(())
    }

    // == Delete ==
    /// Deletes every entry matching `query`, expired or not.
    pub async fn delete(&self, table: &str, query: FindQuery) -> Result<usize> {
        let op = Operation::Delete {
            table: table.to_string(),
            query,
        };
        match self.inner.submit(op, false).await? {
            OpOutput::Deleted(count) => Ok(count),
            _ => Ok(0),
        }
    }

    // == Prune ==
    /// Removes expired entries from `tables` (all tables when `None`).
    ///
    /// Tables that never expire or are marked persisted are skipped.
    pub async fn prune(&self, tables: Option<&[&str]>) -> Result<BTreeMap<String, usize>> {
        let op = Operation::Prune {
            tables: tables.map(|t| t.iter().map(|s| s.to_string()).collect()),
            gated: false,
        };
        match self.inner.submit(op, true).await? {
            OpOutput::Pruned(counts) => Ok(counts),
            _ => Ok(BTreeMap::new()),
        }
    }

    /// Prunes all tables if the configured interval has elapsed since the
    /// last prune. Returns an empty map when nothing was due.
    pub async fn prune_if_due(&self) -> Result<BTreeMap<String, usize>> {
        let op = Operation::Prune {
            tables: None,
            gated: true,
        };
        match self.inner.submit(op, true).await? {
            OpOutput::Pruned(counts) => Ok(counts),
            _ => Ok(BTreeMap::new()),
        }
    }

    /// Configured pruning interval.
    pub fn prune_interval(&self) -> Option<Duration> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .prune_interval()
    }
}

fn save_op(table: &str, entries: Vec<(Map<String, Value>, Value)>) -> Operation {
    let timestamp = current_timestamp_ms();
    let rows = entries
        .into_iter()
        .map(|(key, data)| CacheRow {
            key: hash_key_fields(&key),
            data,
            timestamp,
        })
        .collect();
    Operation::Save {
        table: table.to_string(),
        rows,
    }
}

fn spawn_worker(inner: &Arc<EngineInner>) {
    let weak: Weak<EngineInner> = Arc::downgrade(inner);
    let wake = inner.wake.clone();
    tokio::spawn(async move {
        loop {
            wake.notified().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            inner.drain().await;
        }
        debug!("Cache engine worker stopped");
    });
}

impl EngineInner {
    fn set_not_ready(&self) {
        let mut state = lock(&self.state);
        if state.readiness == Readiness::Ready {
            info!("Cache engine not ready");
        }
        state.readiness = Readiness::NotReady;
    }

    async fn open(&self) -> Result<()> {
        let result = self.open_backend().await;
        if result.is_err() {
            self.mark_unavailable();
        }
        result
    }

    async fn open_backend(&self) -> Result<()> {
        let stored = self.backend.stored_schema().await?;
        let (version, schemas, names) = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            let names: BTreeSet<String> = registry.names().cloned().collect();
            (registry.version_for(stored.as_ref()), registry.schemas(), names)
        };

        self.backend.open(version, &schemas).await?;

        let queued = {
            let mut state = lock(&self.state);
            state.readiness = Readiness::Ready;
            state.unavailable = false;
            state.version = version;
            state.opened_tables = names;
            state.queue.len()
        };
        info!(version, queued, "Cache engine ready");

        self.schedule_gated_prune();
        self.wake.notify_one();
        Ok(())
    }

    /// Flags a failed open; while not ready, queued reads resolve as misses.
    fn mark_unavailable(&self) {
        let reads = {
            let mut state = lock(&self.state);
            if state.readiness == Readiness::Ready {
                return;
            }
            state.unavailable = true;
            let (reads, rest): (Vec<_>, Vec<_>) =
                state.queue.take_all().into_iter().partition(|item| item.op.is_read());
            state.queue.restore_front(rest.into_iter());
            reads
        };
        if !reads.is_empty() {
            debug!(count = reads.len(), "Cache unavailable, resolving queued reads as misses");
        }
        for item in reads {
            item.resolve(Ok(OpOutput::Entries(Vec::new())));
        }
    }

    /// Starts the backoff reopen loop unless one is already running.
    fn spawn_reopen(&self) {
        let mut slot = lock(&self.reopen_task);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let this = self.this.clone();
        let mut delay = self.reopen_delay.max(MIN_REOPEN_BACKOFF);
        *slot = Some(tokio::spawn(async move {
            for attempt in 1u32.. {
                tokio::time::sleep(delay).await;
                let Some(inner) = this.upgrade() else {
                    break;
                };
                let ready = lock(&inner.state).readiness == Readiness::Ready;
                if ready {
                    break;
                }
                match inner.open().await {
                    Ok(()) => {
                        info!(attempt, "Cache storage reopened");
                        break;
                    }
                    Err(e) => {
                        delay = (delay * 2).min(MAX_REOPEN_BACKOFF);
                        warn!(attempt, error = %e, retry_in = ?delay, "Cache storage still unavailable");
                    }
                }
            }
        }));
    }

    /// Wakes the worker after the reopen delay so requeued work is retried
    /// without waiting for another submission.
    fn schedule_retry(&self) {
        let wake = self.wake.clone();
        let delay = self.reopen_delay.max(MIN_REOPEN_BACKOFF);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            wake.notify_one();
        });
    }

    fn schedule_gated_prune(&self) {
        let has_interval = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .prune_interval()
            .is_some();
        if !has_interval {
            return;
        }
        let op = Operation::Prune {
            tables: None,
            gated: true,
        };
        let tables = self.tables_for(&op);
        // Nobody waits on this one; the receiver is dropped.
        let (item, _) = QueuedOp::new(op, tables);
        lock(&self.state).queue.front_run(item);
    }

    fn tables_for(&self, op: &Operation) -> Vec<String> {
        match op {
            Operation::Find { table, .. }
            | Operation::Save { table, .. }
            | Operation::Delete { table, .. } => vec![table.clone()],
            Operation::Prune { tables, .. } => {
                let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
                let mut targets: Vec<String> = match tables {
                    Some(tables) => tables.clone(),
                    None => registry.names().cloned().collect(),
                };
                targets.retain(|name| {
                    registry
                        .get(name)
                        .map(|def| !def.persisted && def.ttl.is_some())
                        .unwrap_or(false)
                });
                targets.push(STATE_TABLE.to_string());
                targets
            }
        }
    }

    async fn submit(&self, op: Operation, front_run: bool) -> Result<OpOutput> {
        self.enqueue(op, front_run)?
            .await
            .map_err(|_| CacheError::Stopped)?
    }

    /// Queues `op` and wakes the worker. Reads issued while the cache is
    /// unavailable resolve immediately as misses.
    fn enqueue(&self, op: Operation, front_run: bool) -> Result<oneshot::Receiver<Result<OpOutput>>> {
        if let Operation::Find { table, .. }
        | Operation::Save { table, .. }
        | Operation::Delete { table, .. } = &op
        {
            let known = self
                .registry
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(table);
            if !known {
                return Err(CacheError::UnknownTable(table.clone()));
            }
        }

        let tables = self.tables_for(&op);
        let (item, rx) = QueuedOp::new(op, tables);
        {
            let mut state = lock(&self.state);
            if state.readiness == Readiness::NotReady {
                if state.unavailable && item.op.is_read() {
                    drop(state);
                    item.resolve(Ok(OpOutput::Entries(Vec::new())));
                    return Ok(rx);
                }
                debug!(kind = item.op.kind(), queued = state.queue.len() + 1, "Queued until cache is ready");
            }
            if front_run {
                state.queue.front_run(item);
            } else {
                state.queue.push(item);
            }
        }
        self.wake.notify_one();
        Ok(rx)
    }

    // == Drain ==
    /// Runs every queued operation once, in order.
    async fn drain(&self) {
        let mut pending = {
            let mut state = lock(&self.state);
            if state.readiness != Readiness::Ready || state.queue.is_empty() {
                return;
            }
            state.queue.take_all()
        };

        let mut retry = Vec::new();
        while let Some(item) = pending.pop_front() {
            match self.run(item).await {
                Step::Done => {}
                Step::Requeue(item) => {
                    lock(&self.stats).record_requeue();
                    retry.push(item);
                }
                Step::Reinitialize(item, cause) => {
                    {
                        let mut state = lock(&self.state);
                        let remaining = retry
                            .drain(..)
                            .chain(std::iter::once(item))
                            .chain(pending.drain(..))
                            .collect::<Vec<_>>();
                        state.queue.restore_front(remaining.into_iter());
                    }
                    self.reinitialize(cause).await;
                    return;
                }
            }
        }

        if !retry.is_empty() {
            debug!(count = retry.len(), "Requeued cache operations");
            {
                let mut state = lock(&self.state);
                for item in retry {
                    state.queue.push(item);
                }
            }
            self.schedule_retry();
        }
    }

    async fn reinitialize(&self, cause: StorageError) {
        warn!(error = %cause, "Cache storage schema failure, reinitializing");
        self.set_not_ready();
        lock(&self.stats).record_reopen();

        for attempt in 1..=MAX_REINIT_ATTEMPTS {
            self.backend.close().await;
            tokio::time::sleep(self.reopen_delay).await;
            match self.open().await {
                Ok(()) => return,
                Err(e) => warn!(attempt, error = %e, "Cache reinitialization failed"),
            }
        }
        error!("Cache storage could not be reopened, retrying in background");
        self.spawn_reopen();
    }

    async fn run(&self, item: QueuedOp) -> Step {
        let missing = {
            let state = lock(&self.state);
            item.tables
                .iter()
                .find(|t| !state.opened_tables.contains(*t))
                .cloned()
        };
        if let Some(table) = missing {
            return self.requeue_missing(item, table);
        }

        let mut reopened = false;
        loop {
            match self.execute(&item.op, item.scope, &item.tables).await {
                Ok(output) => {
                    self.record(&output);
                    item.resolve(Ok(output));
                    return Step::Done;
                }
                Err(StorageError::Closed) if !reopened => {
                    reopened = true;
                    lock(&self.stats).record_reopen();
                    debug!(kind = item.op.kind(), "Cache storage closed, reopening");
                    match self.open().await {
                        Ok(()) => continue,
                        Err(CacheError::Storage(cause @ StorageError::Schema(_))) => {
                            return Step::Reinitialize(item, cause)
                        }
                        Err(e) => return self.settle_failure(item, e.to_string()),
                    }
                }
                Err(cause @ StorageError::Schema(_)) => return Step::Reinitialize(item, cause),
                Err(StorageError::MissingTable(table)) => return self.requeue_missing(item, table),
                Err(e) => return self.settle_failure(item, e.to_string()),
            }
        }
    }

    fn requeue_missing(&self, mut item: QueuedOp, table: String) -> Step {
        item.attempts += 1;
        match self.max_requeue_attempts {
            Some(max) if item.attempts > max => {
                warn!(table = %table, attempts = item.attempts, "Giving up on cache operation");
                item.resolve(Err(StorageError::MissingTable(table).into()));
                Step::Done
            }
            _ => {
                debug!(table = %table, attempts = item.attempts, "Table not open yet, requeueing");
                Step::Requeue(item)
            }
        }
    }

    /// Reads resolve as a miss; writes go back on the queue.
    fn settle_failure(&self, item: QueuedOp, message: String) -> Step {
        if item.op.is_read() {
            warn!(error = %message, "Cache read failed");
            item.resolve(Ok(OpOutput::Entries(Vec::new())));
            Step::Done
        } else {
            warn!(kind = item.op.kind(), error = %message, "Cache write failed, requeueing");
            Step::Requeue(item)
        }
    }

    fn record(&self, output: &OpOutput) {
        let mut stats = lock(&self.stats);
        match output {
            OpOutput::Saved(count) => stats.record_writes(*count),
            OpOutput::Deleted(count) => stats.record_deletes(*count),
            OpOutput::Pruned(counts) => stats.record_pruned(counts.values().sum()),
            OpOutput::Entries(_) => {}
        }
    }

    // == Execute ==
    async fn execute(&self, op: &Operation, scope: TxScope, tables: &[String]) -> StorageResult<OpOutput> {
        match op {
            Operation::Find { table, query } => self.execute_find(table, query, tables).await,
            Operation::Save { table, rows } => {
                self.backend
                    .transaction(scope, tables, &mut |tx: &mut dyn Transaction| {
                        tx.bulk_put(table, rows.clone())
                    })
                    .await?;
                Ok(OpOutput::Saved(rows.len()))
            }
            Operation::Delete { table, query } => {
                let key = hash_key_fields(&query.fields);
                let mut deleted = 0;
                self.backend
                    .transaction(scope, tables, &mut |tx: &mut dyn Transaction| {
                        deleted = 0;
                        for row in tx.select(table, &key)? {
                            let entry = CacheEntry::from(row);
                            if query.filter.as_ref().map_or(true, |f| f(&entry)) {
                                deleted += tx.delete(table, &entry.key)?;
                            }
                        }
                        Ok(())
                    })
                    .await?;
                Ok(OpOutput::Deleted(deleted))
            }
            Operation::Prune { gated, .. } => self.execute_prune(*gated, tables).await,
        }
    }

    async fn execute_find(&self, table: &str, query: &FindQuery, tables: &[String]) -> StorageResult<OpOutput> {
        let (ttl, key_fields) = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            let def = registry.get(table);
            (
                def.and_then(|d| d.ttl),
                def.map(|d| d.schema.key_fields.clone()).unwrap_or_default(),
            )
        };
        let key = hash_key_fields(&query.fields);
        let exact = !key.is_empty()
            && key.len() == key_fields.len()
            && key_fields.iter().all(|f| key.contains_key(f));

        let mut rows = Vec::new();
        self.backend
            .transaction(TxScope::Read, tables, &mut |tx: &mut dyn Transaction| {
                rows = if exact {
                    tx.get(table, &key)?.into_iter().collect()
                } else {
                    tx.select(table, &key)?
                };
                Ok(())
            })
            .await?;

        let entries = rows.into_iter().map(CacheEntry::from).collect();
        Ok(OpOutput::Entries(query.refine(entries, ttl)))
    }

    async fn execute_prune(&self, gated: bool, tables: &[String]) -> StorageResult<OpOutput> {
        let (ttls, interval) = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            let ttls: Vec<(String, i64)> = tables
                .iter()
                .filter_map(|name| {
                    registry
                        .get(name)
                        .filter(|def| !def.persisted)
                        .and_then(|def| def.ttl)
                        .map(|ttl| (name.clone(), ttl.as_millis() as i64))
                })
                .collect();
            (ttls, registry.prune_interval())
        };

        let now = current_timestamp_ms();
        let mut state_key = KeyFields::new();
        state_key.insert(STATE_KEY_FIELD.to_string(), json!(LAST_PRUNED_KEY));

        let mut counts = BTreeMap::new();
        let mut skipped = false;
        self.backend
            .transaction(TxScope::ReadWrite, tables, &mut |tx: &mut dyn Transaction| {
                counts.clear();
                skipped = false;
                if gated {
                    let last = tx
                        .get(STATE_TABLE, &state_key)?
                        .and_then(|row| row.data.as_i64());
                    let due = match (interval, last) {
                        (None, _) => false,
                        (Some(_), None) => true,
                        (Some(interval), Some(last)) => now - last >= interval.as_millis() as i64,
                    };
                    if !due {
                        skipped = true;
                        return Ok(());
                    }
                }

                for (table, ttl) in &ttls {
                    let mut removed = 0;
                    for row in tx.select(table, &KeyFields::new())? {
                        if now - row.timestamp >= *ttl {
                            removed += tx.delete(table, &row.key)?;
                        }
                    }
                    counts.insert(table.clone(), removed);
                }

                tx.put(
                    STATE_TABLE,
                    CacheRow {
                        key: state_key.clone(),
                        data: json!(now),
                        timestamp: now,
                    },
                )
            })
            .await?;

        if skipped {
            debug!("Prune not due yet");
        } else {
            let total: usize = counts.values().sum();
            info!(total, tables = counts.len(), "Pruned expired cache entries");
        }
        Ok(OpOutput::Pruned(counts))
    }
}
