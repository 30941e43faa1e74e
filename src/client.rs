//! Indexer Client
//!
//! Composition root wiring storage, cache, rate limiter and query
//! orchestrator together, and the read methods built on them.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::batch::BatchScheduler;
use crate::cache::CacheEngine;
use crate::config::Config;
use crate::error::Result;
use crate::limiter::RateLimiter;
use crate::models::{is_error, QueryOptions, QueryRequest};
use crate::query::{HttpTransport, QueryOrchestrator, Transport};
use crate::storage::{MemoryBackend, StorageBackend};
use crate::tasks::spawn_prune_task;

// == Indexer Client ==
/// Read client for the indexer REST API.
///
/// Read methods never fail: upstream errors come back as an
/// `{ "error": ... }` payload, which callers check with
/// [`is_error`](crate::models::is_error).
pub struct IndexerClient {
    config: Config,
    cache: CacheEngine,
    query: QueryOrchestrator,
    /// Background open and prune tasks
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl IndexerClient {
    /// Creates a client with an in-memory cache and the HTTP transport.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        let transport = HttpTransport::new(&config)?;
        Self::with_parts(config, Arc::new(MemoryBackend::new()), Arc::new(transport))
    }

    /// Creates a client over the given storage backend and transport.
    ///
    /// The cache opens in the background, retrying until storage is
    /// available. Reads issued before the first open attempt completes wait
    /// for it; once an attempt has failed they are served as cache misses.
    pub fn with_parts(
        config: Config,
        backend: Arc<dyn StorageBackend>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let cache = CacheEngine::new(backend, &config.cache)?;
        let mut tasks = vec![cache.open_in_background()];

        let limiter = RateLimiter::new(config.rate_limit);
        let query = QueryOrchestrator::new(config.base_url.clone(), cache.clone(), limiter, transport);

        if let Some(interval) = cache.prune_interval() {
            tasks.push(spawn_prune_task(cache.clone(), interval));
        }

        info!(
            base_url = %config.base_url,
            rate = config.rate_limit.rate,
            interval_ms = config.rate_limit.interval_ms,
            concurrency = config.rate_limit.concurrency,
            "Indexer client initialized"
        );

        Ok(Self {
            config,
            cache,
            query,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The cache engine backing this client.
    pub fn cache(&self) -> &CacheEngine {
        &self.cache
    }

    // == Generic Reads ==
    pub async fn query(&self, request: QueryRequest) -> Value {
        self.query.query(request).await
    }

    /// Reads an arbitrary endpoint, caching under `store` when given.
    pub async fn custom(&self, url: &str, store: Option<&str>, options: QueryOptions) -> Value {
        self.query.custom(url, store, options).await
    }

    async fn read(&self, url: &str, store: &str, positional: Vec<Value>, options: QueryOptions) -> Value {
        let request = QueryRequest::new(url)
            .store(store)
            .positional(positional)
            .options(options);
        self.query.query(request).await
    }

    // == Read Methods ==
    pub async fn health(&self, options: QueryOptions) -> Value {
        self.read("/health", "health", Vec::new(), options).await
    }

    pub async fn account(&self, address: &str, options: QueryOptions) -> Value {
        self.read("/v2/accounts/:accountId", "account", vec![address.into()], options)
            .await
    }

    /// Searches accounts (`assetId`, `currencyGreaterThan`, ...).
    pub async fn accounts(&self, options: QueryOptions) -> Value {
        self.read("/v2/accounts", "accounts", Vec::new(), options).await
    }

    pub async fn account_assets(&self, address: &str, options: QueryOptions) -> Value {
        self.read(
            "/v2/accounts/:accountId/assets",
            "accountAssets",
            vec![address.into()],
            options,
        )
        .await
    }

    pub async fn account_transactions(&self, address: &str, options: QueryOptions) -> Value {
        self.read(
            "/v2/accounts/:accountId/transactions",
            "accountTransactions",
            vec![address.into()],
            options,
        )
        .await
    }

    /// Local application state of an account.
    pub async fn account_applications(&self, address: &str, options: QueryOptions) -> Value {
        self.read(
            "/v2/accounts/:accountId/apps-local-state",
            "accountApplications",
            vec![address.into()],
            options,
        )
        .await
    }

    pub async fn asset(&self, asset_id: u64, options: QueryOptions) -> Value {
        self.read("/v2/assets/:assetId", "asset", vec![asset_id.into()], options)
            .await
    }

    pub async fn assets(&self, options: QueryOptions) -> Value {
        self.read("/v2/assets", "assets", Vec::new(), options).await
    }

    pub async fn asset_balances(&self, asset_id: u64, options: QueryOptions) -> Value {
        self.read(
            "/v2/assets/:assetId/balances",
            "assetBalances",
            vec![asset_id.into()],
            options,
        )
        .await
    }

    pub async fn asset_transactions(&self, asset_id: u64, options: QueryOptions) -> Value {
        self.read(
            "/v2/assets/:assetId/transactions",
            "assetTransactions",
            vec![asset_id.into()],
            options,
        )
        .await
    }

    pub async fn block(&self, round: u64, options: QueryOptions) -> Value {
        self.read("/v2/blocks/:roundNumber", "block", vec![round.into()], options)
            .await
    }

    pub async fn transaction(&self, txid: &str, options: QueryOptions) -> Value {
        self.read("/v2/transactions/:txid", "transaction", vec![txid.into()], options)
            .await
    }

    pub async fn transactions(&self, options: QueryOptions) -> Value {
        self.read("/v2/transactions", "transactions", Vec::new(), options)
            .await
    }

    pub async fn application(&self, application_id: u64, options: QueryOptions) -> Value {
        self.read(
            "/v2/applications/:applicationId",
            "application",
            vec![application_id.into()],
            options,
        )
        .await
    }

    pub async fn applications(&self, options: QueryOptions) -> Value {
        self.read("/v2/applications", "applications", Vec::new(), options)
            .await
    }

    pub async fn application_logs(&self, application_id: u64, options: QueryOptions) -> Value {
        self.read(
            "/v2/applications/:applicationId/logs",
            "applicationLogs",
            vec![application_id.into()],
            options,
        )
        .await
    }

    // == Batching ==
    /// Builds a scheduler that coalesces single-key lookups against `endpoint`.
    ///
    /// Each flush sends every pending key joined by `,` as `key_param`, and
    /// resolves each key from the response field of the same name. Keys are
    /// matched after response keys are camelCased.
    pub fn batcher(
        &self,
        endpoint: impl Into<String>,
        key_param: impl Into<String>,
        tick: Duration,
        max_batch: usize,
    ) -> BatchScheduler<Value> {
        let query = self.query.clone();
        let endpoint: Arc<str> = endpoint.into().into();
        let key_param: Arc<str> = key_param.into().into();

        BatchScheduler::new(tick, max_batch, move |keys: Vec<String>| {
            let query = query.clone();
            let endpoint = endpoint.clone();
            let key_param = key_param.clone();
            async move {
                let options = QueryOptions::new()
                    .param(key_param.to_string(), keys.join(","))
                    .no_cache();
                let payload = query.custom(&endpoint, None, options).await;
                if is_error(&payload) {
                    warn!(endpoint = %endpoint, keys = keys.len(), "Batch lookup failed");
                    return HashMap::new();
                }
                keys.into_iter()
                    .filter_map(|key| payload.get(&key).cloned().map(|value| (key, value)))
                    .collect()
            }
        })
    }

    // == Maintenance ==
    /// Prunes expired rows from every table now.
    pub async fn prune(&self) -> Result<BTreeMap<String, usize>> {
        self.cache.prune(None).await
    }

    /// Stops the background tasks and closes the cache storage.
    pub async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
        self.cache.close().await;
        info!("Indexer client shut down");
    }
}

impl Drop for IndexerClient {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}
