//! Query Orchestrator
//!
//! Single entry point for every read: cache lookup, URL binding, rate
//! limited fetch, key normalization, addons, filtering, pagination and
//! write-back to the cache.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::addons;
use crate::cache::{CacheEngine, FindQuery, PARAMS_FIELD};
use crate::error::QueryError;
use crate::limiter::RateLimiter;
use crate::models::{
    apply_filter, has_next_token, is_error, merge_page, param_string, result_count, substitute,
    take_next_token, QueryOptions, QueryRequest, LIMIT_PARAM, NEXT_PARAM,
};
use crate::query::case::{camelize_keys, to_kebab};
use crate::query::transport::Transport;

/// Upper bound on requests issued by one query.
pub const MAX_PAGES: usize = 20;

// == Query Orchestrator ==
#[derive(Clone)]
pub struct QueryOrchestrator {
    base_url: String,
    cache: CacheEngine,
    limiter: RateLimiter,
    transport: Arc<dyn Transport>,
}

impl QueryOrchestrator {
    pub fn new(
        base_url: impl Into<String>,
        cache: CacheEngine,
        limiter: RateLimiter,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cache,
            limiter,
            transport,
        }
    }

    pub fn cache(&self) -> &CacheEngine {
        &self.cache
    }

    /// Reads `url` with no positional parameters, optionally through cache table `store`.
    pub async fn custom(&self, url: &str, store: Option<&str>, options: QueryOptions) -> Value {
        let mut request = QueryRequest::new(url).options(options);
        request.store = store.map(str::to_string);
        self.query(request).await
    }

    /// Runs one read. Never fails: errors come back as `{ "error": ... }`.
    pub async fn query(&self, mut request: QueryRequest) -> Value {
        request.bind_positional();
        let QueryRequest {
            url: template,
            store,
            options,
            ..
        } = request;

        let cache_key = store
            .as_deref()
            .filter(|_| !options.no_cache)
            .and_then(|table| self.cache_key(table, &options.params).map(|key| (table, key)));

        if let Some((table, key)) = &cache_key {
            if !options.refresh_cache {
                if let Some(entry) = self.cache.find(table, FindQuery::matching(key.clone())).await {
                    debug!(table = %table, url = %template, "Cache hit");
                    return entry.data;
                }
            }
        }

        let mut params = options.params.clone();
        let path = match substitute(&template, &mut params) {
            Ok(path) => path,
            Err(e) => {
                warn!(url = %template, error = %e, "Rejected request");
                return e.into_payload();
            }
        };

        let unlimited = options.is_unlimited();
        if unlimited {
            params.remove(LIMIT_PARAM);
        }
        // Over-fetch only when a filter may shrink pages below the quota.
        let quota = options
            .filter
            .as_ref()
            .and(options.requested_limit())
            .filter(|limit| *limit > 0)
            .map(|limit| limit as usize);

        let url = self.resolve(&path);
        let query = encode_params(&params);

        let mut result = match self.fetch_page(&url, &query, &options).await {
            Ok(page) => page,
            Err(e) => return e.into_payload(),
        };

        let mut pages = 1;
        loop {
            let wants_more = unlimited || quota.is_some_and(|q| result_count(&result) < q);
            if !wants_more || !has_next_token(&result) {
                break;
            }
            if pages >= MAX_PAGES {
                warn!(url = %url, pages, "Pagination ceiling reached");
                break;
            }
            let Some(token) = take_next_token(&mut result) else {
                break;
            };

            let mut page_query: Vec<(String, String)> =
                query.iter().filter(|(k, _)| k != NEXT_PARAM).cloned().collect();
            page_query.push((NEXT_PARAM.to_string(), token));

            match self.fetch_page(&url, &page_query, &options).await {
                Ok(page) => merge_page(&mut result, page),
                Err(e) => return e.into_payload(),
            }
            pages += 1;
        }
        if pages > 1 {
            info!(url = %url, pages, results = result_count(&result), "Merged pages");
        }

        if let Some((table, key)) = cache_key {
            if !is_error(&result) {
                if let Err(e) = self.cache.queue_save(table, result.clone(), key) {
                    warn!(table = %table, error = %e, "Failed to cache result");
                }
            }
        }
        result
    }

    /// Fetches one page and runs it through normalization, addons and the filter.
    async fn fetch_page(
        &self,
        url: &str,
        query: &[(String, String)],
        options: &QueryOptions,
    ) -> Result<Value, QueryError> {
        let raw = self
            .limiter
            .limit(|| self.transport.get(url, query))
            .await
            .map_err(|e| {
                warn!(url = %url, error = %e, "Upstream request failed");
                e
            })?;

        let mut page = camelize_keys(raw);
        if let Some(addons) = &options.addons {
            addons::apply(&mut page, addons).await;
        }
        if let Some(filter) = &options.filter {
            apply_filter(&mut page, filter);
        }
        Ok(page)
    }

    /// Builds the lookup object for `table` from the caller's parameters.
    ///
    /// Tables indexed on `params` take the whole object; custom indexes take
    /// their named fields, and a missing field disables caching.
    fn cache_key(&self, table: &str, params: &Map<String, Value>) -> Option<Map<String, Value>> {
        let fields = self
            .cache
            .key_fields(table)
            .unwrap_or_else(|| vec![PARAMS_FIELD.to_string()]);

        let mut key = Map::new();
        for field in fields {
            if field == PARAMS_FIELD {
                key.insert(field, Value::Object(params.clone()));
            } else if let Some(value) = params.get(&field) {
                key.insert(field, value.clone());
            } else {
                debug!(table = %table, field = %field, "Key field missing, not caching");
                return None;
            }
        }
        Some(key)
    }

    fn resolve(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

/// Upstream query pairs: kebab-case keys, stringified values, nulls dropped.
fn encode_params(params: &Map<String, Value>) -> Vec<(String, String)> {
    params
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (to_kebab(k), param_string(v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addons::{addon_fn, Addons};
    use crate::config::{CacheConfig, RateLimitConfig};
    use crate::storage::MemoryBackend;
    use async_trait::async_trait;
    use serde_json::json;
    use crate::error::StorageError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    type Responder = Box<dyn Fn(usize, &[(String, String)]) -> Result<Value, QueryError> + Send + Sync>;

    /// Scripted upstream recording every call.
    struct MockTransport {
        calls: Mutex<Vec<(String, Vec<(String, String)>)>>,
        respond: Responder,
    }

    impl MockTransport {
        fn new<F>(respond: F) -> Arc<Self>
        where
            F: Fn(usize, &[(String, String)]) -> Result<Value, QueryError> + Send + Sync + 'static,
        {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                respond: Box::new(respond),
            })
        }

        /// Serves `pages` in order, then repeats the last one.
        fn pages(pages: Vec<Value>) -> Arc<Self> {
            Self::new(move |n, _| Ok(pages[n.min(pages.len() - 1)].clone()))
        }

        fn calls(&self) -> Vec<(String, Vec<(String, String)>)> {
            self.calls.lock().unwrap().clone()
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn get(&self, url: &str, query: &[(String, String)]) -> Result<Value, QueryError> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((url.to_string(), query.to_vec()));
                calls.len() - 1
            };
            (self.respond)(n, query)
        }
    }

    async fn orchestrator(transport: Arc<MockTransport>) -> QueryOrchestrator {
        let cache = CacheEngine::new(Arc::new(MemoryBackend::new()), &CacheConfig::default()).unwrap();
        cache.open().await.unwrap();
        orchestrator_with_cache(cache, transport)
    }

    fn orchestrator_with_cache(cache: CacheEngine, transport: Arc<MockTransport>) -> QueryOrchestrator {
        QueryOrchestrator::new(
            "http://indexer.test/",
            cache,
            RateLimiter::new(RateLimitConfig::default()),
            transport,
        )
    }

    fn fast_reopen() -> CacheConfig {
        CacheConfig {
            reopen_delay_ms: 10,
            ..CacheConfig::default()
        }
    }

    fn block_request(round: u64) -> QueryRequest {
        QueryRequest::new("/v2/blocks/:round").store("block").positional([round])
    }

    async fn wait_for_entry(cache: &CacheEngine, round: u64) -> Value {
        let mut key = Map::new();
        key.insert(PARAMS_FIELD.to_string(), json!({"round": round}));
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if let Some(entry) = cache.find("block", FindQuery::matching(key.clone())).await {
                    return entry.data;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("result was never cached")
    }

    fn has_param(query: &[(String, String)], name: &str) -> bool {
        query.iter().any(|(k, _)| k == name)
    }

    #[tokio::test]
    async fn test_pagination_merge() {
        let transport = MockTransport::pages(vec![
            json!({"items": ["a", "b"], "next-token": "x"}),
            json!({"items": ["c"]}),
        ]);
        let orchestrator = orchestrator(transport.clone()).await;

        let result = orchestrator
            .query(QueryRequest::new("/v2/items").options(QueryOptions::new().unlimited()))
            .await;

        assert_eq!(result, json!({"items": ["a", "b", "c"]}));
        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "http://indexer.test/v2/items");
        assert!(calls[1].1.contains(&("next".to_string(), "x".to_string())));
    }

    #[tokio::test]
    async fn test_unlimited_strips_limit() {
        let transport = MockTransport::pages(vec![
            json!({"txns": [1], "next-token": "p2"}),
            json!({"txns": [2], "next-token": "p3"}),
            json!({"txns": [3]}),
        ]);
        let orchestrator = orchestrator(transport.clone()).await;

        let result = orchestrator
            .query(
                QueryRequest::new("/v2/transactions")
                    .options(QueryOptions::new().unlimited().param("minRound", 10)),
            )
            .await;

        assert_eq!(result["txns"], json!([1, 2, 3]));
        for (_, query) in transport.calls() {
            assert!(!has_param(&query, "limit"));
            assert!(query.contains(&("min-round".to_string(), "10".to_string())));
        }
    }

    #[tokio::test]
    async fn test_token_kept_without_pagination() {
        let transport = MockTransport::pages(vec![json!({"items": [1], "next-token": "more"})]);
        let orchestrator = orchestrator(transport.clone()).await;

        let result = orchestrator
            .query(QueryRequest::new("/v2/items").options(QueryOptions::new().limit(1)))
            .await;

        assert_eq!(transport.call_count(), 1);
        assert_eq!(result["nextToken"], "more");
        assert_eq!(transport.calls()[0].1, vec![("limit".to_string(), "1".to_string())]);
    }

    #[tokio::test]
    async fn test_filter_over_fetches_to_quota() {
        // Every page holds one even and one odd number.
        let transport = MockTransport::new(|n, _| {
            let base = (n as i64) * 2;
            Ok(json!({"numbers": [base, base + 1], "next-token": format!("t{}", n + 1)}))
        });
        let orchestrator = orchestrator(transport.clone()).await;

        let options = QueryOptions::new()
            .limit(3)
            .filter(|v| v.as_i64().map(|n| n % 2 == 0).unwrap_or(false));
        let result = orchestrator
            .query(QueryRequest::new("/v2/numbers").options(options))
            .await;

        assert_eq!(result["numbers"], json!([0, 2, 4]));
        assert_eq!(transport.call_count(), 3);
        // The quota is still sent upstream.
        assert!(has_param(&transport.calls()[0].1, "limit"));
    }

    #[tokio::test]
    async fn test_pagination_ceiling() {
        let transport = MockTransport::new(|n, _| Ok(json!({"items": [n], "next-token": "again"})));
        let orchestrator = orchestrator(transport.clone()).await;

        let result = orchestrator
            .query(
                QueryRequest::new("/v2/items")
                    .options(QueryOptions::new().unlimited().no_cache()),
            )
            .await;

        assert_eq!(transport.call_count(), MAX_PAGES);
        assert_eq!(result["items"].as_array().unwrap().len(), MAX_PAGES);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let transport = MockTransport::new(|_, _| {
            Err(QueryError::Network {
                url: "http://indexer.test/v2/blocks/5".to_string(),
                message: "connection refused".to_string(),
            })
        });
        let orchestrator = orchestrator(transport.clone()).await;
        let request = || QueryRequest::new("/v2/blocks/:round").store("block").positional([5]);

        let first = orchestrator.query(request()).await;
        assert!(is_error(&first));
        assert_eq!(first["error"]["kind"], "network");

        let second = orchestrator.query(request()).await;
        assert!(is_error(&second));
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_error_mid_pagination_short_circuits() {
        let transport = MockTransport::new(|n, _| match n {
            0 => Ok(json!({"items": [1], "next-token": "x"})),
            _ => Err(QueryError::Status {
                url: "http://indexer.test/v2/items".to_string(),
                status: 500,
                body: json!({"message": "boom"}),
            }),
        });
        let orchestrator = orchestrator(transport.clone()).await;

        let result = orchestrator
            .query(
                QueryRequest::new("/v2/items")
                    .store("transactions")
                    .options(QueryOptions::new().unlimited()),
            )
            .await;

        assert_eq!(result["error"]["status"], 500);
        assert!(orchestrator
            .cache()
            .find("transactions", FindQuery::new())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_invalid_url_makes_no_call() {
        let transport = MockTransport::pages(vec![json!({})]);
        let orchestrator = orchestrator(transport.clone()).await;

        let result = orchestrator
            .query(QueryRequest::new("/v2/accounts/:accountId").store("account"))
            .await;

        assert_eq!(result["error"]["url"], "/v2/accounts/:accountId");
        assert!(result["error"]["message"].is_string());
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cache_hit_bypasses_addons() {
        let transport = MockTransport::pages(vec![json!({
            "accounts": [{"address": "A"}, {"address": "B"}],
            "applications": [{"id": 1}],
        })]);
        let orchestrator = orchestrator(transport.clone()).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let spy = {
            let calls = calls.clone();
            addon_fn("tag", move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!("tagged"))
            })
        };
        let request = || {
            QueryRequest::new("/v2/accounts").store("accounts").options(
                QueryOptions::new()
                    .param("limit", 2)
                    .addons(Addons::for_field("accounts", vec![spy.clone()])),
            )
        };

        let first = orchestrator.query(request()).await;
        assert_eq!(first["accounts"][0]["addons"]["tag"], "tagged");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let second = orchestrator.query(request()).await;
        assert_eq!(second, first);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_and_no_cache() {
        let transport = MockTransport::new(|n, _| Ok(json!({"round": n})));
        let orchestrator = orchestrator(transport.clone()).await;
        let request = |options: QueryOptions| {
            QueryRequest::new("/v2/blocks/:round")
                .store("block")
                .positional([42])
                .options(options)
        };

        assert_eq!(orchestrator.query(request(QueryOptions::new())).await["round"], 0);
        assert_eq!(orchestrator.query(request(QueryOptions::new())).await["round"], 0);

        // Refresh skips the lookup but stores the new payload.
        let refreshed = orchestrator
            .query(request(QueryOptions::new().refresh_cache()))
            .await;
        assert_eq!(refreshed["round"], 1);
        assert_eq!(orchestrator.query(request(QueryOptions::new())).await["round"], 1);

        // No-cache neither reads nor writes.
        let uncached = orchestrator.query(request(QueryOptions::new().no_cache())).await;
        assert_eq!(uncached["round"], 2);
        assert_eq!(orchestrator.query(request(QueryOptions::new())).await["round"], 1);
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn test_transient_cache_write_failure_does_not_block() {
        let transport = MockTransport::new(|_, _| Ok(json!({"round": 5, "txn-counter": 1})));
        let backend = Arc::new(MemoryBackend::new());
        let cache = CacheEngine::new(backend.clone(), &fast_reopen()).unwrap();
        cache.open().await.unwrap();
        let orchestrator = orchestrator_with_cache(cache.clone(), transport.clone());

        backend.fail_next(StorageError::Backend("disk".to_string()));
        backend.fail_next(StorageError::Backend("disk".to_string()));

        let result = tokio::time::timeout(
            Duration::from_secs(3),
            orchestrator.query(block_request(5).options(QueryOptions::new().refresh_cache())),
        )
        .await
        .expect("query blocked on a failing cache write");
        assert_eq!(result["txnCounter"], 1);

        // The requeued write lands once storage recovers.
        assert_eq!(wait_for_entry(&cache, 5).await["round"], 5);
        assert!(cache.stats().requeues >= 1);
    }

    #[tokio::test]
    async fn test_query_served_while_cache_fails_to_open() {
        let transport = MockTransport::new(|n, _| Ok(json!({"round": 8, "fetch": n})));
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_next(StorageError::Backend("locked".to_string()));
        let cache = CacheEngine::new(backend.clone(), &fast_reopen()).unwrap();
        let opener = cache.open_in_background();
        let orchestrator = orchestrator_with_cache(cache.clone(), transport.clone());

        let result = tokio::time::timeout(Duration::from_secs(3), orchestrator.query(block_request(8)))
            .await
            .expect("query blocked on an unopened cache");
        assert_eq!(result["fetch"], 0);

        opener.await.unwrap();
        assert_eq!(wait_for_entry(&cache, 8).await["fetch"], 0);
        assert!(cache.is_ready());

        // Served from the cache after the background reopen.
        let cached = orchestrator.query(block_request(8)).await;
        assert_eq!(cached["fetch"], 0);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_key_case_normalization() {
        let transport = MockTransport::pages(vec![json!({"current-round": 7, "asset": {"created-at-round": 3}})]);
        let orchestrator = orchestrator(transport.clone()).await;

        let result = orchestrator
            .query(
                QueryRequest::new("/v2/assets/:assetId")
                    .options(QueryOptions::new().param("assetId", 9).param("includeAll", true)),
            )
            .await;

        assert_eq!(result, json!({"currentRound": 7, "asset": {"createdAtRound": 3}}));
        let (url, query) = &transport.calls()[0];
        assert_eq!(url, "http://indexer.test/v2/assets/9");
        assert_eq!(query, &vec![("include-all".to_string(), "true".to_string())]);
    }

    #[tokio::test]
    async fn test_custom_endpoint() {
        let transport = MockTransport::pages(vec![json!({"ok": true})]);
        let orchestrator = orchestrator(transport.clone()).await;

        let result = orchestrator
            .custom("https://other.test/v1/status", None, QueryOptions::new())
            .await;

        assert_eq!(result["ok"], true);
        assert_eq!(transport.calls()[0].0, "https://other.test/v1/status");
    }

    #[test]
    fn test_encode_params() {
        let mut params = Map::new();
        params.insert("addressRole".to_string(), json!("sender"));
        params.insert("skip".to_string(), Value::Null);
        params.insert("round".to_string(), json!(5));

        assert_eq!(
            encode_params(&params),
            vec![
                ("address-role".to_string(), "sender".to_string()),
                ("round".to_string(), "5".to_string()),
            ]
        );
    }
}
