//! Cache Prune Task
//!
//! Background task that periodically removes expired rows from the cache
//! backend. Expired rows are already invisible to reads; pruning only
//! reclaims storage.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::CacheEngine;

/// Spawns a task that calls [`CacheEngine::prune_if_due`] every `interval`.
///
/// The engine gates each run on the last prune time it persisted, so
/// restarting a client does not prune early. Abort the returned handle to
/// stop the task.
///
/// # Example
/// ```ignore
/// let handle = spawn_prune_task(engine.clone(), Duration::from_secs(3600));
/// // Later, during shutdown:
/// handle.abort();
/// ```
pub fn spawn_prune_task(engine: CacheEngine, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_ms = interval.as_millis() as u64, "Starting cache prune task");

        loop {
            tokio::time::sleep(interval).await;

            match engine.prune_if_due().await {
                Ok(counts) => {
                    let removed: usize = counts.values().sum();
                    if removed > 0 {
                        info!(removed, tables = counts.len(), "Cache prune: removed expired rows");
                    } else {
                        debug!("Cache prune: no expired rows found");
                    }
                }
                Err(e) => warn!(error = %e, "Cache prune failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::storage::MemoryBackend;
    use serde_json::{json, Map};
    use std::sync::Arc;

    fn engine_with(backend: Arc<MemoryBackend>) -> CacheEngine {
        let mut config = CacheConfig::default();
        config.expiration.insert("block".to_string(), "100ms".to_string());
        config.prune_interval = Some("200ms".to_string());
        CacheEngine::new(backend, &config).unwrap()
    }

    fn key(round: u64) -> Map<String, serde_json::Value> {
        let mut key = Map::new();
        key.insert("params".to_string(), json!({ "round": round }));
        key
    }

    #[tokio::test]
    async fn test_prune_task_removes_expired_rows() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = engine_with(backend.clone());
        engine.open().await.unwrap();

        engine.save("block", json!({"round": 1}), key(1)).await.unwrap();
        assert_eq!(backend.row_count("block"), 1);

        let handle = spawn_prune_task(engine.clone(), Duration::from_millis(250));

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(backend.row_count("block"), 0);

        handle.abort();
    }

    #[tokio::test]
    async fn test_prune_task_preserves_live_rows() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = engine_with(backend.clone());
        engine.open().await.unwrap();

        engine.save("account", json!({"address": "A"}), key(1)).await.unwrap();

        let handle = spawn_prune_task(engine.clone(), Duration::from_millis(100));
        tokio::time::sleep(Duration::from_millis(450)).await;

        assert_eq!(backend.row_count("account"), 1);
        handle.abort();
    }

    #[tokio::test]
    async fn test_prune_task_can_be_aborted() {
        let engine = engine_with(Arc::new(MemoryBackend::new()));

        let handle = spawn_prune_task(engine, Duration::from_secs(1));
        handle.abort();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.is_finished(), "Task should be finished after abort");
    }
}
