//! Batching Scheduler
//!
//! Coalesces many concurrent single-key lookups into periodic batch calls.
//! Pending keys are flushed on a fixed tick, or as soon as `max_batch`
//! distinct keys are waiting, whichever comes first.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, warn};

type FlushFn<V> = Arc<dyn Fn(Vec<String>) -> BoxFuture<'static, HashMap<String, V>> + Send + Sync>;

type Waiter<V> = oneshot::Sender<Option<V>>;

struct Pending<V> {
    /// Distinct keys in first-request order
    order: Vec<String>,
    waiters: HashMap<String, Vec<Waiter<V>>>,
}

impl<V> Default for Pending<V> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            waiters: HashMap::new(),
        }
    }
}

impl<V> Pending<V> {
    fn take(&mut self) -> Pending<V> {
        std::mem::take(self)
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

struct BatchInner<V> {
    pending: Mutex<Pending<V>>,
    flush: FlushFn<V>,
    max_batch: usize,
}

impl<V> BatchInner<V> {
    fn pending(&self) -> MutexGuard<'_, Pending<V>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// == Batch Scheduler ==
/// Shared handle to a batching scheduler.
pub struct BatchScheduler<V> {
    inner: Arc<BatchInner<V>>,
}

impl<V> Clone for BatchScheduler<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> BatchScheduler<V>
where
    V: Clone + Send + 'static,
{
    /// Creates a scheduler and starts its tick task.
    ///
    /// `flush` receives the distinct pending keys and returns the values it
    /// found; keys it leaves out resolve to `None`. Must be called inside a
    /// Tokio runtime.
    pub fn new<F, Fut>(tick: Duration, max_batch: usize, flush: F) -> Self
    where
        F: Fn(Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HashMap<String, V>> + Send + 'static,
    {
        let inner = Arc::new(BatchInner {
            pending: Mutex::new(Pending::default()),
            flush: Arc::new(move |keys| flush(keys).boxed()),
            max_batch: max_batch.max(1),
        });
        spawn_ticker(Arc::downgrade(&inner), tick);
        Self { inner }
    }

    /// Resolves `key` with the next batch that includes it.
    pub async fn request(&self, key: impl Into<String>) -> Option<V> {
        let key = key.into();
        let (tx, rx) = oneshot::channel();

        let full = {
            let mut pending = self.inner.pending();
            if !pending.waiters.contains_key(&key) {
                pending.order.push(key.clone());
            }
            pending.waiters.entry(key).or_default().push(tx);
            if pending.order.len() >= self.inner.max_batch {
                Some(pending.take())
            } else {
                None
            }
        };
        if let Some(batch) = full {
            debug!(keys = batch.order.len(), "Batch full, flushing");
            tokio::spawn(run_flush(self.inner.flush.clone(), batch));
        }

        rx.await.ok().flatten()
    }

    /// Distinct keys waiting for the next flush.
    pub fn pending_keys(&self) -> usize {
        self.inner.pending().order.len()
    }
}

fn spawn_ticker<V>(inner: Weak<BatchInner<V>>, tick: Duration)
where
    V: Clone + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(scheduler) = inner.upgrade() else {
                debug!("Batch scheduler dropped, stopping ticker");
                break;
            };
            let batch = scheduler.pending().take();
            if !batch.is_empty() {
                debug!(keys = batch.order.len(), "Tick, flushing batch");
                tokio::spawn(run_flush(scheduler.flush.clone(), batch));
            }
        }
    });
}

async fn run_flush<V>(flush: FlushFn<V>, batch: Pending<V>)
where
    V: Clone + Send + 'static,
{
    let Pending { order, mut waiters } = batch;
    let results = flush(order.clone()).await;

    let mut missing = 0;
    for key in order {
        let value = results.get(&key).cloned();
        if value.is_none() {
            missing += 1;
        }
        for waiter in waiters.remove(&key).unwrap_or_default() {
            // The caller may have stopped waiting.
            let _ = waiter.send(value.clone());
        }
    }
    if missing > 0 {
        warn!(missing, "Batch flush returned no value for some keys");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn recorder() -> (
        Arc<Mutex<Vec<Vec<String>>>>,
        impl Fn(Vec<String>) -> BoxFuture<'static, HashMap<String, usize>> + Send + Sync + 'static,
    ) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let seen = batches.clone();
        let flush = move |keys: Vec<String>| {
            seen.lock().unwrap().push(keys.clone());
            async move {
                keys.into_iter()
                    .filter(|k| k != "missing")
                    .map(|k| {
                        let len = k.len();
                        (k, len)
                    })
                    .collect()
            }
            .boxed()
        };
        (batches, flush)
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesces_on_tick() {
        let (batches, flush) = recorder();
        let scheduler = BatchScheduler::new(Duration::from_millis(50), 100, flush);

        let a1 = tokio::spawn({
            let s = scheduler.clone();
            async move { s.request("aa").await }
        });
        let b = tokio::spawn({
            let s = scheduler.clone();
            async move { s.request("bbb").await }
        });
        let a2 = tokio::spawn({
            let s = scheduler.clone();
            async move { s.request("aa").await }
        });

        assert_eq!(a1.await.unwrap(), Some(2));
        assert_eq!(b.await.unwrap(), Some(3));
        assert_eq!(a2.await.unwrap(), Some(2));

        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        assert!(batches[0].contains(&"aa".to_string()));
        assert!(batches[0].contains(&"bbb".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flushes_when_full() {
        let (batches, flush) = recorder();
        let tick = Duration::from_secs(3600);
        let scheduler = BatchScheduler::new(tick, 2, flush);
        let start = Instant::now();

        let first = tokio::spawn({
            let s = scheduler.clone();
            async move { s.request("x").await }
        });
        tokio::task::yield_now().await;
        assert_eq!(scheduler.pending_keys(), 1);

        assert_eq!(scheduler.request("yy").await, Some(2));
        assert_eq!(first.await.unwrap(), Some(1));
        assert!(start.elapsed() < tick);
        assert_eq!(batches.lock().unwrap().len(), 1);
        assert_eq!(scheduler.pending_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_key_resolves_none() {
        let (_, flush) = recorder();
        let scheduler = BatchScheduler::new(Duration::from_millis(10), 10, flush);

        assert_eq!(scheduler.request("missing").await, None);
    }
}
