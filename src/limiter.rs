//! Rate Limiter Module
//!
//! Bounds outbound calls both by concurrency and by a rolling time window.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimitConfig;

// == Rate Limiter ==
/// Gate for outbound calls.
///
/// At most `rate` calls are dispatched within any rolling `interval`, and at
/// most `concurrency` are in flight. Waiting callers are served in FIFO order.
#[derive(Clone)]
pub struct RateLimiter {
    slots: Arc<Semaphore>,
    /// Dispatch times within the current window
    window: Arc<Mutex<VecDeque<Instant>>>,
    rate: usize,
    interval: Duration,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(config.concurrency.max(1))),
            window: Arc::new(Mutex::new(VecDeque::new())),
            rate: config.rate.max(1),
            interval: Duration::from_millis(config.interval_ms),
        }
    }

    /// Runs `f` once a concurrency slot and a window slot are free.
    pub async fn limit<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        // The semaphore only closes on drop, and we hold an Arc to it.
        let _permit = self.slots.acquire().await.ok();
        self.wait_for_window().await;
        f().await
    }

    async fn wait_for_window(&self) {
        // The async mutex is fair, so window slots go out in arrival order.
        let mut window = self.window.lock().await;
        loop {
            let now = Instant::now();
            while let Some(oldest) = window.front() {
                if now.duration_since(*oldest) >= self.interval {
                    window.pop_front();
                } else {
                    break;
                }
            }

            if window.len() < self.rate {
                window.push_back(now);
                return;
            }

            if let Some(oldest) = window.front().copied() {
                let wait_until = oldest + self.interval;
                debug!(wait_ms = (wait_until - now).as_millis() as u64, "Rate limit reached, waiting");
                tokio::time::sleep_until(wait_until).await;
            }
        }
    }

    /// Calls currently allowed to start without waiting on concurrency.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}
