//! Indexer Client - a caching read client for a blockchain indexer REST API
//!
//! Provides rate limited, auto-paginating reads with a TTL cache over a
//! pluggable storage backend and an addon pipeline for post-processing.

pub mod addons;
pub mod batch;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod limiter;
pub mod models;
pub mod query;
pub mod storage;
pub mod tasks;

pub use addons::{addon_fn, Addon, Addons};
pub use batch::BatchScheduler;
pub use cache::{CacheEngine, CacheEntry, FindQuery};
pub use client::IndexerClient;
pub use config::{CacheConfig, Config, RateLimitConfig, TableConfig};
pub use error::{CacheError, ConfigError, QueryError, StorageError};
pub use limiter::RateLimiter;
pub use models::{is_error, QueryOptions, QueryRequest};
pub use query::{HttpTransport, QueryOrchestrator, Transport};
pub use storage::{MemoryBackend, StorageBackend};
pub use tasks::spawn_prune_task;
