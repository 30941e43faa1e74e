//! Configuration Module
//!
//! Handles loading and managing client configuration from environment variables.

use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use crate::error::ConfigError;

/// Default indexer endpoint.
pub const DEFAULT_BASE_URL: &str = "https://mainnet-idx.algonode.cloud";

/// Header carrying the API token, when one is configured.
pub const DEFAULT_TOKEN_HEADER: &str = "X-Indexer-API-Token";

/// Key of the fallback entry in the expiration map.
pub const DEFAULT_EXPIRATION_KEY: &str = "default";

/// Expiration applied when the map has no `default` entry.
pub const DEFAULT_EXPIRATION: &str = "1h";

/// Client configuration parameters.
///
/// Passed explicitly to every component at construction.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the upstream indexer API
    pub base_url: String,
    /// Optional API token sent with every request
    pub api_token: Option<String>,
    /// Header name used for `api_token`
    pub api_token_header: String,
    /// Cache engine settings
    pub cache: CacheConfig,
    /// Outbound rate limiting
    pub rate_limit: RateLimitConfig,
}

/// A caller-supplied table with an optional custom index expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableConfig {
    pub name: String,
    /// Comma-separated key fields, e.g. `"address, round"`. Defaults to `params`.
    pub index: Option<String>,
}

impl TableConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index: None,
        }
    }

    pub fn with_index(name: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index: Some(index.into()),
        }
    }
}

/// Cache engine configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Tables registered in addition to the built-in ones
    pub custom_tables: Vec<TableConfig>,
    /// Duration string per table (`"2s"`, `"1h"`, `"never"`); `default` is the fallback
    pub expiration: BTreeMap<String, String>,
    /// How often expired rows are physically removed; `None` disables pruning
    pub prune_interval: Option<String>,
    /// Tables that are never pruned
    pub persisted: Vec<String>,
    /// Cap on requeues of an operation whose table is missing; `None` retries forever
    pub max_requeue_attempts: Option<u32>,
    /// Pause between closing and reopening the backend after a schema failure
    pub reopen_delay_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let mut expiration = BTreeMap::new();
        expiration.insert(
            DEFAULT_EXPIRATION_KEY.to_string(),
            DEFAULT_EXPIRATION.to_string(),
        );
        Self {
            custom_tables: Vec::new(),
            expiration,
            prune_interval: None,
            persisted: Vec::new(),
            max_requeue_attempts: None,
            reopen_delay_ms: 100,
        }
    }
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Length of the rolling window in milliseconds
    pub interval_ms: u64,
    /// Maximum dispatches within one window
    pub rate: usize,
    /// Maximum calls in flight at once
    pub concurrency: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            rate: 50,
            concurrency: 10,
        }
    }
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `INDEXER_URL` - Upstream base URL (default: algonode mainnet)
    /// - `INDEXER_TOKEN` - Optional API token
    /// - `INDEXER_TOKEN_HEADER` - Header for the token (default: `X-Indexer-API-Token`)
    /// - `CACHE_DEFAULT_EXPIRATION` - Fallback table expiration (default: `1h`)
    /// - `CACHE_PRUNE_INTERVAL` - Pruning interval, unset disables pruning
    /// - `RATE_LIMIT_INTERVAL_MS` - Rate window (default: 1000)
    /// - `RATE_LIMIT_RATE` - Calls per window (default: 50)
    /// - `RATE_LIMIT_CONCURRENCY` - Calls in flight (default: 10)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let mut cache = CacheConfig::default();
        if let Ok(value) = env::var("CACHE_DEFAULT_EXPIRATION") {
            parse_expiration(&value)?;
            cache
                .expiration
                .insert(DEFAULT_EXPIRATION_KEY.to_string(), value);
        }
        if let Ok(value) = env::var("CACHE_PRUNE_INTERVAL") {
            parse_duration(&value)?;
            cache.prune_interval = Some(value);
        }

        Ok(Self {
            base_url: env::var("INDEXER_URL").unwrap_or(defaults.base_url),
            api_token: env::var("INDEXER_TOKEN").ok().filter(|t| !t.is_empty()),
            api_token_header: env::var("INDEXER_TOKEN_HEADER")
                .unwrap_or(defaults.api_token_header),
            cache,
            rate_limit: RateLimitConfig {
                interval_ms: env_number("RATE_LIMIT_INTERVAL_MS", defaults.rate_limit.interval_ms)?,
                rate: env_number("RATE_LIMIT_RATE", defaults.rate_limit.rate)?,
                concurrency: env_number(
                    "RATE_LIMIT_CONCURRENCY",
                    defaults.rate_limit.concurrency,
                )?,
            },
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_token: None,
            api_token_header: DEFAULT_TOKEN_HEADER.to_string(),
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

fn env_number<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
            key: key.to_string(),
            value,
        }),
        Err(_) => Ok(default),
    }
}

// == Duration Strings ==
/// Parses a duration string such as `"250ms"`, `"2s"`, `"5m"`, `"1h"`, `"1d"` or `"2w"`.
///
/// A bare number is read as milliseconds.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let amount: f64 = number
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(input.to_string()))?;

    let unit_ms = match unit.trim() {
        "" | "ms" => 1.0,
        "s" | "sec" | "secs" | "second" | "seconds" => 1_000.0,
        "m" | "min" | "mins" | "minute" | "minutes" => 60_000.0,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600_000.0,
        "d" | "day" | "days" => 86_400_000.0,
        "w" | "week" | "weeks" => 604_800_000.0,
        _ => return Err(ConfigError::InvalidDuration(input.to_string())),
    };

    Ok(Duration::from_millis((amount * unit_ms).round() as u64))
}

/// Parses an expiration string; `"never"` yields `None`.
pub fn parse_expiration(input: &str) -> Result<Option<Duration>, ConfigError> {
    if input.trim().eq_ignore_ascii_case("never") {
        return Ok(None);
    }
    parse_duration(input).map(Some)
}
