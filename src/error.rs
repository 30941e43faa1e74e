//! Error types for the indexer client
//!
//! Provides unified error handling using thiserror.

use serde_json::{json, Value};
use thiserror::Error;

// == Storage Error Enum ==
/// Failures reported by a storage backend, classified by how the cache
/// engine recovers from them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Version, upgrade or schema mismatch. Fatal to the open handle.
    #[error("Schema error: {0}")]
    Schema(String),

    /// The backend handle is closed
    #[error("Storage backend is closed")]
    Closed,

    /// A table is not part of the opened schema yet
    #[error("Missing table: {0}")]
    MissingTable(String),

    /// Any other backend failure
    #[error("Backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Maps a backend error name onto the recovery taxonomy.
    ///
    /// Backends that surface errors by name (`VersionError`,
    /// `DatabaseClosedError`, ...) go through here.
    pub fn classify(name: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match name {
            "UpgradeError" | "VersionError" | "SchemaError" | "VersionChangeError" => {
                StorageError::Schema(message)
            }
            "DatabaseClosedError" | "ClosedError" => StorageError::Closed,
            "InvalidTableError" | "NotFoundError" => StorageError::MissingTable(message),
            _ => StorageError::Backend(format!("{}: {}", name, message)),
        }
    }
}

/// Convenience Result type for storage backends.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// == Query Error Enum ==
/// Failures of a single upstream request.
///
/// These never escape the orchestrator: they are folded into an
/// `{ "error": ... }` payload.
#[derive(Error, Debug)]
pub enum QueryError {
    /// Transport-level failure (connection refused, timeout, ...)
    #[error("Network error for {url}: {message}")]
    Network { url: String, message: String },

    /// Upstream answered with a non-2xx status
    #[error("Upstream returned {status} for {url}")]
    Status {
        url: String,
        status: u16,
        body: Value,
    },

    /// Response body was not valid JSON
    #[error("Invalid response body from {url}: {message}")]
    Decode { url: String, message: String },

    /// URL template still contains an unsubstituted placeholder
    #[error("Missing value for placeholder :{placeholder}")]
    InvalidUrl { url: String, placeholder: String },
}

impl QueryError {
    /// Converts the error into the payload shape returned to callers.
    pub fn into_payload(self) -> Value {
        let message = self.to_string();
        let detail = match self {
            QueryError::Network { url, .. } => json!({
                "kind": "network",
                "message": message,
                "url": url,
            }),
            QueryError::Status { url, status, body } => json!({
                "kind": "status",
                "message": message,
                "status": status,
                "url": url,
                "body": body,
            }),
            QueryError::Decode { url, .. } => json!({
                "kind": "decode",
                "message": message,
                "url": url,
            }),
            QueryError::InvalidUrl { url, .. } => json!({
                "kind": "validation",
                "message": message,
                "url": url,
            }),
        };
        json!({ "error": detail })
    }
}

// == Config Error Enum ==
/// Invalid configuration values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Duration string could not be parsed
    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    /// Numeric environment value could not be parsed
    #[error("Invalid number for {key}: {value}")]
    InvalidNumber { key: String, value: String },

    /// Table index expression is empty or malformed
    #[error("Invalid index for table {table}: {index}")]
    InvalidIndex { table: String, index: String },

    /// HTTP client could not be built (bad token header, TLS setup)
    #[error("HTTP client setup failed: {0}")]
    HttpClient(String),
}

// == Cache Error Enum ==
/// Unified error type for the cache engine surface.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Storage backend failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Configuration failure
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Table is not registered with the engine
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// The engine worker is gone and the operation cannot complete
    #[error("Cache engine stopped")]
    Stopped,
}

// == Result Type Alias ==
/// Convenience Result type for the cache engine.
pub type Result<T> = std::result::Result<T, CacheError>;
