//! Request and payload models for the query orchestrator
//!
//! Requests are typed; payloads stay as `serde_json::Value` since the
//! upstream schema is open-ended.

pub mod requests;
pub mod responses;

// Re-export commonly used types
pub use requests::{
    param_string, placeholders, substitute, PayloadFilter, QueryOptions, QueryRequest, LIMIT_PARAM,
    UNLIMITED,
};
pub use responses::{
    apply_filter, has_next_token, is_error, merge_page, result_count, take_next_token,
    NEXT_PARAM, NEXT_TOKEN_FIELD,
};
