//! Query request models
//!
//! Describes one logical read: the URL template, the cache table, the
//! caller's parameters and the orchestration-only options.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::addons::Addons;
use crate::error::QueryError;

/// Parameter name carrying the result quota.
pub const LIMIT_PARAM: &str = "limit";

/// Limit value requesting every page.
pub const UNLIMITED: i64 = -1;

/// Predicate applied to each item of a fetched page.
pub type PayloadFilter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

// == Query Options ==
/// Caller parameters plus options that never reach the upstream API or the cache key.
#[derive(Clone, Default)]
pub struct QueryOptions {
    /// Upstream parameters in canonical (camelCase) form
    pub params: Map<String, Value>,
    pub addons: Option<Addons>,
    pub filter: Option<PayloadFilter>,
    /// Skip the cache lookup but still store the result
    pub refresh_cache: bool,
    /// Neither read nor write the cache
    pub no_cache: bool,
}

impl fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("params", &self.params)
            .field("addons", &self.addons)
            .field("filter", &self.filter.is_some())
            .field("refresh_cache", &self.refresh_cache)
            .field("no_cache", &self.no_cache)
            .finish()
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options carrying the given parameter object.
    pub fn with_params(params: Map<String, Value>) -> Self {
        Self {
            params,
            ..Self::default()
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn limit(self, limit: i64) -> Self {
        self.param(LIMIT_PARAM, limit)
    }

    /// Follows next tokens until the last page.
    pub fn unlimited(self) -> Self {
        self.limit(UNLIMITED)
    }

    pub fn addons(mut self, addons: Addons) -> Self {
        self.addons = Some(addons);
        self
    }

    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(predicate));
        self
    }

    pub fn refresh_cache(mut self) -> Self {
        self.refresh_cache = true;
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    /// The `limit` parameter, if numeric.
    pub fn requested_limit(&self) -> Option<i64> {
        let limit = self.params.get(LIMIT_PARAM)?;
        limit
            .as_i64()
            .or_else(|| limit.as_str().and_then(|s| s.trim().parse().ok()))
    }

    pub fn is_unlimited(&self) -> bool {
        self.requested_limit() == Some(UNLIMITED)
    }
}

// == Query Request ==
/// A single read against the upstream API.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// Path or absolute URL, possibly with `:placeholders`
    pub url: String,
    /// Cache table, if the result is cacheable
    pub store: Option<String>,
    /// Values bound in order to the URL placeholders
    pub positional: Vec<Value>,
    pub options: QueryOptions,
}

impl QueryRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            store: None,
            positional: Vec::new(),
            options: QueryOptions::default(),
        }
    }

    pub fn store(mut self, store: impl Into<String>) -> Self {
        self.store = Some(store.into());
        self
    }

    pub fn positional<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.positional = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    /// Folds positional values into the parameters under their placeholder names.
    ///
    /// Explicit parameters win over positional ones. Extra positional values
    /// are ignored.
    pub fn bind_positional(&mut self) {
        let names = placeholders(&self.url);
        for (name, value) in names.into_iter().zip(self.positional.drain(..)) {
            if value.is_null() {
                continue;
            }
            self.options.params.entry(name).or_insert(value);
        }
    }
}

// == URL Templates ==
/// A URL template split into literal text and placeholder names.
enum Piece<'t> {
    Text(&'t str),
    Placeholder(&'t str),
}

/// Splits `template` in a single pass.
///
/// A placeholder is `:` followed by a letter or underscore, then letters,
/// digits, `_` or `-`. Ports (`:8080`) and schemes (`https://`) never match.
fn pieces(template: &str) -> Vec<Piece<'_>> {
    let bytes = template.as_bytes();
    let mut pieces = Vec::new();
    let mut text_start = 0;
    let mut i = 0;
    while i < bytes.len() {
        let starts_name = bytes[i] == b':'
            && bytes
                .get(i + 1)
                .is_some_and(|b| b.is_ascii_alphabetic() || *b == b'_');
        if !starts_name {
            i += 1;
            continue;
        }
        let mut end = i + 1;
        while end < bytes.len()
            && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_' || bytes[end] == b'-')
        {
            end += 1;
        }
        if text_start < i {
            pieces.push(Piece::Text(&template[text_start..i]));
        }
        pieces.push(Piece::Placeholder(&template[i + 1..end]));
        text_start = end;
        i = end;
    }
    if text_start < template.len() {
        pieces.push(Piece::Text(&template[text_start..]));
    }
    pieces
}

/// Placeholder names in `template`, in order of appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    pieces(template)
        .into_iter()
        .filter_map(|piece| match piece {
            Piece::Placeholder(name) => Some(name.to_string()),
            Piece::Text(_) => None,
        })
        .collect()
}

/// Substitutes placeholders from `params`, removing each consumed parameter.
///
/// Values are percent-encoded as path segments and never rescanned. Fails
/// with `params` untouched if a placeholder has no value.
pub fn substitute(template: &str, params: &mut Map<String, Value>) -> Result<String, QueryError> {
    let mut url = String::with_capacity(template.len());
    let mut consumed = Vec::new();
    for piece in pieces(template) {
        match piece {
            Piece::Text(text) => url.push_str(text),
            Piece::Placeholder(name) => {
                let Some(value) = params.get(name).filter(|v| !v.is_null()) else {
                    return Err(QueryError::InvalidUrl {
                        url: template.to_string(),
                        placeholder: name.to_string(),
                    });
                };
                url.push_str(&urlencoding::encode(&param_string(value)));
                consumed.push(name);
            }
        }
    }
    for name in consumed {
        params.remove(name);
    }
    Ok(url)
}

/// Upstream string form of a parameter value.
pub fn param_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(param_string).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_placeholders_in_order() {
        assert_eq!(
            placeholders("/v2/accounts/:accountId/transactions/:round"),
            vec!["accountId", "round"]
        );
        assert_eq!(placeholders("/v2/accounts/:account-id"), vec!["account-id"]);
    }

    #[test]
    fn test_placeholders_skip_ports_and_schemes() {
        assert!(placeholders("http://127.0.0.1:8980/v2/blocks").is_empty());
        assert_eq!(placeholders("https://host:443/v2/blocks/:round"), vec!["round"]);
    }

    #[test]
    fn test_substitute_consumes_params() {
        let mut params = Map::new();
        params.insert("assetId".to_string(), json!(31566704));
        params.insert("limit".to_string(), json!(10));

        let url = substitute("/v2/assets/:assetId/balances", &mut params).unwrap();
        assert_eq!(url, "/v2/assets/31566704/balances");
        assert!(!params.contains_key("assetId"));
        assert!(params.contains_key("limit"));
    }

    #[test]
    fn test_substitute_missing_placeholder() {
        let mut params = Map::new();
        let err = substitute("/v2/accounts/:accountId", &mut params).unwrap_err();
        assert!(matches!(
            err,
            QueryError::InvalidUrl { ref placeholder, .. } if placeholder == "accountId"
        ));
    }

    #[test]
    fn test_substituted_values_are_not_rescanned() {
        let mut params = Map::new();
        params.insert("id".to_string(), json!("a:round"));
        params.insert("round".to_string(), json!(7));

        let url = substitute("/v2/:id/:round", &mut params).unwrap();
        assert_eq!(url, "/v2/a%3Around/7");
        assert!(params.is_empty());
    }

    #[test]
    fn test_substitute_encodes_segments() {
        let mut params = Map::new();
        params.insert("txid".to_string(), json!("A B/C"));

        let url = substitute("https://host:443/v2/transactions/:txid?x=1", &mut params).unwrap();
        assert_eq!(url, "https://host:443/v2/transactions/A%20B%2FC?x=1");
    }

    #[test]
    fn test_failed_substitution_keeps_params() {
        let mut params = Map::new();
        params.insert("accountId".to_string(), json!("ADDR"));

        assert!(substitute("/v2/accounts/:accountId/assets/:assetId", &mut params).is_err());
        assert!(params.contains_key("accountId"));
    }

    #[test]
    fn test_bind_positional() {
        let mut request = QueryRequest::new("/v2/accounts/:accountId/assets/:assetId")
            .positional(["ADDR", "9"])
            .options(QueryOptions::new().param("assetId", 7));
        request.bind_positional();

        assert_eq!(request.options.params["accountId"], json!("ADDR"));
        // Explicit parameters take precedence.
        assert_eq!(request.options.params["assetId"], json!(7));
        assert!(request.positional.is_empty());
    }

    #[test]
    fn test_limit_helpers() {
        assert!(QueryOptions::new().unlimited().is_unlimited());
        assert_eq!(QueryOptions::new().limit(5).requested_limit(), Some(5));
        assert_eq!(
            QueryOptions::new().param("limit", "12").requested_limit(),
            Some(12)
        );
        assert_eq!(QueryOptions::new().requested_limit(), None);
    }

    #[test]
    fn test_param_string() {
        assert_eq!(param_string(&json!("abc")), "abc");
        assert_eq!(param_string(&json!(true)), "true");
        assert_eq!(param_string(&json!(["A", "B"])), "A,B");
    }
}
