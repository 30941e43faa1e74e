//! HTTP transport seam
//!
//! The orchestrator talks to the upstream through [`Transport`] so tests
//! can substitute a scripted upstream.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use crate::config::Config;
use crate::error::{ConfigError, QueryError};

// == Transport Trait ==
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issues a GET for `url` with already-encoded query pairs.
    async fn get(&self, url: &str, query: &[(String, String)]) -> Result<Value, QueryError>;
}

// == HTTP Transport ==
/// `reqwest` transport, sending the API token header when configured.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.api_token {
            let name = HeaderName::from_bytes(config.api_token_header.as_bytes())
                .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
            let value =
                HeaderValue::from_str(token).map_err(|e| ConfigError::HttpClient(e.to_string()))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str, query: &[(String, String)]) -> Result<Value, QueryError> {
        debug!(url = %url, params = query.len(), "GET");
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| QueryError::Network {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| QueryError::Network {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        if !status.is_success() {
            let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
            return Err(QueryError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&text).map_err(|e| QueryError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builds_without_token() {
        assert!(HttpTransport::new(&Config::default()).is_ok());
    }

    #[test]
    fn test_rejects_bad_token_header() {
        let config = Config {
            api_token: Some("secret".to_string()),
            api_token_header: "bad header".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            HttpTransport::new(&config),
            Err(ConfigError::HttpClient(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        let transport = HttpTransport::new(&Config::default()).unwrap();
        // Port 9 on localhost is the discard service, closed on test machines.
        let err = transport
            .get("http://127.0.0.1:9/health", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Network { .. }));
    }
}
