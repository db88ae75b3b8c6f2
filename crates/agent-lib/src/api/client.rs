//! HTTP client for the manager API
//!
//! This client:
//! - Sends the API key both as a Bearer header and as an `api_key` query parameter
//! - Falls back to query-parameter-only auth when the header is rejected
//! - Retries network failures and 5xx responses with exponential backoff
//! - Never retries 4xx responses or undecodable bodies

use super::{ApiFields, KeyStatus, ManagerApi};
use crate::config::ApiSettings;
use crate::error::ApiError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Longest response body kept in error messages
const MAX_ERROR_BODY: usize = 512;

/// Configuration for the manager client
#[derive(Debug, Clone)]
pub struct ManagerClientConfig {
    /// Manager base URL (e.g. "https://manager.example.com")
    pub base_url: String,
    /// API key sent with every request
    pub api_key: String,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Retries after the first attempt for 5xx and network errors
    pub max_retries: u32,
    /// Delay before the first retry, doubled for each further retry
    pub initial_backoff: Duration,
    /// Upper bound for the retry delay
    pub max_backoff: Duration,
    /// Path requested by [`ManagerClient::test_api_key`]
    pub probe_path: String,
}

impl Default for ManagerClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            api_key: String::new(),
            request_timeout: Duration::from_secs(5),
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            probe_path: "/api/agent/ping".to_string(),
        }
    }
}

impl ManagerClientConfig {
    pub fn from_settings(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        settings: &ApiSettings,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            request_timeout: Duration::from_secs(settings.timeout_secs),
            max_retries: settings.max_retries,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            probe_path: settings.probe_path.clone(),
            ..Self::default()
        }
    }
}

/// How the API key is attached to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    HeaderAndQuery,
    QueryOnly,
}

/// HTTP client for the manager API
pub struct ManagerClient {
    http: Client,
    config: ManagerClientConfig,
}

impl ManagerClient {
    /// Create a new client with the given configuration
    pub fn new(config: ManagerClientConfig) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::Network(format!("failed to create HTTP client: {e}")))?;

        // Fail early on a base URL that can never work
        Url::parse(&config.base_url)
            .map_err(|e| ApiError::InvalidUrl(format!("{}: {}", config.base_url, e)))?;

        Ok(Self { http, config })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Build the full request URL for an expanded endpoint path
    pub fn endpoint_url(&self, path: &str) -> Result<Url, ApiError> {
        let raw = format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let mut url = Url::parse(&raw).map_err(|e| ApiError::InvalidUrl(format!("{raw}: {e}")))?;
        url.query_pairs_mut()
            .append_pair("api_key", &self.config.api_key);
        Ok(url)
    }

    /// Send one request without retries
    async fn send_once(&self, url: &Url, mode: AuthMode) -> Result<ApiFields, ApiError> {
        let mut request = self.http.get(url.clone());
        if mode == AuthMode::HeaderAndQuery {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let status = response.status();

        if status.is_success() {
            let body = response
                .bytes()
                .await
                .map_err(|e| ApiError::Network(e.to_string()))?;
            return parse_object(&body);
        }

        let body = response.text().await.unwrap_or_default();
        let body = truncate(body);
        if status.is_server_error() {
            Err(ApiError::Server {
                status: status.as_u16(),
                body,
            })
        } else {
            Err(ApiError::Client {
                status: status.as_u16(),
                body,
            })
        }
    }

    /// Probe the manager with the configured key
    ///
    /// 200 and 404 both prove the key was accepted; anything else means the
    /// key is invalid or the manager is unhealthy. Not retried.
    pub async fn test_api_key(&self) -> KeyStatus {
        let url = match self.endpoint_url(&self.config.probe_path) {
            Ok(url) => url,
            Err(e) => {
                return KeyStatus::Unreachable {
                    error: e.to_string(),
                }
            }
        };

        let result = self
            .http
            .get(url)
            .bearer_auth(&self.config.api_key)
            .send()
            .await;

        let status = match result {
            Ok(response) => KeyStatus::from_status(response.status().as_u16()),
            Err(e) => KeyStatus::Unreachable {
                error: e.to_string(),
            },
        };

        info!(
            base_url = %self.config.base_url,
            status = ?status,
            "API key probe complete"
        );
        status
    }
}

#[async_trait]
impl ManagerApi for ManagerClient {
    async fn fetch(&self, path: &str) -> Result<ApiFields, ApiError> {
        let url = self.endpoint_url(path)?;
        let mut mode = AuthMode::HeaderAndQuery;
        let mut retries = 0u32;
        let mut backoff = self.config.initial_backoff;

        loop {
            match self.send_once(&url, mode).await {
                Ok(fields) => {
                    debug!(path = %path, fields = fields.len(), retries, "Manager request succeeded");
                    return Ok(fields);
                }
                Err(ApiError::Client { status, .. })
                    if mode == AuthMode::HeaderAndQuery
                        && (status == StatusCode::UNAUTHORIZED.as_u16()
                            || status == StatusCode::FORBIDDEN.as_u16()) =>
                {
                    warn!(
                        path = %path,
                        status,
                        "Header auth rejected, retrying with query parameter only"
                    );
                    mode = AuthMode::QueryOnly;
                }
                Err(e) if e.is_retryable() && retries < self.config.max_retries => {
                    retries += 1;
                    warn!(
                        path = %path,
                        error = %e,
                        attempt = retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Manager request failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, self.config.max_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Decode a response body that must be a JSON object
fn parse_object(body: &[u8]) -> Result<ApiFields, ApiError> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(other) => Err(ApiError::JsonDecode(format!(
            "expected a JSON object, got {}",
            json_type(&other)
        ))),
        Err(e) => Err(ApiError::JsonDecode(e.to_string())),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

/// Builder for ManagerClient configuration
pub struct ManagerClientBuilder {
    config: ManagerClientConfig,
}

impl ManagerClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ManagerClientConfig::default(),
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = key.into();
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.config.initial_backoff = backoff;
        self
    }

    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.config.max_backoff = backoff;
        self
    }

    pub fn probe_path(mut self, path: impl Into<String>) -> Self {
        self.config.probe_path = path.into();
        self
    }

    pub fn build(self) -> Result<ManagerClient, ApiError> {
        ManagerClient::new(self.config)
    }
}

impl Default for ManagerClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn client(base_url: &str) -> ManagerClient {
        ManagerClientBuilder::new()
            .base_url(base_url)
            .api_key("k3y")
            .max_retries(2)
            .initial_backoff(Duration::from_millis(10))
            .request_timeout(Duration::from_secs(2))
            .build()
            .unwrap()
    }

    fn path(p: &str) -> Matcher {
        Matcher::Regex(format!("^{}", regex::escape(p)))
    }

    fn key_query() -> Matcher {
        Matcher::UrlEncoded("api_key".into(), "k3y".into())
    }

    #[test]
    fn test_client_config_default() {
        let config = ManagerClientConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_endpoint_url_joins_and_adds_key() {
        let client = client("https://manager.local/base/");
        let url = client.endpoint_url("/api/vms/vm-1").unwrap();
        assert_eq!(url.path(), "/base/api/vms/vm-1");
        assert_eq!(url.query(), Some("api_key=k3y"));
    }

    #[test]
    fn test_endpoint_url_keeps_encoded_segment() {
        let client = client("https://manager.local/base/");
        let url = client
            .endpoint_url("/api/vms/vm-1/users/..%2F..%2Fadmin%2Fkeys")
            .unwrap();
        assert_eq!(url.path(), "/base/api/vms/vm-1/users/..%2F..%2Fadmin%2Fkeys");
    }

    #[test]
    fn test_invalid_base_url() {
        let result = ManagerClientBuilder::new().base_url("not a url").build();
        assert!(matches!(result, Err(ApiError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_fetch_sends_header_and_query_key() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", path("/api/users/alice"))
            .match_header("authorization", "Bearer k3y")
            .match_query(key_query())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"display_name": "Alice", "uid": 7}"#)
            .expect(1)
            .create_async()
            .await;

        let fields = client(&server.url()).fetch("/api/users/alice").await.unwrap();
        assert_eq!(fields["display_name"], "Alice");
        assert_eq!(fields["uid"], 7);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_then_success_is_retried() {
        let mut server = Server::new_async().await;
        let failing = server
            .mock("GET", path("/api/info"))
            .with_status(500)
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("GET", path("/api/info"))
            .with_status(200)
            .with_body(r#"{"state": "ready"}"#)
            .expect(1)
            .create_async()
            .await;

        let fields = client(&server.url()).fetch("/api/info").await.unwrap();
        assert_eq!(fields["state"], "ready");
        failing.assert_async().await;
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_exhausts_retries() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", path("/api/info"))
            .with_status(503)
            .with_body("maintenance")
            .expect(3)
            .create_async()
            .await;

        let err = client(&server.url()).fetch("/api/info").await.unwrap_err();
        assert!(matches!(err, ApiError::Server { status: 503, ref body } if body == "maintenance"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_error_not_retried() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", path("/api/users/ghost"))
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let err = client(&server.url()).fetch("/api/users/ghost").await.unwrap_err();
        assert!(matches!(err, ApiError::Client { status: 404, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_malformed_json_not_retried() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", path("/api/info"))
            .with_status(200)
            .with_body("{not json")
            .expect(1)
            .create_async()
            .await;

        let err = client(&server.url()).fetch("/api/info").await.unwrap_err();
        assert!(matches!(err, ApiError::JsonDecode(_)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_object_json_rejected() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", path("/api/list"))
            .with_status(200)
            .with_body("[1, 2, 3]")
            .create_async()
            .await;

        let err = client(&server.url()).fetch("/api/list").await.unwrap_err();
        assert!(matches!(err, ApiError::JsonDecode(msg) if msg.contains("array")));
    }

    #[tokio::test]
    async fn test_header_rejection_falls_back_to_query_only() {
        let mut server = Server::new_async().await;
        let header = server
            .mock("GET", path("/api/legacy"))
            .match_header("authorization", "Bearer k3y")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let query_only = server
            .mock("GET", path("/api/legacy"))
            .match_header("authorization", Matcher::Missing)
            .match_query(key_query())
            .with_status(200)
            .with_body(r#"{"ok": true}"#)
            .expect(1)
            .create_async()
            .await;

        let fields = client(&server.url()).fetch("/api/legacy").await.unwrap();
        assert_eq!(fields["ok"], true);
        header.assert_async().await;
        query_only.assert_async().await;
    }

    #[tokio::test]
    async fn test_network_error_after_retries() {
        let err = client("http://127.0.0.1:1").fetch("/api/info").await.unwrap_err();
        assert!(matches!(err, ApiError::Network(_)));
    }

    #[tokio::test]
    async fn test_api_key_probe() {
        let mut server = Server::new_async().await;
        let _missing = server
            .mock("GET", path("/api/agent/ping"))
            .with_status(404)
            .create_async()
            .await;

        let status = client(&server.url()).test_api_key().await;
        assert_eq!(status, KeyStatus::Valid { http_status: 404 });
    }

    #[tokio::test]
    async fn test_api_key_probe_rejected() {
        let mut server = Server::new_async().await;
        let _denied = server
            .mock("GET", path("/api/agent/ping"))
            .with_status(401)
            .create_async()
            .await;

        let status = client(&server.url()).test_api_key().await;
        assert_eq!(status, KeyStatus::InvalidOrServerIssue { http_status: 401 });
    }

    #[tokio::test]
    async fn test_api_key_probe_unreachable() {
        let status = client("http://127.0.0.1:1").test_api_key().await;
        assert!(matches!(status, KeyStatus::Unreachable { .. }));
    }
}
