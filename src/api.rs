//! Remote store API client.
//!
//! The remote store speaks the same JSON API this service exposes (a central
//! Nexus Stock instance, for example). It is used for connectivity checks
//! and for replaying the local sync queue.

use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight connectivity test.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// A failed call to the remote store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    /// HTTP status, or `None` when no response arrived.
    pub status: Option<u16>,
    pub message: String,
}

impl RemoteError {
    fn network(message: String) -> Self {
        Self {
            status: None,
            message,
        }
    }

    /// Worth retrying later: no response at all, a timeout, throttling, or a
    /// server-side failure. Every other 4xx means the request itself is bad.
    pub fn is_transient(&self) -> bool {
        match self.status {
            None => true,
            Some(408) | Some(429) => true,
            Some(s) => s >= 500,
        }
    }
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the remote store URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
pub fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach remote store at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid remote store URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
pub fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Not authorized by the remote store".to_string(),
        404 => "Remote store endpoint not found".to_string(),
        408 => "Remote store timed out the request".to_string(),
        429 => "Remote store is rate limiting requests".to_string(),
        s if s >= 500 => format!("Remote store server error (HTTP {s})"),
        s => format!("Unexpected response from remote store (HTTP {s})"),
    }
}

fn build_client(timeout: Duration) -> Result<Client, RemoteError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| RemoteError::network(format!("Failed to create HTTP client: {e}")))
}

// ---------------------------------------------------------------------------
// Connectivity test
// ---------------------------------------------------------------------------

/// Result of a connectivity test.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Test connectivity to the remote store with a lightweight health check.
pub async fn test_connectivity(base_url: &str, api_key: &str) -> ConnectivityResult {
    let url = normalize_base_url(base_url);
    let health_url = format!("{url}/health");

    let client = match build_client(CONNECTIVITY_TIMEOUT) {
        Ok(c) => c,
        Err(e) => {
            return ConnectivityResult {
                success: false,
                latency_ms: None,
                error: Some(e.message),
            };
        }
    };

    let start = Instant::now();
    let mut req = client.get(&health_url);
    if !api_key.is_empty() {
        req = req.bearer_auth(api_key);
    }

    let resp = match req.send().await {
        Ok(r) => r,
        Err(e) => {
            return ConnectivityResult {
                success: false,
                latency_ms: None,
                error: Some(friendly_error(&url, &e)),
            };
        }
    };

    let latency = start.elapsed().as_millis() as u64;
    let status = resp.status();

    if status.is_success() {
        debug!(latency_ms = latency, "connectivity test passed");
        ConnectivityResult {
            success: true,
            latency_ms: Some(latency),
            error: None,
        }
    } else {
        ConnectivityResult {
            success: false,
            latency_ms: Some(latency),
            error: Some(status_error(status)),
        }
    }
}

// ---------------------------------------------------------------------------
// Generic authenticated request
// ---------------------------------------------------------------------------

/// Perform an authenticated HTTP request to the remote store.
///
/// `path` includes the leading slash and any query, e.g. `/api/products?id=…`.
/// Returns the JSON body, or `Value::Null` for an empty body.
pub async fn request_remote(
    base_url: &str,
    api_key: &str,
    path: &str,
    method: Method,
    body: Option<&Value>,
    idempotency_key: Option<&str>,
) -> Result<Value, RemoteError> {
    let base = normalize_base_url(base_url);
    let full_url = format!("{base}{path}");

    let client = build_client(DEFAULT_TIMEOUT)?;
    let mut req = client
        .request(method.clone(), &full_url)
        .header("Content-Type", "application/json");
    if !api_key.is_empty() {
        req = req.bearer_auth(api_key);
    }
    if let Some(key) = idempotency_key {
        req = req.header("Idempotency-Key", key);
    }
    if let Some(b) = body {
        req = req.json(b);
    }

    let resp = req
        .send()
        .await
        .map_err(|e| RemoteError::network(friendly_error(&base, &e)))?;
    let status = resp.status();

    if !status.is_success() {
        // Keep the remote's own message when it sent one.
        let body_text = resp.text().await.unwrap_or_default();
        let remote_message = serde_json::from_str::<Value>(&body_text).ok().and_then(|json| {
            json.get("error")
                .or_else(|| json.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        let message = match remote_message {
            Some(m) => format!("{m} (HTTP {})", status.as_u16()),
            None if !body_text.trim().is_empty() => format!(
                "{} (HTTP {}): {}",
                status_error(status),
                status.as_u16(),
                body_text.trim()
            ),
            None => format!("{} (HTTP {})", status_error(status), status.as_u16()),
        };
        return Err(RemoteError {
            status: Some(status.as_u16()),
            message,
        });
    }

    let body_text = resp.text().await.unwrap_or_default();
    if body_text.trim().is_empty() {
        return Ok(Value::Null);
    }
    let parsed = serde_json::from_str(&body_text).map_err(|e| RemoteError {
        status: Some(status.as_u16()),
        message: format!("Invalid JSON from remote store: {e}"),
    })?;
    debug!(method = %method, path, status = status.as_u16(), "remote request ok");
    Ok(parsed)
}
