use std::time::Duration;

use mcm_core::{McmError, Result};
use reqwest::{Response, StatusCode};

const USER_AGENT: &str = concat!("mcm/", env!("CARGO_PKG_VERSION"));

/// HTTP client for backends with properly signed certificates.
pub fn client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|e| McmError::backend(format!("Failed to build HTTP client: {}", e)))
}

/// HTTP client that accepts self-signed certificates (`curl -k`).
pub fn insecure_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .danger_accept_invalid_certs(true)
        .build()
        .map_err(|e| McmError::backend(format!("Failed to build HTTP client: {}", e)))
}

/// Error for a non-2xx answer.
pub fn classify_status(status: StatusCode, url: &str, body: &str) -> McmError {
    let msg = format!("HTTP {} for {}: {}", status, url, body.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => McmError::Auth(msg),
        StatusCode::NOT_FOUND => McmError::NotFound(msg),
        StatusCode::CONFLICT => McmError::Conflict(msg),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => McmError::Timeout(msg),
        _ => McmError::Backend(msg),
    }
}

/// Error for a request that never produced a response.
pub fn classify_transport(e: reqwest::Error, url: &str) -> McmError {
    if e.is_timeout() {
        McmError::Timeout(format!("HTTP request to {}: {}", url, e))
    } else if e.is_connect() || e.is_request() {
        McmError::Network(format!("HTTP request to {}: {}", url, e))
    } else {
        McmError::Backend(format!("HTTP request to {}: {}", url, e))
    }
}

/// Send a prepared request, failing on transport errors and non-2xx answers.
pub async fn send(request: reqwest::RequestBuilder, url: &str) -> Result<Response> {
    let resp = request
        .send()
        .await
        .map_err(|e| classify_transport(e, url))?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(classify_status(status, url, &body));
    }
    Ok(resp)
}

/// Read a response body as JSON. An empty body reads as `null`.
pub async fn read_json(resp: Response, url: &str) -> Result<serde_json::Value> {
    let text = resp
        .text()
        .await
        .map_err(|e| McmError::backend(format!("Failed to read response body from {}: {}", url, e)))?;
    if text.trim().is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_str(&text)
        .map_err(|e| McmError::backend(format!("Failed to parse JSON from {}: {}", url, e)))
}

/// [`send`] then [`read_json`].
pub async fn send_json(request: reqwest::RequestBuilder, url: &str) -> Result<serde_json::Value> {
    let resp = send(request, url).await?;
    read_json(resp, url).await
}
