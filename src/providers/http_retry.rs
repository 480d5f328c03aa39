//! Shared HTTP send wrapper with connection-level retry.
//!
//! Connection failures (refused, reset, timed out) get exactly one transparent
//! retry after a short fixed backoff; repeated failure surfaces as
//! `CloudError::Network`. Status-level failures (401, 403, 429, ...) are never
//! retried here; the caller classifies them and decides.

use reqwest::{Client, Request, Response};
use std::time::Duration;

use crate::error::CloudError;

/// Configuration for connection-level retry behavior
#[derive(Debug, Clone)]
pub struct HttpRetryConfig {
    /// Retry attempts after the initial send (default: 1)
    pub max_retries: u32,
    /// Fixed backoff between attempts (default: 500ms)
    pub backoff: Duration,
}

impl Default for HttpRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Whether a reqwest error is a connection-level failure worth one retry
fn is_transient(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout()
}

/// Parse the Retry-After header value in seconds (HTTP-date form is rare
/// enough to ignore; numeric seconds covers the providers we talk to).
pub fn parse_retry_after(response: &Response) -> Option<u64> {
    let value = response.headers().get("retry-after")?.to_str().ok()?;
    value.parse::<u64>().ok().map(|secs| secs.min(300))
}

/// Send an HTTP request, retrying once on connection-level failure.
///
/// Returns the response for any HTTP status; only transport errors are
/// converted to `CloudError::Network`.
pub async fn send_with_retry(
    client: &Client,
    request: Request,
    config: &HttpRetryConfig,
) -> Result<Response, CloudError> {
    // Keep request parts so the attempt can be rebuilt; streaming bodies
    // cannot be retried and fall through to a single attempt.
    let method = request.method().clone();
    let url = request.url().clone();
    let headers = request.headers().clone();
    let body_bytes = request.body().and_then(|b| b.as_bytes()).map(|b| b.to_vec());
    let retryable = request.body().is_none() || body_bytes.is_some();

    let mut attempt = 0u32;
    let mut last_error = match client.execute(request).await {
        Ok(response) => return Ok(response),
        Err(e) => e,
    };

    while attempt < config.max_retries && retryable && is_transient(&last_error) {
        attempt += 1;
        tracing::debug!(
            "HTTP {} {} failed ({}). Retry {}/{} after {:?}",
            method,
            url,
            last_error,
            attempt,
            config.max_retries,
            config.backoff
        );
        tokio::time::sleep(config.backoff).await;

        let mut retry_req = client.request(method.clone(), url.clone());
        for (key, value) in headers.iter() {
            retry_req = retry_req.header(key, value);
        }
        if let Some(ref body) = body_bytes {
            retry_req = retry_req.body(body.clone());
        }

        match retry_req.send().await {
            Ok(response) => return Ok(response),
            Err(e) => last_error = e,
        }
    }

    Err(CloudError::Network(last_error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_single_retry() {
        let config = HttpRetryConfig::default();
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.backoff, Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_connection_failure_surfaces_as_network_error() {
        // Nothing listens on this port; both attempts fail to connect
        let client = Client::new();
        let request = client
            .get("http://127.0.0.1:9/unreachable")
            .build()
            .unwrap();
        let config = HttpRetryConfig {
            max_retries: 1,
            backoff: Duration::from_millis(1),
        };
        match send_with_retry(&client, request, &config).await {
            Err(CloudError::Network(_)) => {}
            other => panic!("expected Network error, got {other:?}"),
        }
    }
}
