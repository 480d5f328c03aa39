//! Error taxonomy and provider error classification
//!
//! All provider-specific failure shapes (HTTP status + body) are mapped into
//! the uniform [`CloudError`] taxonomy here. Classification is pure and
//! stateless: the same input always yields the same category.

use thiserror::Error;

use crate::providers::types::ProviderKind;

/// Unified error type for the cloud core
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("timed out waiting for the authorization redirect")]
    AuthTimeout,

    #[error("redirect state nonce does not match this authorization flow")]
    StateMismatch,

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("session invalid, re-authentication required")]
    ReauthRequired,

    #[error("credential decryption failed: {0}")]
    Decryption(String),

    #[error("unauthorized (token rejected)")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("rate limited (retry after {})", .retry_after_secs.map(|s| format!("{s}s")).unwrap_or_else(|| "unspecified".into()))]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("pagination stopped after {0} pages without exhausting the listing")]
    PaginationLimitExceeded(u32),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("an authorization flow is already in progress for {0}")]
    FlowAlreadyInProgress(ProviderKind),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0} API error {1}: {2}")]
    Api(ProviderKind, u16, String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("keyring error: {0}")]
    Keyring(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CloudError {
    /// Whether a single transparent retry with backoff may help
    pub fn is_transient(&self) -> bool {
        matches!(self, CloudError::Network(_))
    }
}

/// Longest error-body excerpt carried into an [`CloudError::Api`] message
const BODY_EXCERPT_LEN: usize = 200;

/// Classify a provider HTTP failure into the uniform taxonomy.
///
/// `retry_after_secs` is the parsed `Retry-After` header, when present.
/// 2xx statuses are never passed here.
pub fn classify(
    kind: ProviderKind,
    status: u16,
    body: &str,
    retry_after_secs: Option<u64>,
) -> CloudError {
    match status {
        401 => CloudError::Unauthorized,
        403 if looks_rate_limited(body) => CloudError::RateLimited { retry_after_secs },
        403 => CloudError::Forbidden(excerpt(body)),
        404 => CloudError::NotFound(excerpt(body)),
        409 => CloudError::Conflict(excerpt(body)),
        // GitHub reports a duplicate repository name as a 422 validation error
        422 if kind == ProviderKind::Github && body.contains("already exists") => {
            CloudError::Conflict(excerpt(body))
        }
        429 => CloudError::RateLimited { retry_after_secs },
        _ => CloudError::Api(kind, status, excerpt(body)),
    }
}

/// Providers hide quota exhaustion behind 403; detect the known body shapes
fn looks_rate_limited(body: &str) -> bool {
    body.contains("rateLimitExceeded")
        || body.contains("userRateLimitExceeded")
        || body.contains("API rate limit exceeded")
        || body.contains("quotaExceeded")
        || body.contains("activityLimitReached")
}

fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= BODY_EXCERPT_LEN {
        trimmed.to_string()
    } else {
        let mut end = BODY_EXCERPT_LEN;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &trimmed[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_core_statuses() {
        assert!(matches!(
            classify(ProviderKind::Gdrive, 401, "", None),
            CloudError::Unauthorized
        ));
        assert!(matches!(
            classify(ProviderKind::Gdrive, 403, "insufficient permissions", None),
            CloudError::Forbidden(_)
        ));
        assert!(matches!(
            classify(ProviderKind::Onedrive, 404, "item not found", None),
            CloudError::NotFound(_)
        ));
        assert!(matches!(
            classify(ProviderKind::Github, 409, "merge conflict", None),
            CloudError::Conflict(_)
        ));
        assert!(matches!(
            classify(ProviderKind::Onedrive, 429, "", Some(30)),
            CloudError::RateLimited {
                retry_after_secs: Some(30)
            }
        ));
        assert!(matches!(
            classify(ProviderKind::Gdrive, 500, "backend error", None),
            CloudError::Api(ProviderKind::Gdrive, 500, _)
        ));
    }

    #[test]
    fn test_classify_quota_403_as_rate_limited() {
        let body = r#"{"error":{"errors":[{"reason":"userRateLimitExceeded"}]}}"#;
        assert!(matches!(
            classify(ProviderKind::Gdrive, 403, body, None),
            CloudError::RateLimited { .. }
        ));
        let github = r#"{"message":"API rate limit exceeded for user"}"#;
        assert!(matches!(
            classify(ProviderKind::Github, 403, github, None),
            CloudError::RateLimited { .. }
        ));
    }

    #[test]
    fn test_classify_github_duplicate_repo() {
        let body = r#"{"message":"Repository creation failed.","errors":[{"message":"name already exists on this account"}]}"#;
        assert!(matches!(
            classify(ProviderKind::Github, 422, body, None),
            CloudError::Conflict(_)
        ));
        // A plain 422 elsewhere stays an API error
        assert!(matches!(
            classify(ProviderKind::Gdrive, 422, body, None),
            CloudError::Api(_, 422, _)
        ));
    }

    #[test]
    fn test_classify_is_deterministic() {
        for _ in 0..3 {
            let e = classify(ProviderKind::Github, 403, "API rate limit exceeded", Some(5));
            assert!(matches!(
                e,
                CloudError::RateLimited {
                    retry_after_secs: Some(5)
                }
            ));
        }
    }

    #[test]
    fn test_excerpt_truncates_long_bodies() {
        let long = "x".repeat(1000);
        match classify(ProviderKind::Gdrive, 500, &long, None) {
            CloudError::Api(_, _, msg) => assert!(msg.len() < 250),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
