//! Token freshness
//!
//! `ensure_fresh` hands out the cached access token while it is still valid
//! (60 s skew) and performs a refresh-token exchange otherwise, at most once
//! per call, never in a loop. A failed refresh moves the provider session to
//! `Failed` and surfaces `ReauthRequired`.

use async_trait::async_trait;
use secrecy::SecretString;
use std::future::Future;
use std::sync::Arc;

use crate::activity::{LogCategory, LogSink};
use crate::auth_flow::{FlowRegistry, FlowState};
use crate::credential_store::{CredentialStore, EXPIRY_SKEW_SECS};
use crate::error::CloudError;
use crate::providers::oauth2::{self, OAuthConfig};
use crate::providers::types::ProviderKind;

/// Source of fresh access tokens. The seam lets listing and transfer code be
/// exercised without a live token endpoint.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Return a valid access token, refreshing first if it is about to expire
    async fn ensure_fresh(&self, kind: ProviderKind) -> Result<SecretString, CloudError>;

    /// Force one refresh exchange regardless of the cached expiry
    async fn refresh_now(&self, kind: ProviderKind) -> Result<SecretString, CloudError>;
}

/// Refreshes access tokens against the provider token endpoints and persists
/// the updated credential.
pub struct TokenRefresher {
    store: Arc<CredentialStore>,
    registry: Arc<FlowRegistry>,
    sink: Arc<dyn LogSink>,
    redirect_port: u16,
}

impl TokenRefresher {
    pub fn new(
        store: Arc<CredentialStore>,
        registry: Arc<FlowRegistry>,
        sink: Arc<dyn LogSink>,
        redirect_port: u16,
    ) -> Self {
        Self {
            store,
            registry,
            sink,
            redirect_port,
        }
    }

    fn reauth(&self, kind: ProviderKind, reason: &str) -> CloudError {
        self.registry.set(kind, FlowState::Failed);
        self.sink.record(LogCategory::Auth, &kind.to_string(), reason);
        CloudError::ReauthRequired
    }
}

#[async_trait]
impl TokenSource for TokenRefresher {
    async fn ensure_fresh(&self, kind: ProviderKind) -> Result<SecretString, CloudError> {
        let credential = self.store.load(kind)?;
        if !credential.has_access_token() {
            return Err(self.reauth(kind, "no access token on record"));
        }
        // PATs have no expiry; OAuth tokens are reused until the skew window
        if credential.is_personal_token() || !credential.expires_within(EXPIRY_SKEW_SECS) {
            return Ok(SecretString::from(credential.access_token));
        }
        self.refresh_now(kind).await
    }

    async fn refresh_now(&self, kind: ProviderKind) -> Result<SecretString, CloudError> {
        let mut credential = self.store.load(kind)?;

        if credential.is_personal_token() {
            return Err(self.reauth(kind, "personal access token rejected; generate a new one"));
        }
        let Some(refresh_token) = credential.refresh_token.clone() else {
            return Err(self.reauth(kind, "no refresh token on record"));
        };

        self.registry.set(kind, FlowState::Refreshing);
        let config = OAuthConfig::for_credential(&credential, self.redirect_port);

        // Exactly one exchange; a failure here means the refresh token itself
        // was revoked or expired.
        match oauth2::exchange_refresh(&config, &refresh_token).await {
            Ok(tokens) => {
                tokens.apply_to(&mut credential);
                self.store.save(&credential)?;
                self.registry.set(kind, FlowState::Authenticated);
                Ok(SecretString::from(credential.access_token))
            }
            Err(e) => Err(self.reauth(kind, &format!("token refresh failed: {e}"))),
        }
    }
}

/// Run a provider operation with the refresh-once policy: a 401 triggers
/// exactly one forced refresh and one retry of the same request; a second
/// failure is surfaced unmodified.
pub(crate) async fn with_auth_retry<T, F, Fut>(
    kind: ProviderKind,
    tokens: &Arc<dyn TokenSource>,
    sink: &Arc<dyn LogSink>,
    operation: &str,
    mut op: F,
) -> Result<T, CloudError>
where
    F: FnMut(SecretString) -> Fut,
    Fut: Future<Output = Result<T, CloudError>>,
{
    let token = tokens.ensure_fresh(kind).await?;
    match op(token).await {
        Err(CloudError::Unauthorized) => {
            sink.record(
                LogCategory::Auth,
                &kind.to_string(),
                &format!("{operation} got 401, refreshing token and retrying once"),
            );
            let token = tokens.refresh_now(kind).await?;
            op(token).await
        }
        other => other,
    }
}
