//! OAuth2 authorization flow controller
//!
//! Drives the authorization-code exchange per provider: builds the
//! authorization URL, opens the system browser, waits on a single-shot
//! loopback listener for the redirect, exchanges the code, and persists the
//! resulting credential.
//!
//! Flow states per provider:
//!
//! ```text
//! Idle -> AwaitingRedirect -> ExchangingCode -> Authenticated
//!                                  |                  ^   |
//!                                  v                  |   v
//!                               Failed <---------  Refreshing
//! ```
//!
//! Only `Authenticated` permits remote operations. The redirect listener is a
//! scoped resource: it is owned by the flow future, so every exit path
//! (success, timeout, cancellation, panic) drops it and releases the port.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::activity::{LogCategory, LogSink};
use crate::credential_store::{Credential, CredentialStore};
use crate::error::CloudError;
use crate::providers::oauth2::{self, OAuthConfig};
use crate::providers::types::ProviderKind;
use crate::providers::GithubProvider;
use crate::settings::Settings;

/// Per-provider authorization session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowState {
    #[default]
    Idle,
    AwaitingRedirect,
    ExchangingCode,
    Authenticated,
    Refreshing,
    Failed,
}

impl FlowState {
    /// A flow in one of these states owns the redirect listener
    fn is_in_flight(&self) -> bool {
        matches!(self, FlowState::AwaitingRedirect | FlowState::ExchangingCode)
    }
}

/// Shared per-provider flow state, visible to the token refresher as well
pub struct FlowRegistry {
    states: Mutex<HashMap<ProviderKind, FlowState>>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, kind: ProviderKind) -> FlowState {
        self.states
            .lock()
            .expect("flow registry lock poisoned")
            .get(&kind)
            .copied()
            .unwrap_or_default()
    }

    pub fn set(&self, kind: ProviderKind, state: FlowState) {
        self.states
            .lock()
            .expect("flow registry lock poisoned")
            .insert(kind, state);
    }

    /// Transition into `AwaitingRedirect` unless a flow is already running
    fn try_start(&self, kind: ProviderKind) -> Result<(), CloudError> {
        let mut states = self.states.lock().expect("flow registry lock poisoned");
        let current = states.get(&kind).copied().unwrap_or_default();
        if current.is_in_flight() {
            return Err(CloudError::FlowAlreadyInProgress(kind));
        }
        states.insert(kind, FlowState::AwaitingRedirect);
        Ok(())
    }
}

impl Default for FlowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Authorization flow controller; one instance serves all providers, at most
/// one flow in flight per provider.
pub struct AuthFlowController {
    store: Arc<CredentialStore>,
    settings: Settings,
    sink: Arc<dyn LogSink>,
    registry: Arc<FlowRegistry>,
}

impl AuthFlowController {
    pub fn new(store: Arc<CredentialStore>, settings: Settings, sink: Arc<dyn LogSink>) -> Self {
        Self {
            store,
            settings,
            sink,
            registry: Arc::new(FlowRegistry::new()),
        }
    }

    /// Shared flow state handle, for the token refresher
    pub fn registry(&self) -> Arc<FlowRegistry> {
        self.registry.clone()
    }

    pub fn state(&self, kind: ProviderKind) -> FlowState {
        self.registry.get(kind)
    }

    /// Record OAuth client configuration for a provider. Existing token
    /// material is preserved, so reconfiguring does not force a re-login.
    pub fn save_profile(&self, mut profile: Credential) -> Result<(), CloudError> {
        if let Ok(existing) = self.store.load(profile.provider) {
            profile.access_token = existing.access_token;
            profile.refresh_token = existing.refresh_token;
            profile.expires_at = existing.expires_at;
        }
        self.store.save(&profile)
    }

    /// Run the authorization-code flow for a provider.
    ///
    /// Fails fast with `FlowAlreadyInProgress` when a flow for this provider
    /// already holds the listener; otherwise blocks (up to the configured
    /// timeout) until the redirect arrives and the exchange completes.
    pub async fn begin(
        &self,
        kind: ProviderKind,
        cancel: &CancellationToken,
    ) -> Result<Credential, CloudError> {
        self.registry.try_start(kind)?;

        let result = self.run_flow(kind, cancel).await;
        match &result {
            Ok(_) => {
                self.registry.set(kind, FlowState::Authenticated);
                self.sink
                    .record(LogCategory::Auth, &kind.to_string(), "authentication completed");
            }
            Err(e) => {
                self.registry.set(kind, FlowState::Failed);
                self.sink.record(
                    LogCategory::Auth,
                    &kind.to_string(),
                    &format!("authentication failed: {e}"),
                );
            }
        }
        result
    }

    async fn run_flow(
        &self,
        kind: ProviderKind,
        cancel: &CancellationToken,
    ) -> Result<Credential, CloudError> {
        let mut credential = self.store.load(kind).map_err(|e| match e {
            CloudError::NotFound(_) => CloudError::InvalidConfig(format!(
                "{kind} has no OAuth client configuration; save a profile first"
            )),
            other => other,
        })?;

        let config = OAuthConfig::for_credential(&credential, self.settings.redirect_port);
        let authorize = oauth2::authorize_request(&config)?;

        // Bind before opening the browser so the redirect can never race us
        let (listener, _port) = oauth2::bind_callback_listener(self.settings.redirect_port).await?;

        if self.settings.auto_open_browser {
            if let Err(e) = open::that(authorize.url.as_str()) {
                warn!("Could not open system browser: {}", e);
                self.sink.record(
                    LogCategory::Auth,
                    &kind.to_string(),
                    "could not open the browser; open the authorization URL manually",
                );
            }
        }
        self.sink.record(
            LogCategory::Auth,
            &kind.to_string(),
            "authorization started, waiting for redirect",
        );

        let timeout = Duration::from_secs(self.settings.auth_timeout_secs);
        let (code, state) = tokio::select! {
            _ = cancel.cancelled() => return Err(CloudError::Cancelled),
            outcome = tokio::time::timeout(timeout, oauth2::wait_for_callback(listener)) => {
                match outcome {
                    Err(_) => return Err(CloudError::AuthTimeout),
                    Ok(result) => result?,
                }
            }
        };

        // The nonce binds the redirect to this flow instance
        if state != authorize.state {
            return Err(CloudError::StateMismatch);
        }

        self.registry.set(kind, FlowState::ExchangingCode);
        let tokens = oauth2::exchange_code(&config, &code, authorize.pkce_verifier).await?;

        tokens.apply_to(&mut credential);
        self.store.save(&credential)?;
        Ok(credential)
    }

    /// Authenticate GitHub with a personal access token, bypassing the
    /// redirect flow. Returns the account login.
    pub async fn login_with_token(
        &self,
        kind: ProviderKind,
        token: &str,
    ) -> Result<String, CloudError> {
        if kind != ProviderKind::Github {
            return Err(CloudError::Unsupported(format!(
                "{kind} does not support personal access tokens"
            )));
        }

        let login = match GithubProvider::new().validate_token(token).await {
            Ok(login) => login,
            Err(e) => {
                self.registry.set(kind, FlowState::Failed);
                self.sink.record(
                    LogCategory::Auth,
                    &kind.to_string(),
                    &format!("personal access token rejected: {e}"),
                );
                return Err(e);
            }
        };

        self.store.save(&Credential::personal_token(kind, token))?;
        self.registry.set(kind, FlowState::Authenticated);
        self.sink.record(
            LogCategory::Auth,
            &kind.to_string(),
            &format!("authenticated as {login} with a personal access token"),
        );
        Ok(login)
    }

    /// Log out of a provider: discard persisted credentials irreversibly and
    /// return the flow to `Idle`.
    pub fn logout(&self, kind: ProviderKind) -> Result<(), CloudError> {
        self.store.clear(kind)?;
        self.registry.set(kind, FlowState::Idle);
        self.sink
            .record(LogCategory::Auth, &kind.to_string(), "logged out");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::TracingSink;

    fn test_settings(port: u16, timeout_secs: u64) -> Settings {
        Settings {
            redirect_port: port,
            auth_timeout_secs: timeout_secs,
            auto_open_browser: false,
            ..Default::default()
        }
    }

    fn test_store(dir: &std::path::Path) -> Arc<CredentialStore> {
        Arc::new(CredentialStore::open_vault(dir, Some("test"), Arc::new(TracingSink)).unwrap())
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn gdrive_profile() -> Credential {
        Credential::profile(
            ProviderKind::Gdrive,
            "client-id",
            "client-secret",
            vec!["https://www.googleapis.com/auth/drive".to_string()],
            None,
        )
    }

    #[tokio::test]
    async fn test_begin_without_profile_fails() {
        let dir = tempfile::tempdir().unwrap();
        let controller = AuthFlowController::new(
            test_store(dir.path()),
            test_settings(free_port(), 1),
            Arc::new(TracingSink),
        );

        let cancel = CancellationToken::new();
        match controller.begin(ProviderKind::Gdrive, &cancel).await {
            Err(CloudError::InvalidConfig(_)) => {}
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
        assert_eq!(controller.state(ProviderKind::Gdrive), FlowState::Failed);
    }

    #[tokio::test]
    async fn test_begin_is_exclusive_per_provider() {
        let dir = tempfile::tempdir().unwrap();
        let controller = AuthFlowController::new(
            test_store(dir.path()),
            test_settings(free_port(), 1),
            Arc::new(TracingSink),
        );

        controller
            .registry()
            .set(ProviderKind::Gdrive, FlowState::AwaitingRedirect);

        let cancel = CancellationToken::new();
        match controller.begin(ProviderKind::Gdrive, &cancel).await {
            Err(CloudError::FlowAlreadyInProgress(ProviderKind::Gdrive)) => {}
            other => panic!("expected FlowAlreadyInProgress, got {other:?}"),
        }
        // The running flow's state is untouched by the rejected begin
        assert_eq!(
            controller.state(ProviderKind::Gdrive),
            FlowState::AwaitingRedirect
        );
    }

    #[tokio::test]
    async fn test_auth_timeout_frees_the_port() {
        let dir = tempfile::tempdir().unwrap();
        let port = free_port();
        let store = test_store(dir.path());
        let controller =
            AuthFlowController::new(store.clone(), test_settings(port, 1), Arc::new(TracingSink));
        controller.save_profile(gdrive_profile()).unwrap();

        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();
        match controller.begin(ProviderKind::Gdrive, &cancel).await {
            Err(CloudError::AuthTimeout) => {}
            other => panic!("expected AuthTimeout, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(controller.state(ProviderKind::Gdrive), FlowState::Failed);

        // The listener is gone; the port binds again immediately
        let rebound = tokio::net::TcpListener::bind(("127.0.0.1", port)).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn test_state_mismatch_rejects_redirect() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let dir = tempfile::tempdir().unwrap();
        let port = free_port();
        let store = test_store(dir.path());
        let controller = Arc::new(AuthFlowController::new(
            store,
            test_settings(port, 10),
            Arc::new(TracingSink),
        ));
        controller.save_profile(gdrive_profile()).unwrap();

        let cancel = CancellationToken::new();
        let flow = {
            let controller = controller.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.begin(ProviderKind::Gdrive, &cancel).await })
        };

        // Deliver a redirect carrying a foreign state nonce
        let mut stream = loop {
            match tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
                Ok(s) => break s,
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        };
        stream
            .write_all(b"GET /callback?code=abc&state=forged HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response).await;

        match flow.await.unwrap() {
            Err(CloudError::StateMismatch) => {}
            other => panic!("expected StateMismatch, got {other:?}"),
        }
        assert_eq!(controller.state(ProviderKind::Gdrive), FlowState::Failed);
    }

    #[tokio::test]
    async fn test_login_with_token_requires_github() {
        let dir = tempfile::tempdir().unwrap();
        let controller = AuthFlowController::new(
            test_store(dir.path()),
            test_settings(free_port(), 1),
            Arc::new(TracingSink),
        );

        match controller
            .login_with_token(ProviderKind::Gdrive, "not-a-pat")
            .await
        {
            Err(CloudError::Unsupported(_)) => {}
            other => panic!("expected Unsupported, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_logout_clears_credentials_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let controller = AuthFlowController::new(
            store.clone(),
            test_settings(free_port(), 1),
            Arc::new(TracingSink),
        );

        store
            .save(&Credential::personal_token(ProviderKind::Github, "ghp_x"))
            .unwrap();
        controller
            .registry()
            .set(ProviderKind::Github, FlowState::Authenticated);

        controller.logout(ProviderKind::Github).unwrap();
        assert!(!store.has_credential(ProviderKind::Github));
        assert_eq!(controller.state(ProviderKind::Github), FlowState::Idle);
    }
}
