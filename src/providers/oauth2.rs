//! OAuth2 protocol plumbing
//!
//! Authorization-URL construction, code/refresh token exchange and the
//! single-shot loopback callback listener shared by all OAuth2 providers.
//! The state machine driving these pieces lives in `auth_flow`.

use chrono::{DateTime, Utc};
use oauth2::{
    basic::BasicClient, basic::BasicTokenResponse, AuthUrl, AuthorizationCode, ClientId,
    ClientSecret, CsrfToken, EndpointNotSet, EndpointSet, PkceCodeChallenge, PkceCodeVerifier,
    RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use tracing::info;
use url::Url;

use crate::credential_store::Credential;
use crate::error::CloudError;
use crate::providers::types::ProviderKind;

/// Configured OAuth2 client with auth and token endpoints set (v5 typestates)
type ConfiguredClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Simple error wrapper for the oauth2 HTTP client adapter.
#[derive(Debug)]
struct TransportError(String);

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TransportError {}

/// Async HTTP client adapter for oauth2 v5.
/// Bridges the crate's reqwest client with oauth2's `AsyncHttpClient` trait,
/// keeping redirects disabled as the token endpoints require.
struct AdapterHttpClient;

impl<'c> oauth2::AsyncHttpClient<'c> for AdapterHttpClient {
    type Error = oauth2::HttpClientError<TransportError>;
    type Future = std::pin::Pin<
        Box<
            dyn std::future::Future<Output = Result<oauth2::HttpResponse, Self::Error>>
                + Send
                + Sync
                + 'c,
        >,
    >;

    fn call(&'c self, request: oauth2::HttpRequest) -> Self::Future {
        Box::pin(async move {
            let client = reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .map_err(|e| oauth2::HttpClientError::Other(e.to_string()))?;

            let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
                .unwrap_or(reqwest::Method::POST);
            let url = request.uri().to_string();

            let mut builder = client.request(method, &url);
            for (name, value) in request.headers() {
                builder = builder.header(name.as_str(), value.as_bytes());
            }
            builder = builder.body(request.into_body());

            let response = builder
                .send()
                .await
                .map_err(|e| oauth2::HttpClientError::Other(e.to_string()))?;

            let status_code = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response
                .bytes()
                .await
                .map_err(|e| oauth2::HttpClientError::Other(e.to_string()))?;

            let mut http_response = http::Response::builder().status(
                http::StatusCode::from_u16(status_code)
                    .unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR),
            );
            for (name, value) in headers.iter() {
                http_response = http_response.header(name.as_str(), value.as_bytes());
            }
            http_response
                .body(body.to_vec())
                .map_err(|e| oauth2::HttpClientError::Other(e.to_string()))
        })
    }
}

/// OAuth2 endpoint configuration for one provider
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub kind: ProviderKind,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub auth_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
    pub redirect_uri: String,
    /// Extra query parameters for the authorization URL
    /// (e.g. access_type=offline for Google)
    pub extra_auth_params: Vec<(String, String)>,
}

impl OAuthConfig {
    /// Google Drive endpoints
    pub fn google(client_id: &str, client_secret: &str, scopes: Vec<String>, port: u16) -> Self {
        Self {
            kind: ProviderKind::Gdrive,
            client_id: client_id.to_string(),
            client_secret: Some(client_secret.to_string()),
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            scopes,
            redirect_uri: redirect_uri(port),
            extra_auth_params: vec![("access_type".to_string(), "offline".to_string())],
        }
    }

    /// OneDrive endpoints, parameterized by tenant (default "common")
    pub fn onedrive(
        client_id: &str,
        client_secret: &str,
        scopes: Vec<String>,
        tenant: &str,
        port: u16,
    ) -> Self {
        Self {
            kind: ProviderKind::Onedrive,
            client_id: client_id.to_string(),
            client_secret: Some(client_secret.to_string()),
            auth_url: format!(
                "https://login.microsoftonline.com/{tenant}/oauth2/v2.0/authorize"
            ),
            token_url: format!("https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token"),
            scopes,
            redirect_uri: redirect_uri(port),
            extra_auth_params: vec![],
        }
    }

    /// GitHub OAuth app endpoints
    pub fn github(client_id: &str, client_secret: &str, scopes: Vec<String>, port: u16) -> Self {
        Self {
            kind: ProviderKind::Github,
            client_id: client_id.to_string(),
            client_secret: Some(client_secret.to_string()),
            auth_url: "https://github.com/login/oauth/authorize".to_string(),
            token_url: "https://github.com/login/oauth/access_token".to_string(),
            scopes,
            redirect_uri: redirect_uri(port),
            extra_auth_params: vec![],
        }
    }

    /// Default scopes requested when a stored profile carries none
    pub fn default_scopes(kind: ProviderKind) -> Vec<String> {
        match kind {
            ProviderKind::Github => vec!["repo".to_string(), "read:user".to_string()],
            ProviderKind::Gdrive => vec!["https://www.googleapis.com/auth/drive".to_string()],
            ProviderKind::Onedrive => vec![
                "Files.ReadWrite.All".to_string(),
                "offline_access".to_string(),
            ],
        }
    }

    /// Build the endpoint configuration from a stored credential record
    pub fn for_credential(credential: &Credential, port: u16) -> Self {
        let scopes = if credential.scope.is_empty() {
            Self::default_scopes(credential.provider)
        } else {
            credential.scope.clone()
        };
        match credential.provider {
            ProviderKind::Gdrive => {
                Self::google(&credential.client_id, &credential.client_secret, scopes, port)
            }
            ProviderKind::Onedrive => Self::onedrive(
                &credential.client_id,
                &credential.client_secret,
                scopes,
                credential.tenant.as_deref().unwrap_or("common"),
                port,
            ),
            ProviderKind::Github => {
                Self::github(&credential.client_id, &credential.client_secret, scopes, port)
            }
        }
    }
}

fn redirect_uri(port: u16) -> String {
    format!("http://localhost:{port}/callback")
}

/// Result of a token or refresh exchange
#[derive(Debug, Clone)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenSet {
    fn from_response(response: &BasicTokenResponse) -> Self {
        let expires_at = response
            .expires_in()
            .map(|d| Utc::now() + chrono::Duration::seconds(d.as_secs() as i64));
        Self {
            access_token: response.access_token().secret().clone(),
            refresh_token: response.refresh_token().map(|t| t.secret().clone()),
            expires_at,
        }
    }

    /// Fold the exchange result into a credential, keeping the previous
    /// refresh token when the endpoint did not return a new one.
    pub fn apply_to(&self, credential: &mut Credential) {
        credential.access_token = self.access_token.clone();
        credential.refresh_token = self
            .refresh_token
            .clone()
            .or_else(|| credential.refresh_token.take());
        credential.expires_at = self.expires_at;
    }
}

/// A prepared authorization request: URL to open plus the flow-binding secrets
pub struct AuthorizeRequest {
    pub url: Url,
    pub state: String,
    pub pkce_verifier: PkceCodeVerifier,
}

/// Build the authorization URL with PKCE challenge and CSRF state nonce
pub fn authorize_request(config: &OAuthConfig) -> Result<AuthorizeRequest, CloudError> {
    let client = build_client(config)?;

    let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

    let mut auth_builder = client
        .authorize_url(CsrfToken::new_random)
        .set_pkce_challenge(pkce_challenge);

    for scope in &config.scopes {
        auth_builder = auth_builder.add_scope(Scope::new(scope.clone()));
    }
    for (key, value) in &config.extra_auth_params {
        auth_builder = auth_builder.add_extra_param(key, value);
    }

    let (url, csrf_token) = auth_builder.url();

    info!("Authorization URL generated for {}", config.kind);

    Ok(AuthorizeRequest {
        url,
        state: csrf_token.secret().clone(),
        pkce_verifier,
    })
}

/// Exchange an authorization code for tokens
pub async fn exchange_code(
    config: &OAuthConfig,
    code: &str,
    pkce_verifier: PkceCodeVerifier,
) -> Result<TokenSet, CloudError> {
    let client = build_client(config)?;

    let response = client
        .exchange_code(AuthorizationCode::new(code.to_string()))
        .set_pkce_verifier(pkce_verifier)
        .request_async(&AdapterHttpClient)
        .await
        .map_err(|e| CloudError::TokenExchange(e.to_string()))?;

    info!("Token exchange completed for {}", config.kind);
    Ok(TokenSet::from_response(&response))
}

/// Exchange a refresh token for a fresh access token
pub async fn exchange_refresh(
    config: &OAuthConfig,
    refresh_token: &str,
) -> Result<TokenSet, CloudError> {
    let client = build_client(config)?;

    let response = client
        .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
        .request_async(&AdapterHttpClient)
        .await
        .map_err(|e| CloudError::TokenExchange(e.to_string()))?;

    info!("Tokens refreshed for {}", config.kind);
    Ok(TokenSet::from_response(&response))
}

/// Create an OAuth2 client from config (v5 builder API)
fn build_client(config: &OAuthConfig) -> Result<ConfiguredClient, CloudError> {
    let client_id = ClientId::new(config.client_id.clone());

    let auth_url = AuthUrl::new(config.auth_url.clone())
        .map_err(|e| CloudError::InvalidConfig(format!("invalid auth URL: {e}")))?;
    let token_url = TokenUrl::new(config.token_url.clone())
        .map_err(|e| CloudError::InvalidConfig(format!("invalid token URL: {e}")))?;
    let redirect_url = RedirectUrl::new(config.redirect_uri.clone())
        .map_err(|e| CloudError::InvalidConfig(format!("invalid redirect URL: {e}")))?;

    let mut client = BasicClient::new(client_id)
        .set_auth_uri(auth_url)
        .set_token_uri(token_url)
        .set_redirect_uri(redirect_url);

    if let Some(ref secret) = config.client_secret {
        client = client.set_client_secret(ClientSecret::new(secret.clone()));
    }

    Ok(client)
}

// ============ Loopback Callback Listener ============

/// Minimal static page shown in the browser once the redirect is captured
const CONFIRMATION_PAGE: &str = "HTTP/1.1 200 OK\r\n\
Content-Type: text/html; charset=utf-8\r\n\
Connection: close\r\n\
\r\n\
<!DOCTYPE html>\n\
<html lang=\"en\">\n\
<head><meta charset=\"utf-8\"><title>TechCodex - Authorization Complete</title></head>\n\
<body style=\"font-family: sans-serif; text-align: center; padding-top: 4em;\">\n\
<h1>Authorization complete</h1>\n\
<p>Your account has been connected. You can close this window and return to TechCodex.</p>\n\
</body>\n\
</html>";

const NOT_FOUND_PAGE: &str = "HTTP/1.1 404 Not Found\r\nConnection: close\r\n\r\n";

/// Bind the loopback callback listener on the configured port.
/// Returns the listener and the actual bound port.
pub async fn bind_callback_listener(port: u16) -> Result<(tokio::net::TcpListener, u16), CloudError> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|e| {
            CloudError::Network(format!("failed to bind callback listener on port {port}: {e}"))
        })?;

    let actual_port = listener
        .local_addr()
        .map(|a| a.port())
        .map_err(|e| CloudError::Network(format!("failed to get local port: {e}")))?;

    info!("OAuth callback listener bound on port {}", actual_port);
    Ok((listener, actual_port))
}

/// Wait for the OAuth2 callback on an already-bound listener.
///
/// Serves exactly one `/callback` request and returns its `(code, state)`;
/// stray requests (favicons, probes) get a 404 and do not consume the flow.
/// Consumes the listener, so the port is released when this returns.
pub async fn wait_for_callback(
    listener: tokio::net::TcpListener,
) -> Result<(String, String), CloudError> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    loop {
        let (mut socket, _) = listener
            .accept()
            .await
            .map_err(|e| CloudError::Network(format!("failed to accept connection: {e}")))?;

        let mut buffer = vec![0u8; 4096];
        let n = socket
            .read(&mut buffer)
            .await
            .map_err(|e| CloudError::Network(format!("failed to read request: {e}")))?;
        let request = String::from_utf8_lossy(&buffer[..n]).to_string();

        if !request_targets_callback(&request) {
            let _ = socket.write_all(NOT_FOUND_PAGE.as_bytes()).await;
            continue;
        }

        let parsed = parse_callback_request(&request);
        if parsed.is_ok() {
            socket
                .write_all(CONFIRMATION_PAGE.as_bytes())
                .await
                .map_err(|e| CloudError::Network(format!("failed to send response: {e}")))?;
        }
        return parsed;
    }
}

fn request_targets_callback(request: &str) -> bool {
    request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .map(|path| path == "/callback" || path.starts_with("/callback?"))
        .unwrap_or(false)
}

/// Parse the callback request to extract code and state
fn parse_callback_request(request: &str) -> Result<(String, String), CloudError> {
    let first_line = request
        .lines()
        .next()
        .ok_or_else(|| CloudError::TokenExchange("empty callback request".to_string()))?;

    // GET /callback?code=xxx&state=yyy HTTP/1.1
    let parts: Vec<&str> = first_line.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(CloudError::TokenExchange(
            "malformed callback request".to_string(),
        ));
    }

    let path = parts[1];
    let query_start = path
        .find('?')
        .ok_or_else(|| CloudError::TokenExchange("callback carried no parameters".to_string()))?;
    let query = &path[query_start + 1..];

    let mut code = None;
    let mut state = None;

    for param in query.split('&') {
        let mut kv = param.splitn(2, '=');
        let key = kv.next().unwrap_or("");
        let value = kv.next().unwrap_or("");

        match key {
            "code" => code = Some(urlencoding::decode(value).unwrap_or_default().to_string()),
            "state" => state = Some(urlencoding::decode(value).unwrap_or_default().to_string()),
            "error" => {
                return Err(CloudError::TokenExchange(format!(
                    "authorization denied: {value}"
                )))
            }
            _ => {}
        }
    }

    let code =
        code.ok_or_else(|| CloudError::TokenExchange("callback missing code".to_string()))?;
    let state =
        state.ok_or_else(|| CloudError::TokenExchange("callback missing state".to_string()))?;

    Ok((code, state))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_callback_request() {
        let request = "GET /callback?code=abc123&state=xyz789 HTTP/1.1\r\nHost: localhost\r\n";
        let (code, state) = parse_callback_request(request).unwrap();
        assert_eq!(code, "abc123");
        assert_eq!(state, "xyz789");
    }

    #[test]
    fn test_parse_callback_request_url_encoded() {
        let request = "GET /callback?code=4%2F0AbCd&state=st%3D1 HTTP/1.1\r\n";
        let (code, state) = parse_callback_request(request).unwrap();
        assert_eq!(code, "4/0AbCd");
        assert_eq!(state, "st=1");
    }

    #[test]
    fn test_parse_callback_request_denied() {
        let request = "GET /callback?error=access_denied&state=xyz HTTP/1.1\r\n";
        assert!(matches!(
            parse_callback_request(request),
            Err(CloudError::TokenExchange(_))
        ));
    }

    #[test]
    fn test_parse_callback_request_missing_code() {
        let request = "GET /callback?state=xyz HTTP/1.1\r\n";
        assert!(parse_callback_request(request).is_err());
    }

    #[test]
    fn test_request_targets_callback() {
        assert!(request_targets_callback("GET /callback?code=1&state=2 HTTP/1.1\r\n"));
        assert!(!request_targets_callback("GET /favicon.ico HTTP/1.1\r\n"));
    }

    #[test]
    fn test_onedrive_config_tenant() {
        let config = OAuthConfig::onedrive(
            "id",
            "secret",
            OAuthConfig::default_scopes(ProviderKind::Onedrive),
            "common",
            8080,
        );
        assert!(config.auth_url.contains("/common/"));
        assert_eq!(config.redirect_uri, "http://localhost:8080/callback");

        let tenant = OAuthConfig::onedrive("id", "secret", vec![], "contoso", 8080);
        assert!(tenant.token_url.contains("/contoso/"));
    }

    #[test]
    fn test_google_config_offline_access() {
        let config = OAuthConfig::google(
            "id",
            "secret",
            OAuthConfig::default_scopes(ProviderKind::Gdrive),
            8080,
        );
        assert!(!config.scopes.is_empty());
        assert!(config
            .extra_auth_params
            .contains(&("access_type".to_string(), "offline".to_string())));
    }

    #[test]
    fn test_token_set_keeps_old_refresh_token() {
        let mut credential = Credential::profile(
            ProviderKind::Gdrive,
            "id",
            "secret",
            vec!["scope".to_string()],
            None,
        );
        credential.refresh_token = Some("old-refresh".to_string());

        let set = TokenSet {
            access_token: "new-access".to_string(),
            refresh_token: None,
            expires_at: Some(Utc::now()),
        };
        set.apply_to(&mut credential);

        assert_eq!(credential.access_token, "new-access");
        assert_eq!(credential.refresh_token.as_deref(), Some("old-refresh"));
    }
}
