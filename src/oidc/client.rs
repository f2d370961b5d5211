//! OAuth 2.0 / OIDC client.
//!
//! Owns the protocol side of a login: discovery, the authorization redirect,
//! completing a login from the redirect response, token storage, silent
//! refresh and revocation. The session orchestrator drives it through
//! [`AuthBackend`].

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use super::config::{OidcConfig, ResponseType};
use super::discovery::{fetch_discovery_document, DiscoveryDocument};
use super::events::{EventBus, OAuthEvent, Subscription};
use super::flow::{build_authorization_url, parse_redirect, RedirectResponse, TokenResponse};
use super::jwks::JwksCache;
use super::refresh::spawn_silent_refresh_task;
use super::validator::{allowed_algorithms, validate_id_token, IdentityClaims};
use crate::session::AuthBackend;
use crate::storage::{generate_code_verifier, PendingAuthorization, TokenSet, TokenStore};

/// HTTP timeout for every call to the identity provider.
const HTTP_TIMEOUT_SECS: u64 = 10;

/// What a redirect response hands over.
enum Grant {
    Tokens(TokenResponse),
    Code(String),
}

/// Cheaply cloneable handle to the OAuth client.
#[derive(Clone)]
pub struct OAuthService {
    inner: Arc<Inner>,
}

struct Inner {
    config: OnceLock<OidcConfig>,
    http_client: reqwest::Client,
    store: Arc<TokenStore>,
    discovery: RwLock<Option<DiscoveryDocument>>,
    jwks: RwLock<Option<Arc<JwksCache>>>,
    events: EventBus,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl OAuthService {
    pub fn new(store: Arc<TokenStore>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            inner: Arc::new(Inner {
                config: OnceLock::new(),
                http_client,
                store,
                discovery: RwLock::new(None),
                jwks: RwLock::new(None),
                events: EventBus::new(),
                refresh_task: Mutex::new(None),
            }),
        })
    }

    /// The configuration supplied through `configure`.
    pub fn config(&self) -> Result<&OidcConfig> {
        self.inner
            .config
            .get()
            .ok_or_else(|| anyhow!("OAuth client is not configured"))
    }

    pub(crate) fn emit(&self, event: OAuthEvent) {
        debug!(event = %event, "OAuth event");
        self.inner.events.emit(event);
    }

    pub(crate) fn tokens(&self) -> Option<TokenSet> {
        self.inner.store.tokens()
    }

    #[cfg(test)]
    pub(crate) fn store_for_test(&self, tokens: TokenSet) {
        self.inner.store.save_tokens(tokens).unwrap();
    }

    /// Use an already-loaded discovery document and key set.
    pub fn set_discovery_document(
        &self,
        document: DiscoveryDocument,
        jwks: JwksCache,
    ) -> Result<()> {
        {
            let mut guard = self
                .inner
                .jwks
                .write()
                .map_err(|_| anyhow!("JWKS lock poisoned"))?;
            *guard = Some(Arc::new(jwks));
        }
        let mut guard = self
            .inner
            .discovery
            .write()
            .map_err(|_| anyhow!("Discovery lock poisoned"))?;
        *guard = Some(document);
        Ok(())
    }

    fn discovery(&self) -> Result<Option<DiscoveryDocument>> {
        self.inner
            .discovery
            .read()
            .map(|d| d.clone())
            .map_err(|_| anyhow!("Discovery lock poisoned"))
    }

    fn jwks(&self) -> Result<Arc<JwksCache>> {
        let guard = self
            .inner
            .jwks
            .read()
            .map_err(|_| anyhow!("JWKS lock poisoned"))?;
        guard
            .as_ref()
            .cloned()
            .ok_or_else(|| anyhow!("JWKS not initialized, discovery document not loaded"))
    }

    /// Fetch and validate the discovery document, once.
    pub async fn load_discovery_document(&self) -> Result<DiscoveryDocument> {
        if let Some(document) = self.discovery()? {
            return Ok(document);
        }

        let config = self.config()?;

        let document = match fetch_discovery_document(&self.inner.http_client, config).await {
            Ok(document) => document,
            Err(e) => {
                self.emit(OAuthEvent::DiscoveryDocumentLoadError(format!("{:#}", e)));
                return Err(e);
            }
        };

        if let Err(e) = document.validate(config) {
            self.emit(OAuthEvent::DiscoveryDocumentValidationError(e.to_string()));
            return Err(e.context("Invalid discovery document"));
        }

        let jwks = JwksCache::new(document.jwks_uri.clone(), self.inner.http_client.clone());
        self.set_discovery_document(document.clone(), jwks)?;

        info!(issuer = %document.issuer, "Discovery document loaded");
        self.emit(OAuthEvent::DiscoveryDocumentLoaded);

        Ok(document)
    }

    /// Complete a login from the redirect response in `location`.
    ///
    /// Returns `true` when tokens were received, `false` when `location`
    /// carries no login response.
    pub async fn try_login(&self, location: &Url) -> Result<bool> {
        let config = self.config()?;

        let (state, grant) = match parse_redirect(location, config.response_type)? {
            RedirectResponse::None => return Ok(false),
            RedirectResponse::Error {
                error,
                description,
                state,
            } => {
                let reason = match description {
                    Some(description) => format!("{}: {}", error, description),
                    None => error,
                };
                warn!(
                    state = ?state.as_ref().map(|s| s.as_str()),
                    reason = %reason,
                    "Login rejected"
                );
                self.emit(OAuthEvent::TokenError(reason.clone()));
                bail!("Identity provider returned an error: {}", reason);
            }
            RedirectResponse::Implicit { state, tokens } => (state, Grant::Tokens(tokens)),
            RedirectResponse::Code { state, code } => (state, Grant::Code(code)),
        };

        let Some(pending) = self.inner.store.take_pending(&state)? else {
            self.emit(OAuthEvent::InvalidNonceInState);
            bail!("No pending login matches state '{}'", state);
        };

        let tokens = match grant {
            Grant::Tokens(tokens) => tokens,
            Grant::Code(code) => {
                let verifier = pending
                    .code_verifier
                    .as_deref()
                    .ok_or_else(|| anyhow!("Pending login has no PKCE verifier"))?;
                self.exchange_code(&code, verifier).await?
            }
        };

        self.store_token_response(tokens, Some(pending.nonce.as_str()), None)
            .await?;

        info!(location = %super::flow::strip_login_params(location), "Login completed");
        self.emit(OAuthEvent::TokenReceived);
        Ok(true)
    }

    /// Validate the ID token in `response` and store the resulting token set.
    async fn store_token_response(
        &self,
        response: TokenResponse,
        expected_nonce: Option<&str>,
        previous: Option<TokenSet>,
    ) -> Result<()> {
        let config = self.config()?;

        if !response.is_bearer() {
            let reason = format!("unsupported token_type {:?}", response.token_type);
            self.emit(OAuthEvent::TokenError(reason.clone()));
            bail!(reason);
        }

        let token_set = TokenSet::new(response.access_token.clone(), response.expires_in_secs());
        let mut token_set = match token_set {
            Ok(token_set) => token_set,
            Err(e) => {
                self.emit(OAuthEvent::TokenError(e.to_string()));
                return Err(e);
            }
        };

        let claims: Option<IdentityClaims> = match response.id_token {
            Some(ref id_token) => {
                let jwks = self.jwks()?;
                let allowed_algs = self
                    .discovery()?
                    .map(|d| d.signing_algorithms())
                    .unwrap_or_else(|| allowed_algorithms(&[]));
                match validate_id_token(
                    config,
                    &jwks,
                    &allowed_algs,
                    id_token,
                    expected_nonce,
                    Some(&response.access_token),
                )
                .await
                {
                    Ok(claims) => Some(claims),
                    Err(e) => {
                        self.emit(OAuthEvent::TokenValidationError(format!("{:#}", e)));
                        return Err(e);
                    }
                }
            }
            None if expected_nonce.is_some() && config.scopes().iter().any(|s| s == "openid") => {
                self.emit(OAuthEvent::TokenValidationError("missing id_token".to_string()));
                bail!("Login response has no ID token although 'openid' was requested");
            }
            None => previous.as_ref().and_then(|p| p.claims.clone()),
        };

        token_set.granted_scopes = response.granted_scopes(config);
        token_set.id_token = response
            .id_token
            .clone()
            .or_else(|| previous.as_ref().and_then(|p| p.id_token.clone()));
        token_set.refresh_token = response
            .refresh_token
            .clone()
            .or_else(|| previous.as_ref().and_then(|p| p.refresh_token.clone()));
        token_set.claims = claims;

        if config.show_debug_information {
            debug!(
                access_token = %token_set.access_token,
                id_token = ?token_set.id_token,
                expires_at = %token_set.expires_at,
                "Tokens stored"
            );
        }

        self.inner.store.save_tokens(token_set)
    }

    /// Redeem an authorization code at the token endpoint.
    async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<TokenResponse> {
        let config = self.config()?;
        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", config.redirect_uri.clone()),
            ("client_id", config.client_id.clone()),
            ("code_verifier", code_verifier.to_string()),
        ];
        if let Some(ref secret) = config.dummy_client_secret {
            form.push(("client_secret", secret.clone()));
        }

        match self.post_token_endpoint(&form).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.emit(OAuthEvent::TokenError(format!("{:#}", e)));
                Err(e)
            }
        }
    }

    async fn post_token_endpoint(&self, form: &[(&str, String)]) -> Result<TokenResponse> {
        let token_endpoint = self
            .discovery()?
            .and_then(|d| d.token_endpoint)
            .ok_or_else(|| anyhow!("Discovery document has no token endpoint"))?;

        let response = self
            .inner
            .http_client
            .post(&token_endpoint)
            .form(form)
            .send()
            .await
            .context("Failed to reach token endpoint")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Token endpoint returned status {}: {}", status, body);
        }

        response
            .json::<TokenResponse>()
            .await
            .context("Failed to parse token response")
    }

    /// Build the authorization URL and remember what the redirect must echo.
    pub async fn init_login_flow(&self) -> Result<Url> {
        let config = self.config()?;
        let discovery = self.load_discovery_document().await?;

        let code_verifier = match config.response_type {
            ResponseType::Code => Some(generate_code_verifier()),
            ResponseType::IdTokenToken => None,
        };
        let pending = PendingAuthorization::new(code_verifier);
        let url = build_authorization_url(config, &discovery, &pending)?;
        self.inner.store.save_pending(&pending)?;

        debug!(state = %pending.state, "Login flow started");
        Ok(url)
    }

    /// Obtain new tokens without user interaction.
    ///
    /// Only a refresh token allows this; the implicit flow receives none, and
    /// reports a silent refresh error instead.
    pub async fn silent_refresh(&self) -> Result<()> {
        let Some(current) = self.tokens() else {
            bail!("No tokens to refresh");
        };

        let Some(refresh_token) = current.refresh_token.clone() else {
            let reason = "no refresh token held; interactive login required".to_string();
            self.emit(OAuthEvent::SilentRefreshError(reason.clone()));
            bail!(reason);
        };

        let config = self.config()?;
        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token),
            ("client_id", config.client_id.clone()),
        ];
        if let Some(ref secret) = config.dummy_client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let result = match self.post_token_endpoint(&form).await {
            Ok(response) => self.store_token_response(response, None, Some(current)).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!("Tokens refreshed");
                self.emit(OAuthEvent::TokenRefreshed);
                Ok(())
            }
            Err(e) => {
                self.emit(OAuthEvent::TokenRefreshError(format!("{:#}", e)));
                Err(e)
            }
        }
    }

    /// Revoke held tokens at the revocation endpoint.
    pub async fn revoke_token(&self) -> Result<()> {
        let tokens = self.tokens().ok_or_else(|| anyhow!("No token to revoke"))?;

        let endpoint = match self.discovery()? {
            Some(document) => document.revocation_endpoint,
            None => self.load_discovery_document().await?.revocation_endpoint,
        }
        .ok_or_else(|| anyhow!("Identity provider has no revocation endpoint"))?;

        let mut to_revoke = vec![tokens.access_token.clone()];
        if let Some(refresh_token) = tokens.refresh_token {
            to_revoke.push(refresh_token);
        }

        for token in to_revoke {
            let result = self
                .inner
                .http_client
                .post(&endpoint)
                .form(&[("token", token.as_str())])
                .send()
                .await
                .context("Failed to reach revocation endpoint");

            let failure = match result {
                Ok(response) if response.status().is_success() => None,
                Ok(response) => Some(anyhow!(
                    "Revocation endpoint returned status {}",
                    response.status()
                )),
                Err(e) => Some(e),
            };

            if let Some(e) = failure {
                self.emit(OAuthEvent::TokenRevokeError(format!("{:#}", e)));
                return Err(e);
            }
        }

        info!("Tokens revoked");
        Ok(())
    }

    /// Drop the local session.
    pub fn log_out(&self) {
        match self.inner.store.clear_tokens() {
            Ok(held) => debug!(held, "Local tokens cleared"),
            Err(e) => error!(error = %e, "Failed to clear stored tokens"),
        }
        self.emit(OAuthEvent::Logout);
    }

    /// Access token within its lifetime.
    pub fn has_valid_access_token(&self) -> bool {
        self.tokens().map(|t| t.is_valid()).unwrap_or(false)
    }

    /// Start the refresh timer. Later calls do nothing.
    pub fn setup_automatic_silent_refresh(&self) {
        let Ok(mut task) = self.inner.refresh_task.lock() else {
            warn!("Refresh task lock poisoned, silent refresh not started");
            return;
        };
        if task.is_none() {
            debug!("Starting automatic silent refresh");
            *task = Some(spawn_silent_refresh_task(self.clone()));
        }
    }

    /// Stop background work.
    pub fn shutdown(&self) {
        if let Ok(mut task) = self.inner.refresh_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.events.subscribe()
    }
}

#[async_trait]
impl AuthBackend for OAuthService {
    fn configure(&self, config: OidcConfig) -> Result<()> {
        config.validate().map_err(|e| anyhow!(e))?;
        let issuer = config.issuer.clone();
        self.inner
            .config
            .set(config)
            .map_err(|_| anyhow!("OAuth client is already configured"))?;
        info!(issuer = %issuer, "OAuth client configured");
        Ok(())
    }

    fn setup_automatic_silent_refresh(&self) {
        OAuthService::setup_automatic_silent_refresh(self)
    }

    async fn load_discovery_document_and_try_login(&self, location: &Url) -> Result<()> {
        self.load_discovery_document().await?;
        self.try_login(location).await?;
        Ok(())
    }

    async fn init_login_flow(&self) -> Result<Url> {
        OAuthService::init_login_flow(self).await
    }

    fn has_valid_access_token(&self) -> bool {
        OAuthService::has_valid_access_token(self)
    }

    fn access_token(&self) -> Option<String> {
        self.tokens().map(|t| t.access_token)
    }

    fn id_token(&self) -> Option<String> {
        self.tokens().and_then(|t| t.id_token)
    }

    fn identity_claims(&self) -> Option<IdentityClaims> {
        self.tokens().and_then(|t| t.claims)
    }

    async fn revoke_token(&self) -> Result<()> {
        OAuthService::revoke_token(self).await
    }

    fn log_out(&self) {
        OAuthService::log_out(self)
    }

    fn subscribe(&self) -> Subscription {
        OAuthService::subscribe(self)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::oidc::discovery::tests::GOOGLE_DISCOVERY;
    use crate::oidc::validator::tests::{at_hash_for, mint_id_token, test_jwks};
    use serde_json::json;
    use tempfile::tempdir;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Configured client with Google's discovery document and a test key set.
    pub(crate) fn test_service(response_type: ResponseType) -> (OAuthService, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(TokenStore::open(dir.path().join("session.redb")).unwrap());
        let service = OAuthService::new(store).unwrap();

        service
            .configure(OidcConfig {
                client_id: "X".to_string(),
                redirect_uri: "https://app.example/home".to_string(),
                response_type,
                ..Default::default()
            })
            .unwrap();

        let mut discovery: DiscoveryDocument = serde_json::from_str(GOOGLE_DISCOVERY).unwrap();
        discovery.id_token_signing_alg_values_supported = vec!["HS256".to_string()];
        service.set_discovery_document(discovery, test_jwks()).unwrap();

        (service, dir)
    }

    fn query_param(url: &Url, name: &str) -> String {
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    /// Start a login and build the redirect the provider would send back.
    pub(crate) async fn login_redirect(service: &OAuthService, access_token: &str) -> Url {
        let auth_url = service.init_login_flow().await.unwrap();
        let state = query_param(&auth_url, "state");
        let nonce = query_param(&auth_url, "nonce");
        let id_token = mint_id_token("X", &nonce, json!({"at_hash": at_hash_for(access_token)}));

        Url::parse(&format!(
            "https://app.example/home#access_token={}&id_token={}&state={}{}",
            access_token, id_token, state, "&expires_in=3599&token_type=Bearer"
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_configure_once() {
        let (service, _dir) = test_service(ResponseType::IdTokenToken);
        let valid = OidcConfig {
            client_id: "other".to_string(),
            ..Default::default()
        };
        assert!(service.configure(valid).unwrap_err().to_string().contains("already"));
        assert_eq!(service.config().unwrap().client_id, "X");
    }

    #[tokio::test]
    async fn test_implicit_login_round_trip() {
        let (service, _dir) = test_service(ResponseType::IdTokenToken);
        let mut events = service.subscribe();

        let location = login_redirect(&service, "ya29.access").await;
        assert!(service.try_login(&location).await.unwrap());

        assert!(service.has_valid_access_token());
        assert_eq!(AuthBackend::access_token(&service).as_deref(), Some("ya29.access"));
        let claims = service.identity_claims().unwrap();
        assert_eq!(claims["email"], "user@example.com");
        assert_eq!(claims["sub"], "110169484474386276334");
        assert!(events.drain().contains(&OAuthEvent::TokenReceived));
    }

    #[tokio::test]
    async fn test_state_cannot_be_replayed() {
        let (service, _dir) = test_service(ResponseType::IdTokenToken);
        let location = login_redirect(&service, "ya29.access").await;
        service.try_login(&location).await.unwrap();
        service.log_out();

        let mut events = service.subscribe();
        assert!(service.try_login(&location).await.is_err());
        assert!(!service.has_valid_access_token());
        assert_eq!(events.drain(), vec![OAuthEvent::InvalidNonceInState]);
    }

    #[tokio::test]
    async fn test_tampered_access_token_rejected() {
        let (service, _dir) = test_service(ResponseType::IdTokenToken);
        let location = login_redirect(&service, "ya29.access").await;
        let tampered = Url::parse(
            &location
                .as_str()
                .replace("access_token=ya29.access", "access_token=ya29.other"),
        )
        .unwrap();

        let mut events = service.subscribe();
        assert!(service.try_login(&tampered).await.is_err());
        assert!(service.identity_claims().is_none());
        assert_eq!(events.drain()[0].kind(), "token_validation_error");
    }

    #[tokio::test]
    async fn test_error_redirect_emits_token_error() {
        let (service, _dir) = test_service(ResponseType::IdTokenToken);
        let mut events = service.subscribe();
        let location =
            Url::parse("https://app.example/home#error=access_denied&state=abc").unwrap();

        assert!(service.try_login(&location).await.is_err());
        assert_eq!(
            events.drain(),
            vec![OAuthEvent::TokenError("access_denied".to_string())]
        );
    }

    #[tokio::test]
    async fn test_plain_location_is_not_a_login() {
        let (service, _dir) = test_service(ResponseType::IdTokenToken);
        let location = Url::parse("https://app.example/home").unwrap();
        assert!(!service.try_login(&location).await.unwrap());
        assert!(!service.has_valid_access_token());
    }

    #[tokio::test]
    async fn test_code_flow_url_persists_verifier() {
        let (service, _dir) = test_service(ResponseType::Code);
        let url = service.init_login_flow().await.unwrap();
        assert_eq!(query_param(&url, "response_type"), "code");
        assert_eq!(query_param(&url, "code_challenge_method"), "S256");

        let state = crate::storage::AuthState::from(query_param(&url, "state").as_str());
        let pending = service.inner.store.take_pending(&state).unwrap().unwrap();
        let verifier = pending.code_verifier.unwrap();
        assert_eq!(
            query_param(&url, "code_challenge"),
            super::super::flow::code_challenge(&verifier)
        );
    }

    #[tokio::test]
    async fn test_log_out_clears_tokens() {
        let (service, _dir) = test_service(ResponseType::IdTokenToken);
        let location = login_redirect(&service, "ya29.access").await;
        service.try_login(&location).await.unwrap();

        let mut events = service.subscribe();
        service.log_out();
        assert!(!service.has_valid_access_token());
        assert!(service.identity_claims().is_none());
        assert_eq!(events.drain(), vec![OAuthEvent::Logout]);
    }

    #[tokio::test]
    async fn test_silent_refresh_without_refresh_token() {
        let (service, _dir) = test_service(ResponseType::IdTokenToken);
        let location = login_redirect(&service, "ya29.access").await;
        service.try_login(&location).await.unwrap();

        let mut events = service.subscribe();
        assert!(service.silent_refresh().await.is_err());
        assert_eq!(events.drain()[0].kind(), "silent_refresh_error");
        // The held token is untouched
        assert!(service.has_valid_access_token());
    }

    #[tokio::test]
    async fn test_oversized_expires_in_rejected() {
        let (service, _dir) = test_service(ResponseType::IdTokenToken);
        let location = login_redirect(&service, "ya29.access").await;
        let oversized = Url::parse(
            &location
                .as_str()
                .replace("expires_in=3599", "expires_in=18446744073709551"),
        )
        .unwrap();

        let mut events = service.subscribe();
        assert!(service.try_login(&oversized).await.is_err());
        assert!(!service.has_valid_access_token());
        assert_eq!(events.drain()[0].kind(), "token_error");
    }

    fn provider_discovery(uri: &str) -> serde_json::Value {
        json!({
            "issuer": uri,
            "authorization_endpoint": format!("{}/auth", uri),
            "token_endpoint": format!("{}/token", uri),
            "jwks_uri": format!("{}/certs", uri),
            "revocation_endpoint": format!("{}/revoke", uri),
            "response_types_supported": ["code", "token id_token"],
            "id_token_signing_alg_values_supported": ["HS256"]
        })
    }

    /// Client whose identity provider is `server`.
    fn provider_service(
        server: &MockServer,
        response_type: ResponseType,
    ) -> (OAuthService, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(TokenStore::open(dir.path().join("session.redb")).unwrap());
        let service = OAuthService::new(store).unwrap();
        service
            .configure(OidcConfig {
                issuer: server.uri(),
                client_id: "X".to_string(),
                redirect_uri: "https://app.example/home".to_string(),
                response_type,
                ..Default::default()
            })
            .unwrap();
        (service, dir)
    }

    /// Complete a code-flow login against `server`. Tokens: `ya29.code`
    /// and refresh token `1//refresh`.
    async fn code_login(server: &MockServer, service: &OAuthService) {
        let discovery: DiscoveryDocument =
            serde_json::from_value(provider_discovery(&server.uri())).unwrap();
        service.set_discovery_document(discovery, test_jwks()).unwrap();

        let auth_url = service.init_login_flow().await.unwrap();
        let state = query_param(&auth_url, "state");
        let nonce = query_param(&auth_url, "nonce");
        let id_token = mint_id_token(
            "X",
            &nonce,
            json!({"iss": server.uri(), "at_hash": at_hash_for("ya29.code")}),
        );

        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=4%2F0Adeu"))
            .and(body_string_contains("code_verifier="))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "ya29.code",
                "id_token": id_token,
                "refresh_token": "1//refresh",
                "expires_in": 3599,
                "scope": "openid email",
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(server)
            .await;

        let location = Url::parse(&format!(
            "https://app.example/home?code=4%2F0Adeu&state={}",
            state
        ))
        .unwrap();
        assert!(service.try_login(&location).await.unwrap());
    }

    #[tokio::test]
    async fn test_load_discovery_document_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(provider_discovery(&server.uri())),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (service, _dir) = provider_service(&server, ResponseType::IdTokenToken);
        let mut events = service.subscribe();

        let document = service.load_discovery_document().await.unwrap();
        assert_eq!(document.token_endpoint, Some(format!("{}/token", server.uri())));
        // Cached afterwards
        service.load_discovery_document().await.unwrap();

        assert_eq!(events.drain(), vec![OAuthEvent::DiscoveryDocumentLoaded]);
    }

    #[tokio::test]
    async fn test_discovery_load_error_event() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (service, _dir) = provider_service(&server, ResponseType::IdTokenToken);
        let mut events = service.subscribe();

        assert!(service.load_discovery_document().await.is_err());
        assert_eq!(events.drain()[0].kind(), "discovery_document_load_error");
    }

    #[tokio::test]
    async fn test_code_flow_exchanges_code() {
        let server = MockServer::start().await;
        let (service, _dir) = provider_service(&server, ResponseType::Code);

        code_login(&server, &service).await;

        let tokens = service.tokens().unwrap();
        assert_eq!(tokens.access_token, "ya29.code");
        assert_eq!(tokens.refresh_token.as_deref(), Some("1//refresh"));
        assert_eq!(tokens.granted_scopes, vec!["openid", "email"]);
        assert_eq!(service.identity_claims().unwrap()["email"], "user@example.com");
    }

    #[tokio::test]
    async fn test_silent_refresh_with_refresh_token() {
        let server = MockServer::start().await;
        let (service, _dir) = provider_service(&server, ResponseType::Code);
        code_login(&server, &service).await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=1%2F%2Frefresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "ya29.refreshed",
                "expires_in": 3599,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut events = service.subscribe();
        service.silent_refresh().await.unwrap();

        assert_eq!(events.drain(), vec![OAuthEvent::TokenRefreshed]);
        let tokens = service.tokens().unwrap();
        assert_eq!(tokens.access_token, "ya29.refreshed");
        // Kept from the login response
        assert_eq!(tokens.refresh_token.as_deref(), Some("1//refresh"));
        assert_eq!(service.identity_claims().unwrap()["sub"], "110169484474386276334");
    }

    #[tokio::test]
    async fn test_silent_refresh_rejected_by_provider() {
        let server = MockServer::start().await;
        let (service, _dir) = provider_service(&server, ResponseType::Code);
        code_login(&server, &service).await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})),
            )
            .mount(&server)
            .await;

        let mut events = service.subscribe();
        assert!(service.silent_refresh().await.is_err());

        let events = events.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "token_refresh_error");
        assert!(events[0].reason().unwrap().contains("invalid_grant"));
        assert_eq!(service.tokens().unwrap().access_token, "ya29.code");
    }

    #[tokio::test]
    async fn test_revoke_access_and_refresh_tokens() {
        let server = MockServer::start().await;
        let (service, _dir) = provider_service(&server, ResponseType::Code);
        code_login(&server, &service).await;

        for token in ["token=ya29.code", "token=1%2F%2Frefresh"] {
            Mock::given(method("POST"))
                .and(path("/revoke"))
                .and(body_string_contains(token))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(&server)
                .await;
        }

        let mut events = service.subscribe();
        service.revoke_token().await.unwrap();
        assert!(events.drain().is_empty());
    }

    #[tokio::test]
    async fn test_failed_revocation_then_log_out() {
        let server = MockServer::start().await;
        let (service, _dir) = provider_service(&server, ResponseType::Code);
        code_login(&server, &service).await;

        Mock::given(method("POST"))
            .and(path("/revoke"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let mut events = service.subscribe();
        assert!(service.revoke_token().await.is_err());
        service.log_out();

        assert!(service.tokens().is_none());
        let events = events.drain();
        assert_eq!(events[0].kind(), "token_revoke_error");
        assert_eq!(events[1], OAuthEvent::Logout);
    }
}
