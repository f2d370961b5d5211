//! The OAuth client as seen by the session orchestrator.

use anyhow::Result;
use async_trait::async_trait;
use url::Url;

use crate::oidc::{IdentityClaims, OidcConfig, Subscription};

/// Operations the orchestrator drives on the OAuth client.
///
/// The client owns token storage, refresh timers and protocol details; the
/// orchestrator only sequences these calls.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Supply the configuration. Accepted once.
    fn configure(&self, config: OidcConfig) -> Result<()>;

    /// Start refreshing tokens before they expire.
    fn setup_automatic_silent_refresh(&self);

    /// Fetch the discovery document, then complete a login if `location`
    /// carries a redirect response.
    async fn load_discovery_document_and_try_login(&self, location: &Url) -> Result<()>;

    /// Start a login: returns the authorization URL to send the browser to.
    async fn init_login_flow(&self) -> Result<Url>;

    fn has_valid_access_token(&self) -> bool;

    fn access_token(&self) -> Option<String>;

    fn id_token(&self) -> Option<String>;

    fn identity_claims(&self) -> Option<IdentityClaims>;

    /// Revoke the held tokens at the identity provider.
    async fn revoke_token(&self) -> Result<()>;

    /// Forget all local session state.
    fn log_out(&self);

    fn subscribe(&self) -> Subscription;
}
