//! Session orchestrator.
//!
//! Configures the OAuth client once, drives discovery and login completion
//! at startup, starts and ends logins, and forwards lifecycle events to the
//! log.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use super::backend::AuthBackend;
use crate::oidc::validator::subject;
use crate::oidc::{IdentityClaims, OAuthEvent, OidcConfig, Subscription};
use crate::router::{Navigator, Route};

/// Derived from whether a valid access token is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
}

/// Result of startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// A valid token is held; the caller should show the authenticated view.
    Authenticated,
    /// Stay on the unauthenticated view.
    Unauthenticated,
}

impl InitOutcome {
    /// Route to navigate to, if any.
    pub fn landing_route(&self) -> Option<Route> {
        match self {
            InitOutcome::Authenticated => Some(Route::Home),
            InitOutcome::Unauthenticated => None,
        }
    }
}

/// One per application, shared by `Arc` with the views that need it.
pub struct SessionManager {
    config: OidcConfig,
    backend: Arc<dyn AuthBackend>,
    navigator: Arc<dyn Navigator>,
    initialized: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(
        config: OidcConfig,
        backend: Arc<dyn AuthBackend>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        Self {
            config,
            backend,
            navigator,
            initialized: AtomicBool::new(false),
            listener: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &OidcConfig {
        &self.config
    }

    /// Start the session. Call once, before showing any authenticated view.
    ///
    /// `location` is the URL the application was loaded at; after a redirect
    /// back from the identity provider it carries the login response.
    pub async fn initialize(&self, location: &Url) -> Result<InitOutcome> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(anyhow!("Session already initialized"));
        }

        info!(issuer = %self.config.issuer, "Initializing OAuth configuration");

        self.backend.configure(self.config.clone())?;
        self.backend.setup_automatic_silent_refresh();
        self.start_event_listener();

        if let Err(e) = self
            .backend
            .load_discovery_document_and_try_login(location)
            .await
        {
            error!(error = %e, "Error during OAuth initialization");
            return Err(e);
        }

        info!("OAuth initialization completed");
        debug!(
            access_token = ?self.backend.access_token(),
            id_token = ?self.backend.id_token(),
            "Session tokens"
        );

        if self.backend.has_valid_access_token() {
            info!("Access token is valid");
            Ok(InitOutcome::Authenticated)
        } else {
            info!("No valid access token found");
            Ok(InitOutcome::Unauthenticated)
        }
    }

    /// Send the browser to the identity provider. Errors are logged, never
    /// returned; each call starts a new login.
    pub async fn login(&self) {
        info!("Starting login process");
        match self.backend.init_login_flow().await {
            Ok(url) => self.navigator.redirect(&url),
            Err(e) => error!(error = %e, "Could not start login"),
        }
    }

    /// Revoke the token, then clear local state whatever the revocation did.
    pub async fn logout(&self) {
        info!("Starting logout process");
        if let Err(e) = self.backend.revoke_token().await {
            warn!(error = %e, "Token revocation failed, logging out locally");
        }
        self.backend.log_out();
    }

    pub fn get_profile(&self) -> Option<IdentityClaims> {
        self.backend.identity_claims()
    }

    pub fn get_token(&self) -> Option<String> {
        self.backend.access_token()
    }

    pub fn state(&self) -> SessionState {
        if self.backend.has_valid_access_token() {
            SessionState::Authenticated
        } else {
            SessionState::Unauthenticated
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.backend.subscribe()
    }

    /// Stop forwarding events.
    pub fn shutdown(&self) {
        if let Ok(mut listener) = self.listener.lock() {
            if let Some(handle) = listener.take() {
                handle.abort();
            }
        }
    }

    fn start_event_listener(&self) {
        let Ok(mut listener) = self.listener.lock() else {
            warn!("Listener lock poisoned, OAuth events will not be logged");
            return;
        };
        if listener.is_none() {
            *listener = Some(spawn_event_listener(
                Arc::clone(&self.backend),
                self.backend.subscribe(),
            ));
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Log every lifecycle event. Reacts to none of them beyond logging.
fn spawn_event_listener(
    backend: Arc<dyn AuthBackend>,
    mut events: Subscription,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            debug!(event = event.kind(), "OAuth event");
            match event {
                OAuthEvent::TokenReceived | OAuthEvent::TokenRefreshed => {
                    let claims = backend.identity_claims();
                    let sub = claims.as_ref().and_then(subject);
                    info!(event = event.kind(), sub = ?sub, "Token received");
                    debug!(
                        access_token = ?backend.access_token(),
                        id_token = ?backend.id_token(),
                        "Received tokens"
                    );
                }
                ref e if e.is_error() => {
                    error!(
                        event = e.kind(),
                        reason = e.reason().unwrap_or_default(),
                        "Token error event"
                    );
                }
                _ => {}
            }
        }
    })
}
