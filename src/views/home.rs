//! Authenticated view: shows the identity claims of the signed-in user.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::oidc::{IdentityClaims, OAuthEvent, Subscription};
use crate::router::{Navigator, Route};
use crate::session::SessionManager;

pub struct HomeView {
    session: Arc<SessionManager>,
    navigator: Arc<dyn Navigator>,
    profile: Option<IdentityClaims>,
    events: Option<Subscription>,
}

impl HomeView {
    pub fn new(session: Arc<SessionManager>, navigator: Arc<dyn Navigator>) -> Self {
        Self {
            session,
            navigator,
            profile: None,
            events: None,
        }
    }

    /// Read the profile and start following session events.
    pub fn on_init(&mut self) {
        self.profile = self.session.get_profile();
        if self.events.is_none() {
            self.events = Some(self.session.subscribe());
        }
    }

    pub fn profile(&self) -> Option<&IdentityClaims> {
        self.profile.as_ref()
    }

    /// Apply pending session events. Returns how many were seen.
    pub fn poll_events(&mut self) -> usize {
        let Some(events) = self.events.as_mut() else {
            return 0;
        };
        let pending = events.drain();
        for event in &pending {
            match event {
                OAuthEvent::TokenReceived | OAuthEvent::TokenRefreshed => {
                    debug!(event = event.kind(), "Reloading profile");
                    self.profile = self.session.get_profile();
                }
                OAuthEvent::Logout => {
                    self.profile = None;
                }
                e if e.is_error() => {
                    warn!(
                        event = e.kind(),
                        reason = e.reason().unwrap_or_default(),
                        "Session event"
                    );
                }
                _ => {}
            }
        }
        pending.len()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("Home\n====\n\n");
        match &self.profile {
            Some(profile) => {
                out.push_str("Identity claims:\n");
                let json = serde_json::to_string_pretty(profile)
                    .unwrap_or_else(|e| format!("<unprintable claims: {}>", e));
                out.push_str(&json);
                out.push('\n');
            }
            None => out.push_str("No profile available.\n"),
        }
        out
    }

    /// End the session and go back to the login view.
    pub async fn log_out(&mut self) {
        self.session.logout().await;
        self.profile = None;
        self.navigator.navigate(Route::Login);
    }

    /// Stop following session events.
    pub fn destroy(&mut self) {
        if let Some(events) = self.events.take() {
            events.unsubscribe();
        }
    }
}

impl Drop for HomeView {
    fn drop(&mut self) {
        self.destroy();
    }
}
