//! Unauthenticated landing view.

use std::sync::Arc;
use tracing::debug;

use crate::session::SessionManager;

pub struct LoginView {
    session: Arc<SessionManager>,
}

impl LoginView {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    /// Start the Google login redirect.
    pub async fn sign_in_with_google(&self) {
        self.session.login().await;
    }

    /// Placeholder for a second sign-in method. Does nothing.
    pub fn sign_in_with_password(&self) {
        debug!("Password sign-in is not available");
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("Simple OAuth Login\n");
        out.push_str("==================\n\n");
        out.push_str("You are not signed in.\n\n");
        out.push_str("  login    Sign in with Google\n");
        out
    }
}
