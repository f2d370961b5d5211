//! Application shell: startup sequencing and the current view.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use url::Url;

use crate::router::{Navigator, Route};
use crate::session::{InitOutcome, SessionManager};
use crate::views::{HomeView, LoginView};

pub struct App {
    session: Arc<SessionManager>,
    navigator: Arc<dyn Navigator>,
}

impl App {
    pub fn new(session: Arc<SessionManager>, navigator: Arc<dyn Navigator>) -> Self {
        Self { session, navigator }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Initialize the session against the URL the app was loaded at, then
    /// show the authenticated view if a valid token is held.
    pub async fn bootstrap(&self, location: &Url) -> Result<InitOutcome> {
        let outcome = self.session.initialize(location).await?;
        if let Some(route) = outcome.landing_route() {
            info!(path = route.path(), "Session authenticated");
            self.navigator.navigate(route);
        }
        Ok(outcome)
    }

    pub fn current_route(&self) -> Route {
        self.navigator.current()
    }

    pub fn login_view(&self) -> LoginView {
        LoginView::new(Arc::clone(&self.session))
    }

    pub fn home_view(&self) -> HomeView {
        let mut view = HomeView::new(Arc::clone(&self.session), Arc::clone(&self.navigator));
        view.on_init();
        view
    }

    /// Screen text of the current view.
    pub fn render(&self) -> String {
        match self.current_route() {
            Route::Login => self.login_view().render(),
            Route::Home => self.home_view().render(),
        }
    }
}
