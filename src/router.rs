//! Views and navigation between them.

use std::sync::RwLock;
use tracing::{debug, info};
use url::Url;

/// In-app destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Route {
    #[default]
    Login,
    Home,
}

impl Route {
    pub fn path(&self) -> &'static str {
        match self {
            Route::Login => "/login",
            Route::Home => "/home",
        }
    }
}

/// Where the application shows things.
pub trait Navigator: Send + Sync {
    /// Switch to another view.
    fn navigate(&self, route: Route);

    /// Leave the application for an external page (full-page redirect).
    fn redirect(&self, url: &Url);

    fn current(&self) -> Route;
}

/// Terminal navigator: tracks the current view and prints redirect targets
/// for the user to open in a browser.
#[derive(Default)]
pub struct ConsoleNavigator {
    current: RwLock<Route>,
}

impl ConsoleNavigator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Navigator for ConsoleNavigator {
    fn navigate(&self, route: Route) {
        debug!(path = route.path(), "Navigating");
        if let Ok(mut current) = self.current.write() {
            *current = route;
        }
    }

    fn redirect(&self, url: &Url) {
        info!(host = url.host_str().unwrap_or_default(), "Redirecting to identity provider");
        println!("Open this URL in your browser to sign in:\n\n  {}\n", url);
        println!("Afterwards run `callback '<the URL you were sent back to>'`.");
    }

    fn current(&self) -> Route {
        self.current.read().map(|r| *r).unwrap_or_default()
    }
}
