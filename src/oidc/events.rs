//! OAuth lifecycle events and the bus that carries them.

use std::fmt;
use tokio::sync::broadcast;

/// Events are dropped for subscribers lagging further behind than this.
const EVENT_BUS_CAPACITY: usize = 64;

/// Something that happened in the OAuth client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OAuthEvent {
    DiscoveryDocumentLoaded,
    DiscoveryDocumentLoadError(String),
    DiscoveryDocumentValidationError(String),
    /// A login completed and tokens were stored.
    TokenReceived,
    /// The identity provider answered the redirect with an error.
    TokenError(String),
    /// The ID token failed validation.
    TokenValidationError(String),
    /// The redirect state matched no pending login.
    InvalidNonceInState,
    /// The access token reached its refresh point.
    TokenExpires,
    TokenRefreshed,
    TokenRefreshError(String),
    /// No non-interactive refresh channel is available.
    SilentRefreshError(String),
    TokenRevokeError(String),
    Logout,
}

impl OAuthEvent {
    /// Stable event name.
    pub fn kind(&self) -> &'static str {
        match self {
            OAuthEvent::DiscoveryDocumentLoaded => "discovery_document_loaded",
            OAuthEvent::DiscoveryDocumentLoadError(_) => "discovery_document_load_error",
            OAuthEvent::DiscoveryDocumentValidationError(_) => {
                "discovery_document_validation_error"
            }
            OAuthEvent::TokenReceived => "token_received",
            OAuthEvent::TokenError(_) => "token_error",
            OAuthEvent::TokenValidationError(_) => "token_validation_error",
            OAuthEvent::InvalidNonceInState => "invalid_nonce_in_state",
            OAuthEvent::TokenExpires => "token_expires",
            OAuthEvent::TokenRefreshed => "token_refreshed",
            OAuthEvent::TokenRefreshError(_) => "token_refresh_error",
            OAuthEvent::SilentRefreshError(_) => "silent_refresh_error",
            OAuthEvent::TokenRevokeError(_) => "token_revoke_error",
            OAuthEvent::Logout => "logout",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            OAuthEvent::DiscoveryDocumentLoadError(_)
                | OAuthEvent::DiscoveryDocumentValidationError(_)
                | OAuthEvent::TokenError(_)
                | OAuthEvent::TokenValidationError(_)
                | OAuthEvent::InvalidNonceInState
                | OAuthEvent::TokenRefreshError(_)
                | OAuthEvent::SilentRefreshError(_)
                | OAuthEvent::TokenRevokeError(_)
        )
    }

    /// Error detail, if this is an error event carrying one.
    pub fn reason(&self) -> Option<&str> {
        match self {
            OAuthEvent::DiscoveryDocumentLoadError(r)
            | OAuthEvent::DiscoveryDocumentValidationError(r)
            | OAuthEvent::TokenError(r)
            | OAuthEvent::TokenValidationError(r)
            | OAuthEvent::TokenRefreshError(r)
            | OAuthEvent::SilentRefreshError(r)
            | OAuthEvent::TokenRevokeError(r) => Some(r),
            _ => None,
        }
    }
}

impl fmt::Display for OAuthEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason() {
            Some(reason) => write!(f, "{}: {}", self.kind(), reason),
            None => write!(f, "{}", self.kind()),
        }
    }
}

/// Broadcast channel of [`OAuthEvent`]s. Cloning shares the channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OAuthEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    /// Publish to current subscribers. Having none is fine.
    pub fn emit(&self, event: OAuthEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber's handle. Dropping it or calling [`Subscription::unsubscribe`]
/// detaches from the bus.
pub struct Subscription {
    receiver: broadcast::Receiver<OAuthEvent>,
}

impl Subscription {
    /// Wait for the next event. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<OAuthEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Drain events already delivered, without waiting.
    pub fn drain(&mut self) -> Vec<OAuthEvent> {
        let mut events = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) => events.push(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}
