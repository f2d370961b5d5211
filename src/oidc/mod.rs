//! OAuth 2.0 / OpenID Connect client.
//!
//! Discovery, implicit and authorization-code logins, ID token validation
//! against the provider's JWKS, silent refresh and revocation.

pub mod client;
pub mod config;
pub mod discovery;
pub mod events;
pub mod flow;
pub mod jwks;
pub mod refresh;
pub mod validator;

pub use client::OAuthService;
pub use config::{OidcConfig, OidcConfigJson, ResponseType};
pub use events::{EventBus, OAuthEvent, Subscription};
pub use validator::IdentityClaims;
