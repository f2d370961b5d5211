//! Persistent storage for tokens and in-flight logins.
//!
//! Backed by redb so that state carried across the redirect to the identity
//! provider outlives the process, the way browser storage outlives a
//! full-page navigation.

pub mod store;
pub mod types;

pub use store::TokenStore;
pub use types::{generate_code_verifier, AuthState, Nonce, PendingAuthorization, TokenSet};
