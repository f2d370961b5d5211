//! Authentication session lifecycle.
//!
//! [`SessionManager`] sequences the OAuth client through startup, login and
//! logout and exposes the resulting identity to the views.

pub mod backend;
pub mod manager;

pub use backend::AuthBackend;
pub use manager::{InitOutcome, SessionManager, SessionState};
