//! Records persisted across the redirect round trip.

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeDelta, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::oidc::IdentityClaims;

/// How long a login started with `authorization_url()` stays redeemable.
pub const PENDING_AUTHORIZATION_TTL_SECS: i64 = 600;

/// Random nonce bound into the ID token (16 random bytes, hex-encoded).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nonce(String);

impl Nonce {
    /// Generate a fresh nonce.
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Nonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque `state` value echoed back by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthState(String);

impl AuthState {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AuthState {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// PKCE code verifier (RFC 7636), 32 random bytes base64url-encoded.
pub fn generate_code_verifier() -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// A login that was started but not yet completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAuthorization {
    pub state: AuthState,
    pub nonce: Nonce,
    /// Only set for the authorization code flow.
    pub code_verifier: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingAuthorization {
    pub fn new(code_verifier: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            state: AuthState::generate(),
            nonce: Nonce::generate(),
            code_verifier,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(PENDING_AUTHORIZATION_TTL_SECS),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// Tokens held after a successful login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub id_token: Option<String>,
    pub refresh_token: Option<String>,
    pub granted_scopes: Vec<String>,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Decoded claims of `id_token`.
    pub claims: Option<IdentityClaims>,
}

impl TokenSet {
    /// Token set expiring `expires_in_secs` from now. Fails when the lifetime
    /// does not fit a timestamp.
    pub fn new(access_token: String, expires_in_secs: u64) -> Result<Self> {
        let now = Utc::now();
        let expires_at = i64::try_from(expires_in_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or_else(|| anyhow!("Token lifetime out of range: {}s", expires_in_secs))?;

        Ok(Self {
            access_token,
            id_token: None,
            refresh_token: None,
            granted_scopes: Vec::new(),
            stored_at: now,
            expires_at,
            claims: None,
        })
    }

    /// Access token is still within its lifetime.
    pub fn is_valid(&self) -> bool {
        Utc::now() < self.expires_at
    }

    /// Instant at which a silent refresh should be attempted.
    pub fn refresh_due_at(&self, timeout_factor: f64) -> DateTime<Utc> {
        let lifetime_ms = (self.expires_at - self.stored_at).num_milliseconds().max(0);
        let wait_ms = (lifetime_ms as f64 * timeout_factor.clamp(0.0, 1.0)) as i64;
        self.stored_at + chrono::Duration::milliseconds(wait_ms)
    }
}
