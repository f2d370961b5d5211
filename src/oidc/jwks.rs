//! Signing keys of the identity provider, fetched from the discovery `jwks_uri`.

use anyhow::{anyhow, Context, Result};
use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Keys older than this are refetched before use.
pub const DEFAULT_JWKS_MAX_AGE_SECS: u64 = 3600;

/// JWKS cache keyed by `kid`.
///
/// Keys are fetched lazily on first use, and again when a token names a `kid`
/// the cache does not know (provider key rotation).
pub struct JwksCache {
    keys: RwLock<HashMap<String, DecodingKey>>,
    fetched_at: RwLock<Option<Instant>>,
    max_age: Duration,
    jwks_url: String,
    http_client: reqwest::Client,
}

/// JWKS response body.
#[derive(Debug, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// A single JSON Web Key. Only RSA signing keys are used; Google publishes
/// nothing else.
#[derive(Debug, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub kid: Option<String>,
    pub alg: Option<String>,
    #[serde(rename = "use")]
    pub key_use: Option<String>,
    /// RSA modulus (base64url)
    pub n: Option<String>,
    /// RSA exponent (base64url)
    pub e: Option<String>,
}

impl JwksCache {
    pub fn new(jwks_url: String, http_client: reqwest::Client) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            fetched_at: RwLock::new(None),
            max_age: Duration::from_secs(DEFAULT_JWKS_MAX_AGE_SECS),
            jwks_url,
            http_client,
        }
    }

    /// Pre-populated cache that never needs to fetch unless asked for an unknown kid.
    pub fn with_keys(
        jwks_url: String,
        http_client: reqwest::Client,
        keys: HashMap<String, DecodingKey>,
    ) -> Self {
        let cache = Self::new(jwks_url, http_client);
        if let Ok(mut guard) = cache.keys.write() {
            *guard = keys;
        }
        if let Ok(mut fetched) = cache.fetched_at.write() {
            *fetched = Some(Instant::now());
        }
        cache
    }

    /// Decoding key for `kid`, or the only key when the token names none.
    pub async fn get_key(&self, kid: Option<&str>) -> Result<DecodingKey> {
        if self.is_stale()? {
            self.refresh().await?;
        }

        if let Some(key) = self.lookup(kid)? {
            return Ok(key);
        }

        debug!(kid = ?kid, "Key not found in cache, refreshing JWKS");
        self.refresh().await?;

        self.lookup(kid)?
            .ok_or_else(|| anyhow!("Signing key {:?} not found in JWKS", kid))
    }

    fn lookup(&self, kid: Option<&str>) -> Result<Option<DecodingKey>> {
        let keys = self.keys.read().map_err(|_| anyhow!("Lock poisoned"))?;
        let key = match kid {
            Some(kid) => keys.get(kid).cloned(),
            None if keys.len() == 1 => keys.values().next().cloned(),
            None => None,
        };
        Ok(key)
    }

    fn is_stale(&self) -> Result<bool> {
        let fetched_at = self.fetched_at.read().map_err(|_| anyhow!("Lock poisoned"))?;
        Ok(match *fetched_at {
            Some(at) => at.elapsed() >= self.max_age,
            None => true,
        })
    }

    /// Refetch the key set.
    pub async fn refresh(&self) -> Result<()> {
        debug!(url = %self.jwks_url, "Fetching JWKS");

        let response = self
            .http_client
            .get(&self.jwks_url)
            .send()
            .await
            .context("Failed to fetch JWKS")?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "JWKS endpoint returned status {}",
                response.status()
            ));
        }

        let jwks: Jwks = response.json().await.context("Failed to parse JWKS")?;
        let new_keys = Self::decode_keys(jwks)?;
        let key_count = new_keys.len();

        {
            let mut keys = self.keys.write().map_err(|_| anyhow!("Lock poisoned"))?;
            *keys = new_keys;
        }
        {
            let mut fetched_at = self
                .fetched_at
                .write()
                .map_err(|_| anyhow!("Lock poisoned"))?;
            *fetched_at = Some(Instant::now());
        }

        info!(url = %self.jwks_url, key_count, "JWKS refreshed");
        Ok(())
    }

    /// Turn a key set into decoding keys, skipping encryption and unusable keys.
    pub fn decode_keys(jwks: Jwks) -> Result<HashMap<String, DecodingKey>> {
        let mut keys = HashMap::new();
        for jwk in jwks.keys {
            if jwk.key_use.as_deref() == Some("enc") {
                continue;
            }

            match Self::jwk_to_decoding_key(&jwk) {
                Ok(key) => {
                    let kid = jwk.kid.clone().unwrap_or_else(|| "default".to_string());
                    debug!(kid = %kid, alg = ?jwk.alg, "Loaded JWK");
                    keys.insert(kid, key);
                }
                Err(e) => {
                    warn!(kid = ?jwk.kid, kty = %jwk.kty, error = %e, "Skipping JWK");
                }
            }
        }

        if keys.is_empty() {
            return Err(anyhow!("No usable signing keys in JWKS"));
        }
        Ok(keys)
    }

    fn jwk_to_decoding_key(jwk: &Jwk) -> Result<DecodingKey> {
        match jwk.kty.as_str() {
            "RSA" => {
                let n = jwk.n.as_ref().ok_or_else(|| anyhow!("RSA key missing 'n'"))?;
                let e = jwk.e.as_ref().ok_or_else(|| anyhow!("RSA key missing 'e'"))?;
                DecodingKey::from_rsa_components(n, e).context("Invalid RSA key components")
            }
            kty => Err(anyhow!("Unsupported key type: {}", kty)),
        }
    }
}
