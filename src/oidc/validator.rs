//! ID token validation.

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use tracing::debug;

use super::config::OidcConfig;
use super::jwks::JwksCache;

/// Decoded identity claims: claim name to claim value, in name order.
pub type IdentityClaims = serde_json::Map<String, serde_json::Value>;

/// Signing algorithms the provider advertises. RS256 when it lists none it
/// can be held to.
pub fn allowed_algorithms(advertised: &[String]) -> Vec<Algorithm> {
    let allowed: Vec<Algorithm> = advertised
        .iter()
        .filter_map(|alg| Algorithm::from_str(alg).ok())
        .collect();
    if allowed.is_empty() {
        vec![Algorithm::RS256]
    } else {
        allowed
    }
}

/// Validate an ID token and return its claims.
///
/// Checks the signing algorithm against `allowed_algs`, the signature,
/// issuer, audience (the client id), expiry with the configured clock skew,
/// the nonce bound at login (absent on refresh) and, when an access token
/// arrived alongside, its `at_hash`.
pub async fn validate_id_token(
    config: &OidcConfig,
    jwks: &JwksCache,
    allowed_algs: &[Algorithm],
    id_token: &str,
    expected_nonce: Option<&str>,
    access_token: Option<&str>,
) -> Result<IdentityClaims> {
    let header = decode_header(id_token).context("Failed to decode ID token header")?;

    debug!(kid = ?header.kid, alg = ?header.alg, "Validating ID token");

    if !allowed_algs.contains(&header.alg) {
        bail!(
            "ID token signed with {:?}, provider allows {:?}",
            header.alg,
            allowed_algs
        );
    }

    let decoding_key = jwks.get_key(header.kid.as_deref()).await?;

    let mut validation = Validation::new(header.alg);
    validation.leeway = config.clock_skew_secs;
    validation.set_issuer(&config.accepted_issuers());
    validation.set_audience(&[&config.client_id]);
    validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

    let token_data = decode::<IdentityClaims>(id_token, &decoding_key, &validation)
        .context("ID token validation failed")?;
    let claims = token_data.claims;

    if let Some(expected) = expected_nonce {
        match claims.get("nonce").and_then(|v| v.as_str()) {
            Some(nonce) if nonce == expected => {}
            Some(_) => bail!("ID token nonce does not match the login request"),
            None => bail!("ID token has no nonce"),
        }
    }

    if let (Some(access_token), Some(at_hash)) =
        (access_token, claims.get("at_hash").and_then(|v| v.as_str()))
    {
        verify_at_hash(access_token, at_hash, header.alg)?;
    }

    debug!(
        sub = subject(&claims).unwrap_or_default(),
        claim_count = claims.len(),
        "ID token validated"
    );

    Ok(claims)
}

/// Check the `at_hash` claim: base64url of the left half of the access token
/// hash, using the hash size of the signing algorithm.
pub fn verify_at_hash(access_token: &str, at_hash: &str, alg: Algorithm) -> Result<()> {
    match alg {
        Algorithm::RS256 | Algorithm::HS256 | Algorithm::ES256 | Algorithm::PS256 => {
            let digest = Sha256::digest(access_token.as_bytes());
            let expected = URL_SAFE_NO_PAD.encode(&digest[..digest.len() / 2]);
            if expected != at_hash {
                return Err(anyhow!("Access token hash does not match at_hash claim"));
            }
            Ok(())
        }
        other => {
            debug!(alg = ?other, "Skipping at_hash check for algorithm");
            Ok(())
        }
    }
}

/// Subject of a claims set, if present.
pub fn subject(claims: &IdentityClaims) -> Option<&str> {
    claims.get("sub").and_then(|v| v.as_str())
}
