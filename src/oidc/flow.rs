//! Authorization request construction and redirect response parsing.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use url::Url;

use super::config::{OidcConfig, ResponseType};
use super::discovery::DiscoveryDocument;
use crate::storage::{AuthState, PendingAuthorization};

/// Lifetime assumed when the provider omits `expires_in`.
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// S256 code challenge for a PKCE verifier.
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Build the URL the browser is sent to for login.
pub fn build_authorization_url(
    config: &OidcConfig,
    discovery: &DiscoveryDocument,
    pending: &PendingAuthorization,
) -> Result<Url> {
    let mut url = Url::parse(&discovery.authorization_endpoint)
        .context("Invalid authorization endpoint")?;

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", config.response_type.as_param())
            .append_pair("client_id", &config.client_id)
            .append_pair("redirect_uri", &config.redirect_uri)
            .append_pair("scope", &config.scope)
            .append_pair("state", pending.state.as_str())
            .append_pair("nonce", pending.nonce.as_str());

        if config.response_type == ResponseType::Code {
            let verifier = pending
                .code_verifier
                .as_deref()
                .ok_or_else(|| anyhow!("Code flow requires a PKCE code verifier"))?;
            query
                .append_pair("code_challenge", &code_challenge(verifier))
                .append_pair("code_challenge_method", "S256");
        }
    }

    Ok(url)
}

/// Token endpoint response, also assembled from an implicit-flow fragment.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub id_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
    pub scope: Option<String>,
    pub token_type: Option<String>,
}

impl TokenResponse {
    pub fn expires_in_secs(&self) -> u64 {
        self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS)
    }

    /// Only bearer tokens are usable. A response without `token_type` is
    /// taken as bearer.
    pub fn is_bearer(&self) -> bool {
        self.token_type
            .as_deref()
            .map_or(true, |t| t.eq_ignore_ascii_case("bearer"))
    }

    /// Granted scopes, or the requested ones when the provider does not say.
    pub fn granted_scopes(&self, config: &OidcConfig) -> Vec<String> {
        match self.scope {
            Some(ref scope) => scope.split_whitespace().map(String::from).collect(),
            None => config.scopes(),
        }
    }
}

/// What the identity provider appended to the redirect URI.
#[derive(Debug, Clone)]
pub enum RedirectResponse {
    /// The application was loaded without login parameters.
    None,
    Error {
        error: String,
        description: Option<String>,
        state: Option<AuthState>,
    },
    Implicit {
        state: AuthState,
        tokens: TokenResponse,
    },
    Code {
        state: AuthState,
        code: String,
    },
}

/// Read the redirect response from the location the app was loaded at.
///
/// The implicit flow carries parameters in the fragment, the code flow in the
/// query. Errors may arrive in either.
pub fn parse_redirect(location: &Url, response_type: ResponseType) -> Result<RedirectResponse> {
    let fragment = params(location.fragment().unwrap_or_default());
    let query = params(location.query().unwrap_or_default());

    if let Some(error) = fragment.get("error").or_else(|| query.get("error")) {
        let source = if fragment.contains_key("error") { &fragment } else { &query };
        return Ok(RedirectResponse::Error {
            error: error.clone(),
            description: source.get("error_description").cloned(),
            state: source.get("state").map(|s| AuthState::from(s.as_str())),
        });
    }

    let params = match response_type {
        ResponseType::IdTokenToken => fragment,
        ResponseType::Code => query,
    };

    match response_type {
        ResponseType::IdTokenToken => {
            let Some(access_token) = params.get("access_token") else {
                return Ok(RedirectResponse::None);
            };
            let state = params
                .get("state")
                .ok_or_else(|| anyhow!("Redirect response has no state"))?;
            let expires_in = match params.get("expires_in") {
                Some(v) => Some(v.parse::<u64>().context("Invalid expires_in")?),
                None => None,
            };

            Ok(RedirectResponse::Implicit {
                state: AuthState::from(state.as_str()),
                tokens: TokenResponse {
                    access_token: access_token.clone(),
                    id_token: params.get("id_token").cloned(),
                    refresh_token: None,
                    expires_in,
                    scope: params.get("scope").cloned(),
                    token_type: params.get("token_type").cloned(),
                },
            })
        }
        ResponseType::Code => {
            let Some(code) = params.get("code") else {
                return Ok(RedirectResponse::None);
            };
            let state = params
                .get("state")
                .ok_or_else(|| anyhow!("Redirect response has no state"))?;

            Ok(RedirectResponse::Code {
                state: AuthState::from(state.as_str()),
                code: code.clone(),
            })
        }
    }
}

fn params(raw: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(raw.trim_start_matches(['#', '?']).as_bytes())
        .into_owned()
        .collect()
}

/// The location with login parameters removed, as shown after login completes.
pub fn strip_login_params(location: &Url) -> Url {
    let mut clean = location.clone();
    clean.set_fragment(None);
    clean.set_query(None);
    clean
}
