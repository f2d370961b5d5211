//! OpenID Provider discovery document.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::config::{OidcConfig, ResponseType};
use super::validator::allowed_algorithms;

/// Well-known path appended to the issuer.
pub const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";

/// The subset of provider metadata the client uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: Option<String>,
    pub jwks_uri: String,
    pub userinfo_endpoint: Option<String>,
    pub revocation_endpoint: Option<String>,
    pub end_session_endpoint: Option<String>,
    #[serde(default)]
    pub response_types_supported: Vec<String>,
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Vec<String>,
}

/// Build the discovery URL for an issuer.
pub fn discovery_url(issuer: &str) -> Result<Url> {
    let url = format!("{}{}", issuer.trim_end_matches('/'), DISCOVERY_PATH);
    Url::parse(&url).with_context(|| format!("Invalid discovery URL: {}", url))
}

/// Fetch and validate the discovery document for the configured issuer.
pub async fn fetch_discovery_document(
    http_client: &reqwest::Client,
    config: &OidcConfig,
) -> Result<DiscoveryDocument> {
    let url = discovery_url(&config.issuer)?;
    debug!(url = %url, "Fetching discovery document");

    let response = http_client
        .get(url.clone())
        .send()
        .await
        .context("Failed to fetch discovery document")?;

    if !response.status().is_success() {
        return Err(anyhow!(
            "Discovery endpoint returned status {}",
            response.status()
        ));
    }

    let document: DiscoveryDocument = response
        .json()
        .await
        .context("Failed to parse discovery document")?;

    Ok(document)
}

impl DiscoveryDocument {
    /// Check the document against the configuration.
    ///
    /// The issuer must always match. With strict validation, every endpoint
    /// must also live under the issuer URL.
    pub fn validate(&self, config: &OidcConfig) -> Result<()> {
        let expected = config.normalized_issuer();
        if self.issuer.trim_end_matches('/') != expected {
            bail!(
                "Discovery issuer '{}' does not match configured issuer '{}'",
                self.issuer,
                expected
            );
        }

        for (name, endpoint) in self.endpoints() {
            let url = Url::parse(endpoint)
                .with_context(|| format!("Discovery {} is not a valid URL", name))?;

            if !config.is_secure_url(&url) {
                bail!("Discovery {} must use https: {}", name, endpoint);
            }

            if config.strict_discovery_document_validation && !endpoint.starts_with(expected) {
                bail!(
                    "Discovery {} '{}' is not under issuer '{}'",
                    name,
                    endpoint,
                    expected
                );
            }
        }

        if self.token_endpoint.is_none() && config.response_type == ResponseType::Code {
            bail!("Discovery document has no token_endpoint, required for the code flow");
        }

        if !self.supports_response_type(config.response_type) {
            bail!(
                "Provider does not support response_type '{}'",
                config.response_type.as_param()
            );
        }

        Ok(())
    }

    /// Whether `response_type` is listed. Word order does not matter; an
    /// empty list says nothing and is accepted.
    pub fn supports_response_type(&self, response_type: ResponseType) -> bool {
        if self.response_types_supported.is_empty() {
            return true;
        }
        fn words(value: &str) -> Vec<&str> {
            let mut words: Vec<&str> = value.split_whitespace().collect();
            words.sort_unstable();
            words
        }
        let wanted = words(response_type.as_param());
        self.response_types_supported
            .iter()
            .any(|supported| words(supported) == wanted)
    }

    /// Algorithms ID tokens may be signed with.
    pub fn signing_algorithms(&self) -> Vec<jsonwebtoken::Algorithm> {
        allowed_algorithms(&self.id_token_signing_alg_values_supported)
    }

    fn endpoints(&self) -> Vec<(&'static str, &str)> {
        let mut endpoints = vec![
            ("authorization_endpoint", self.authorization_endpoint.as_str()),
            ("jwks_uri", self.jwks_uri.as_str()),
        ];
        let optional = [
            ("token_endpoint", &self.token_endpoint),
            ("userinfo_endpoint", &self.userinfo_endpoint),
            ("revocation_endpoint", &self.revocation_endpoint),
            ("end_session_endpoint", &self.end_session_endpoint),
        ];
        for (name, value) in optional {
            if let Some(endpoint) = value {
                endpoints.push((name, endpoint.as_str()));
            }
        }
        endpoints
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Google's published discovery document (trimmed).
    pub(crate) const GOOGLE_DISCOVERY: &str = r#"{
        "issuer": "https://accounts.google.com",
        "authorization_endpoint": "https://accounts.google.com/o/oauth2/v2/auth",
        "device_authorization_endpoint": "https://oauth2.googleapis.com/device/code",
        "token_endpoint": "https://oauth2.googleapis.com/token",
        "userinfo_endpoint": "https://openidconnect.googleapis.com/v1/userinfo",
        "revocation_endpoint": "https://oauth2.googleapis.com/revoke",
        "jwks_uri": "https://www.googleapis.com/oauth2/v3/certs",
        "response_types_supported": [
            "code", "token", "id_token", "code token", "code id_token",
            "token id_token", "code token id_token", "none"
        ],
        "id_token_signing_alg_values_supported": ["RS256"]
    }"#;

    fn google_config() -> OidcConfig {
        OidcConfig {
            client_id: "X".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_discovery_url() {
        let url = discovery_url("https://accounts.google.com/").unwrap();
        assert_eq!(
            url.as_str(),
            "https://accounts.google.com/.well-known/openid-configuration"
        );
    }

    #[test]
    fn test_google_document_lax() {
        let doc: DiscoveryDocument = serde_json::from_str(GOOGLE_DISCOVERY).unwrap();
        assert_eq!(
            doc.revocation_endpoint.as_deref(),
            Some("https://oauth2.googleapis.com/revoke")
        );
        assert!(doc.end_session_endpoint.is_none());
        assert!(doc.validate(&google_config()).is_ok());
    }

    #[test]
    fn test_google_document_strict() {
        let doc: DiscoveryDocument = serde_json::from_str(GOOGLE_DISCOVERY).unwrap();
        let config = OidcConfig {
            strict_discovery_document_validation: true,
            ..google_config()
        };
        let err = doc.validate(&config).unwrap_err();
        assert!(err.to_string().contains("not under issuer"));
    }

    #[test]
    fn test_issuer_mismatch() {
        let mut doc: DiscoveryDocument = serde_json::from_str(GOOGLE_DISCOVERY).unwrap();
        doc.issuer = "https://evil.example.com".to_string();
        assert!(doc.validate(&google_config()).is_err());
    }

    #[test]
    fn test_http_endpoint_rejected() {
        let mut doc: DiscoveryDocument = serde_json::from_str(GOOGLE_DISCOVERY).unwrap();
        doc.jwks_uri = "http://www.googleapis.com/oauth2/v3/certs".to_string();
        assert!(doc.validate(&google_config()).is_err());
    }

    #[test]
    fn test_code_flow_needs_token_endpoint() {
        let mut doc: DiscoveryDocument = serde_json::from_str(GOOGLE_DISCOVERY).unwrap();
        doc.token_endpoint = None;
        assert!(doc.validate(&google_config()).is_ok());

        let config = OidcConfig {
            response_type: ResponseType::Code,
            ..google_config()
        };
        assert!(doc.validate(&config).is_err());
    }

    #[test]
    fn test_response_type_support() {
        let mut doc: DiscoveryDocument = serde_json::from_str(GOOGLE_DISCOVERY).unwrap();
        assert!(doc.supports_response_type(ResponseType::IdTokenToken));
        assert!(doc.supports_response_type(ResponseType::Code));

        doc.response_types_supported = vec!["code".to_string()];
        assert!(!doc.supports_response_type(ResponseType::IdTokenToken));
        assert!(doc.validate(&google_config()).is_err());
    }

    #[test]
    fn test_signing_algorithms() {
        let doc: DiscoveryDocument = serde_json::from_str(GOOGLE_DISCOVERY).unwrap();
        assert_eq!(doc.signing_algorithms(), vec![jsonwebtoken::Algorithm::RS256]);
    }

    fn http_client() -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_fetch_discovery_document() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DISCOVERY_PATH))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(GOOGLE_DISCOVERY, "application/json"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let config = OidcConfig {
            issuer: format!("{}/", server.uri()),
            ..google_config()
        };
        let doc = fetch_discovery_document(&http_client(), &config).await.unwrap();

        assert_eq!(doc.issuer, "https://accounts.google.com");
        assert_eq!(doc.jwks_uri, "https://www.googleapis.com/oauth2/v3/certs");
    }

    #[tokio::test]
    async fn test_fetch_discovery_document_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(DISCOVERY_PATH))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let config = OidcConfig {
            issuer: server.uri(),
            ..google_config()
        };
        let err = fetch_discovery_document(&http_client(), &config)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("503"));
    }
}
