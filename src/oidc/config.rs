//! Session configuration.

use serde::{Deserialize, Serialize};
use url::Url;

/// Google's issuer, the default identity provider.
pub const GOOGLE_ISSUER: &str = "https://accounts.google.com";

/// OAuth 2.0 response type requested at the authorization endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseType {
    /// Implicit flow: tokens come back in the URL fragment.
    IdTokenToken,
    /// Authorization code flow with PKCE: code comes back in the query.
    Code,
}

impl ResponseType {
    /// Value of the `response_type` request parameter.
    pub fn as_param(&self) -> &'static str {
        match self {
            ResponseType::IdTokenToken => "id_token token",
            ResponseType::Code => "code",
        }
    }
}

impl std::str::FromStr for ResponseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "id_token token" | "token id_token" | "implicit" | "id-token-token" => {
                Ok(ResponseType::IdTokenToken)
            }
            "code" => Ok(ResponseType::Code),
            other => Err(format!("Unsupported response type: {}", other)),
        }
    }
}

/// OIDC client configuration. Supplied once to the OAuth client and never
/// changed afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OidcConfig {
    /// Identity provider issuer URL. Discovery is fetched from
    /// `{issuer}/.well-known/openid-configuration`.
    #[serde(default = "default_issuer")]
    pub issuer: String,

    /// Where the identity provider sends the browser back to.
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,

    /// OAuth client identifier registered with the provider.
    #[serde(default)]
    pub client_id: String,

    /// Space-separated scopes to request.
    #[serde(default = "default_scope")]
    pub scope: String,

    /// Require every discovery endpoint to live under the issuer URL.
    /// Google serves its endpoints from other hosts, so this is off by default.
    #[serde(default)]
    pub strict_discovery_document_validation: bool,

    #[serde(default = "default_response_type")]
    pub response_type: ResponseType,

    /// Client secret sent on the code exchange. Google requires one even for
    /// public clients; it offers no confidentiality here.
    #[serde(default)]
    pub dummy_client_secret: Option<String>,

    /// Fraction of the access token lifetime after which a silent refresh runs.
    #[serde(default = "default_timeout_factor")]
    pub timeout_factor: f64,

    /// Clock skew tolerance in seconds for exp/iat validation.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_secs: u64,

    /// Reject plain-HTTP endpoints unless they point at localhost.
    #[serde(default = "default_require_https")]
    pub require_https: bool,

    /// Log token values and raw responses at debug level.
    #[serde(default)]
    pub show_debug_information: bool,
}

fn default_issuer() -> String {
    GOOGLE_ISSUER.to_string()
}

fn default_redirect_uri() -> String {
    "http://localhost:4200/home".to_string()
}

fn default_scope() -> String {
    "openid profile email".to_string()
}

fn default_response_type() -> ResponseType {
    ResponseType::IdTokenToken
}

fn default_timeout_factor() -> f64 {
    0.75
}

fn default_clock_skew() -> u64 {
    600 // 10 minutes
}

fn default_require_https() -> bool {
    true
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            redirect_uri: default_redirect_uri(),
            client_id: String::new(),
            scope: default_scope(),
            strict_discovery_document_validation: false,
            response_type: default_response_type(),
            dummy_client_secret: None,
            timeout_factor: default_timeout_factor(),
            clock_skew_secs: default_clock_skew(),
            require_https: default_require_https(),
            show_debug_information: false,
        }
    }
}

impl OidcConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.client_id.trim().is_empty() {
            return Err("OIDC client_id is required".to_string());
        }

        let issuer = Url::parse(&self.issuer)
            .map_err(|e| format!("OIDC issuer is not a valid URL: {}", e))?;
        if !self.is_secure_url(&issuer) {
            return Err("OIDC issuer must use https".to_string());
        }

        let redirect = Url::parse(&self.redirect_uri)
            .map_err(|e| format!("OIDC redirect_uri is not a valid URL: {}", e))?;
        if redirect.fragment().is_some() {
            return Err("OIDC redirect_uri must not contain a fragment".to_string());
        }

        if !self.scopes().iter().any(|s| s == "openid") {
            return Err("OIDC scope must include 'openid'".to_string());
        }

        if !(self.timeout_factor > 0.0 && self.timeout_factor <= 1.0) {
            return Err("timeout_factor must be in (0, 1]".to_string());
        }

        Ok(())
    }

    /// Requested scopes as a list.
    pub fn scopes(&self) -> Vec<String> {
        self.scope.split_whitespace().map(String::from).collect()
    }

    /// Issuer without trailing slash, for comparisons.
    pub fn normalized_issuer(&self) -> &str {
        self.issuer.trim_end_matches('/')
    }

    /// Issuer values accepted in the `iss` claim of an ID token.
    ///
    /// Google may issue tokens with `iss` set to the bare host.
    pub fn accepted_issuers(&self) -> Vec<String> {
        let issuer = self.normalized_issuer().to_string();
        let mut accepted = vec![issuer.clone()];
        if let Some(bare) = issuer.strip_prefix("https://") {
            if bare == "accounts.google.com" {
                accepted.push(bare.to_string());
            }
        }
        accepted
    }

    /// HTTPS, or any scheme on a loopback host, or anything when HTTPS is not required.
    pub fn is_secure_url(&self, url: &Url) -> bool {
        if !self.require_https || url.scheme() == "https" {
            return true;
        }
        matches!(url.host_str(), Some("localhost") | Some("127.0.0.1") | Some("[::1]"))
    }
}

/// JSON configuration file, overlaid on the defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct OidcConfigJson {
    pub issuer: Option<String>,
    pub redirect_uri: Option<String>,
    pub client_id: Option<String>,
    pub scope: Option<String>,
    pub strict_discovery_document_validation: Option<bool>,
    pub response_type: Option<ResponseType>,
    pub dummy_client_secret: Option<String>,
    pub timeout_factor: Option<f64>,
    pub clock_skew_secs: Option<u64>,
    pub require_https: Option<bool>,
    pub show_debug_information: Option<bool>,
}

impl OidcConfigJson {
    /// Apply JSON config to existing config.
    pub fn apply_to(&self, config: &mut OidcConfig) {
        if let Some(ref issuer) = self.issuer {
            config.issuer = issuer.clone();
        }
        if let Some(ref redirect_uri) = self.redirect_uri {
            config.redirect_uri = redirect_uri.clone();
        }
        if let Some(ref client_id) = self.client_id {
            config.client_id = client_id.clone();
        }
        if let Some(ref scope) = self.scope {
            config.scope = scope.clone();
        }
        if let Some(strict) = self.strict_discovery_document_validation {
            config.strict_discovery_document_validation = strict;
        }
        if let Some(response_type) = self.response_type {
            config.response_type = response_type;
        }
        if let Some(ref secret) = self.dummy_client_secret {
            config.dummy_client_secret = Some(secret.clone());
        }
        if let Some(factor) = self.timeout_factor {
            config.timeout_factor = factor;
        }
        if let Some(skew) = self.clock_skew_secs {
            config.clock_skew_secs = skew;
        }
        if let Some(require_https) = self.require_https {
            config.require_https = require_https;
        }
        if let Some(debug) = self.show_debug_information {
            config.show_debug_information = debug;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn google_config() -> OidcConfig {
        OidcConfig {
            client_id: "X".to_string(),
            redirect_uri: "https://app.example/home".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = OidcConfig::default();
        assert_eq!(config.issuer, "https://accounts.google.com");
        assert_eq!(config.scope, "openid profile email");
        assert_eq!(config.response_type, ResponseType::IdTokenToken);
        assert!(!config.strict_discovery_document_validation);
        assert_eq!(config.timeout_factor, 0.75);
        assert_eq!(config.clock_skew_secs, 600);
    }

    #[test]
    fn test_validation() {
        let mut config = OidcConfig::default();
        assert!(config.validate().is_err()); // missing client_id

        config.client_id = "X".to_string();
        assert!(config.validate().is_ok());

        config.issuer = "http://idp.example.com".to_string();
        assert!(config.validate().is_err()); // plain http remote issuer

        config.issuer = "http://localhost:8080/realms/dev".to_string();
        assert!(config.validate().is_ok());

        config.scope = "profile email".to_string();
        assert!(config.validate().is_err()); // no openid

        config.scope = "openid".to_string();
        config.redirect_uri = "https://app.example/home#frag".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_response_type_parse() {
        assert_eq!("code".parse::<ResponseType>(), Ok(ResponseType::Code));
        assert_eq!(
            "id_token token".parse::<ResponseType>(),
            Ok(ResponseType::IdTokenToken)
        );
        assert!("token".parse::<ResponseType>().is_err());
        assert_eq!(ResponseType::IdTokenToken.as_param(), "id_token token");
    }

    #[test]
    fn test_accepted_issuers() {
        let config = google_config();
        assert_eq!(
            config.accepted_issuers(),
            vec!["https://accounts.google.com", "accounts.google.com"]
        );

        let other = OidcConfig {
            issuer: "https://auth.example.com/".to_string(),
            ..google_config()
        };
        assert_eq!(other.accepted_issuers(), vec!["https://auth.example.com"]);
    }

    #[test]
    fn test_json_apply() {
        let mut config = OidcConfig::default();
        let json: OidcConfigJson = serde_json::from_str(
            r#"{
                "client-id": "abc.apps.googleusercontent.com",
                "redirect-uri": "https://app.example/home",
                "response-type": "code",
                "timeout-factor": 0.5
            }"#,
        )
        .unwrap();

        json.apply_to(&mut config);

        assert_eq!(config.client_id, "abc.apps.googleusercontent.com");
        assert_eq!(config.redirect_uri, "https://app.example/home");
        assert_eq!(config.response_type, ResponseType::Code);
        assert_eq!(config.timeout_factor, 0.5);
        assert_eq!(config.scope, "openid profile email"); // unchanged
        assert!(config.validate().is_ok());
    }
}
