//! OAuth server discovery.
//!
//! Resolution order for a protected MCP server:
//! 1. `<server>/.well-known/oauth-protected-resource` (RFC 9728) names the
//!    authorization server; when absent the server's own origin is assumed
//!    to be the issuer.
//! 2. `<issuer>/.well-known/oauth-authorization-server` (RFC 8414), falling
//!    back to OpenID Connect Discovery.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use mcpgate_core::{GatewayError, OAuthErrorKind};

/// Authorization-server metadata (RFC 8414 / OIDC discovery).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,

    #[serde(default)]
    pub registration_endpoint: Option<String>,

    #[serde(default)]
    pub scopes_supported: Vec<String>,

    #[serde(default)]
    pub response_types_supported: Vec<String>,

    #[serde(default)]
    pub grant_types_supported: Vec<String>,

    #[serde(default)]
    pub code_challenge_methods_supported: Vec<String>,

    #[serde(default)]
    pub token_endpoint_auth_methods_supported: Vec<String>,
}

impl AuthServerMetadata {
    pub fn supports_pkce(&self) -> bool {
        self.code_challenge_methods_supported
            .iter()
            .any(|m| m == super::pkce::CHALLENGE_METHOD)
    }
}

/// Protected-resource metadata (RFC 9728).
#[derive(Debug, Clone, Deserialize)]
pub struct ProtectedResourceMetadata {
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub authorization_servers: Vec<String>,
}

/// Discovery client over a shared reqwest client.
pub struct OAuthDiscovery {
    http: reqwest::Client,
}

impl OAuthDiscovery {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Full discovery for a protected MCP server URL.
    pub async fn discover_for_server(
        &self,
        server_url: &str,
    ) -> Result<AuthServerMetadata, GatewayError> {
        let issuer = match self.fetch_protected_resource(server_url).await {
            Ok(meta) if !meta.authorization_servers.is_empty() => {
                meta.authorization_servers[0].clone()
            }
            Ok(_) | Err(_) => {
                let origin = origin_of(server_url)?;
                debug!(
                    server_url,
                    issuer = %origin,
                    "no protected-resource metadata; assuming server origin is the issuer"
                );
                origin
            }
        };
        self.fetch_auth_server_metadata(&issuer).await
    }

    /// Fetch authorization-server metadata from an issuer, AS metadata
    /// first, OIDC discovery as the fallback.
    pub async fn fetch_auth_server_metadata(
        &self,
        issuer: &str,
    ) -> Result<AuthServerMetadata, GatewayError> {
        let base = issuer.trim_end_matches('/');

        let as_url = format!("{base}/.well-known/oauth-authorization-server");
        debug!(url = %as_url, "trying OAuth AS metadata");
        match self.fetch_json::<AuthServerMetadata>(&as_url).await {
            Ok(meta) => {
                info!(issuer, "OAuth AS discovery succeeded");
                return Ok(meta);
            }
            Err(e) => debug!(error = %e, "AS metadata unavailable, trying OIDC discovery"),
        }

        let oidc_url = format!("{base}/.well-known/openid-configuration");
        debug!(url = %oidc_url, "trying OIDC discovery");
        match self.fetch_json::<AuthServerMetadata>(&oidc_url).await {
            Ok(meta) => {
                info!(issuer, "OIDC discovery succeeded");
                Ok(meta)
            }
            Err(e) => Err(GatewayError::oauth(
                OAuthErrorKind::DiscoveryFailed,
                format!("no metadata at AS or OIDC endpoints of {issuer}: {e}"),
            )),
        }
    }

    async fn fetch_protected_resource(
        &self,
        server_url: &str,
    ) -> Result<ProtectedResourceMetadata, GatewayError> {
        let origin = origin_of(server_url)?;
        let url = format!("{origin}/.well-known/oauth-protected-resource");
        debug!(url = %url, "fetching protected-resource metadata");
        self.fetch_json(&url).await
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, GatewayError> {
        let response = self
            .http
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| GatewayError::oauth(OAuthErrorKind::DiscoveryFailed, e.to_string()))?;

        if !response.status().is_success() {
            return Err(GatewayError::oauth(
                OAuthErrorKind::DiscoveryFailed,
                format!("HTTP {} from {url}", response.status()),
            ));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| GatewayError::oauth(OAuthErrorKind::DiscoveryFailed, e.to_string()))
    }
}

fn origin_of(server_url: &str) -> Result<String, GatewayError> {
    let url = Url::parse(server_url)
        .map_err(|e| GatewayError::oauth(OAuthErrorKind::DiscoveryFailed, e.to_string()))?;
    Ok(url.origin().ascii_serialization())
}
