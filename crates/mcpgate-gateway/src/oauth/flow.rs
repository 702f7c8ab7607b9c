//! Authorization-code flow legs: authorization URL, code exchange, token
//! refresh, and client-side dynamic registration (RFC 7591).

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};
use url::Url;

use mcpgate_core::{GatewayError, OAuthClientInfo, OAuthErrorKind, OAuthTokens};

use super::discovery::AuthServerMetadata;
use super::pkce::{self, PkcePair};

/// Client metadata advertised during DCR and mirrored in the authorization
/// request.
#[derive(Debug, Clone, Serialize)]
pub struct ClientMetadata {
    pub client_name: String,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<String>,
    pub response_types: Vec<String>,
    pub token_endpoint_auth_method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// A prepared authorization request, ready to hand to the user's browser.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub authorization_url: String,
    pub state: String,
    pub pkce: PkcePair,
}

/// Build the authorization URL with PKCE for one attempt.
pub fn build_authorization_request(
    metadata: &AuthServerMetadata,
    client_id: &str,
    redirect_uri: &str,
    scopes: Option<&str>,
) -> Result<AuthorizationRequest, GatewayError> {
    let state = pkce::generate_state();
    let pair = PkcePair::generate();

    let mut url = Url::parse(&metadata.authorization_endpoint).map_err(|e| {
        GatewayError::oauth(
            OAuthErrorKind::DiscoveryFailed,
            format!("bad authorization endpoint: {e}"),
        )
    })?;

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("response_type", "code");
        query.append_pair("client_id", client_id);
        query.append_pair("redirect_uri", redirect_uri);
        if let Some(scope) = scopes {
            if !scope.is_empty() {
                query.append_pair("scope", scope);
            }
        }
        query.append_pair("state", &state);
        query.append_pair("code_challenge", &pair.challenge);
        query.append_pair("code_challenge_method", pkce::CHALLENGE_METHOD);
    }

    debug!(url = %url, "built authorization URL");
    Ok(AuthorizationRequest {
        authorization_url: url.to_string(),
        state,
        pkce: pair,
    })
}

/// Wire shape of a token-endpoint response (RFC 6749 §5.1).
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl From<TokenResponse> for OAuthTokens {
    fn from(r: TokenResponse) -> Self {
        OAuthTokens {
            access_token: r.access_token,
            token_type: r.token_type,
            expires_in: r.expires_in,
            scope: r.scope,
            refresh_token: r.refresh_token,
            obtained_at: Utc::now(),
            extra: r.extra,
        }
    }
}

/// Exchange an authorization code for tokens.
pub async fn exchange_code(
    http: &reqwest::Client,
    metadata: &AuthServerMetadata,
    client: &OAuthClientInfo,
    code: &str,
    redirect_uri: &str,
    code_verifier: &str,
) -> Result<OAuthTokens, GatewayError> {
    info!(token_endpoint = %metadata.token_endpoint, "exchanging authorization code");

    let mut params = HashMap::new();
    params.insert("grant_type", "authorization_code");
    params.insert("code", code);
    params.insert("redirect_uri", redirect_uri);
    params.insert("client_id", client.client_id.as_str());
    params.insert("code_verifier", code_verifier);
    if let Some(secret) = &client.client_secret {
        params.insert("client_secret", secret.as_str());
    }

    post_token_request(http, &metadata.token_endpoint, &params, OAuthErrorKind::TokenExchangeFailed)
        .await
}

/// Refresh an access token with a stored refresh token.
pub async fn refresh_tokens(
    http: &reqwest::Client,
    metadata: &AuthServerMetadata,
    client: &OAuthClientInfo,
    refresh_token: &str,
) -> Result<OAuthTokens, GatewayError> {
    info!(token_endpoint = %metadata.token_endpoint, "refreshing access token");

    let mut params = HashMap::new();
    params.insert("grant_type", "refresh_token");
    params.insert("refresh_token", refresh_token);
    params.insert("client_id", client.client_id.as_str());
    if let Some(secret) = &client.client_secret {
        params.insert("client_secret", secret.as_str());
    }

    post_token_request(http, &metadata.token_endpoint, &params, OAuthErrorKind::TokenRefreshFailed)
        .await
}

async fn post_token_request(
    http: &reqwest::Client,
    token_endpoint: &str,
    params: &HashMap<&str, &str>,
    kind: OAuthErrorKind,
) -> Result<OAuthTokens, GatewayError> {
    let response = http
        .post(token_endpoint)
        .form(params)
        .send()
        .await
        .map_err(|e| GatewayError::oauth(kind, e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(GatewayError::oauth(kind, format!("HTTP {status}: {body}")));
    }

    let tokens: TokenResponse = response
        .json()
        .await
        .map_err(|e| GatewayError::oauth(kind, e.to_string()))?;
    Ok(tokens.into())
}

/// Register a client dynamically (RFC 7591) and return the issued
/// credentials. Unknown response fields are preserved.
pub async fn register_client(
    http: &reqwest::Client,
    registration_endpoint: &str,
    metadata: &ClientMetadata,
) -> Result<OAuthClientInfo, GatewayError> {
    info!(registration_endpoint, "registering OAuth client (DCR)");

    let response = http
        .post(registration_endpoint)
        .json(metadata)
        .send()
        .await
        .map_err(|e| GatewayError::oauth(OAuthErrorKind::DcrFailed, e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(GatewayError::oauth(
            OAuthErrorKind::DcrFailed,
            format!("HTTP {status}: {body}"),
        ));
    }

    let info: OAuthClientInfo = response
        .json()
        .await
        .map_err(|e| GatewayError::oauth(OAuthErrorKind::DcrFailed, e.to_string()))?;

    info!(client_id = %info.client_id, "DCR registration complete");
    Ok(info)
}

/// Whether a refresh failure means the grant itself is dead (the stored
/// refresh token will never work again).
pub fn is_invalid_grant(err: &GatewayError) -> bool {
    match err {
        GatewayError::OAuth { detail, .. } => detail.contains("invalid_grant"),
        _ => false,
    }
}
