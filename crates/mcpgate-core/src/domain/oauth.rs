//! Persisted OAuth client state.
//!
//! One record per server id: registered client information, the current
//! token set, and the PKCE verifier for an in-flight authorization.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Token set returned by a token endpoint, plus the issuance instant used
/// for expiry math. Field names stay in the wire form (RFC 6749) so the
/// raw response round-trips; unknown fields are preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default = "Utc::now")]
    pub obtained_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OAuthTokens {
    /// Absolute expiry instant, when the server reported one.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_in
            .map(|secs| self.obtained_at + Duration::seconds(secs))
    }

    /// True once the access token has expired. Tokens without `expires_in`
    /// never expire.
    pub fn is_expired(&self) -> bool {
        match self.expires_at() {
            Some(at) => Utc::now() >= at,
            None => false,
        }
    }

    /// True when the token expires within `buffer_seconds` from now.
    pub fn expires_soon(&self, buffer_seconds: i64) -> bool {
        match self.expires_at() {
            Some(at) => Utc::now() + Duration::seconds(buffer_seconds) >= at,
            None => false,
        }
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }

    /// `Authorization` header value for this token set.
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

/// Client credentials, statically configured or obtained through dynamic
/// client registration. Field names stay in the RFC 7591 wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthClientInfo {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_issued_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OAuthClientInfo {
    pub fn new(client_id: impl Into<String>, client_secret: Option<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
            client_id_issued_at: None,
            client_secret_expires_at: None,
            extra: Map::new(),
        }
    }
}

/// Everything the store persists for one server's OAuth relationship.
/// Removed together with the server config.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthPersistedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<OAuthClientInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<OAuthTokens>,
    /// PKCE verifier, present only while an authorization is in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_verifier: Option<String>,
}

impl OAuthPersistedState {
    pub fn is_empty(&self) -> bool {
        self.client_info.is_none() && self.tokens.is_none() && self.code_verifier.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(expires_in: Option<i64>) -> OAuthTokens {
        OAuthTokens {
            access_token: "at".to_string(),
            token_type: "Bearer".to_string(),
            expires_in,
            scope: None,
            refresh_token: Some("rt".to_string()),
            obtained_at: Utc::now(),
            extra: Map::new(),
        }
    }

    #[test]
    fn fresh_token_is_not_expired() {
        let t = tokens(Some(3600));
        assert!(!t.is_expired());
        assert!(!t.expires_soon(60));
        assert!(t.expires_soon(7200));
    }

    #[test]
    fn token_without_expiry_never_expires() {
        let t = tokens(None);
        assert!(!t.is_expired());
        assert!(!t.expires_soon(i64::MAX / 2));
    }

    #[test]
    fn authorization_header_format() {
        assert_eq!(tokens(None).authorization_header(), "Bearer at");
    }

    #[test]
    fn extra_fields_round_trip() {
        let json = serde_json::json!({
            "access_token": "a",
            "token_type": "Bearer",
            "obtained_at": "2025-06-01T00:00:00Z",
            "id_token": "opaque"
        });
        let t: OAuthTokens = serde_json::from_value(json).unwrap();
        assert_eq!(t.extra.get("id_token").unwrap(), "opaque");
        let back = serde_json::to_value(&t).unwrap();
        assert_eq!(back["id_token"], "opaque");
    }
}
