//! Error kinds surfaced by the gateway core.

use std::time::Duration;

use thiserror::Error;

/// Which OAuth leg failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthErrorKind {
    DiscoveryFailed,
    DcrFailed,
    TokenExchangeFailed,
    TokenRefreshFailed,
    StateMismatch,
}

impl std::fmt::Display for OAuthErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DiscoveryFailed => "discovery failed",
            Self::DcrFailed => "dynamic client registration failed",
            Self::TokenExchangeFailed => "token exchange failed",
            Self::TokenRefreshFailed => "token refresh failed",
            Self::StateMismatch => "callback state mismatch",
        };
        f.write_str(s)
    }
}

/// Errors surfaced across the gateway's public operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("server not found: {0}")]
    ConfigNotFound(String),

    #[error("duplicate server name: {0}")]
    DuplicateName(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("server {0} is not connected")]
    NotConnected(String),

    #[error("no such tool: {0}")]
    NoSuchTool(String),

    #[error("no such resource: {0}")]
    NoSuchResource(String),

    #[error("no such prompt: {0}")]
    NoSuchPrompt(String),

    /// JSON-RPC error from the upstream, passed through.
    #[error("upstream error {code}: {message}")]
    Upstream { code: i32, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Connect suspended pending user consent. Not fatal.
    #[error("awaiting OAuth authorization for server {0}")]
    AwaitingOauth(String),

    #[error("oauth error: {kind}: {detail}")]
    OAuth {
        kind: OAuthErrorKind,
        detail: String,
    },

    /// Persistence failed; in-memory state remains authoritative.
    #[error("store persistence error: {0}")]
    StorePersist(String),
}

impl GatewayError {
    pub fn oauth(kind: OAuthErrorKind, detail: impl Into<String>) -> Self {
        Self::OAuth {
            kind,
            detail: detail.into(),
        }
    }

    /// Whether this error leaves the session in a benign suspended state
    /// rather than a failure.
    pub fn is_awaiting_oauth(&self) -> bool {
        matches!(self, Self::AwaitingOauth(_))
    }
}
