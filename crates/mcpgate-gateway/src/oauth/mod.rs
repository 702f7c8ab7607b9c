//! OAuth 2.0 + PKCE client machinery for protected upstream servers.
//!
//! - `discovery`: `.well-known` resolution (RFC 9728 → RFC 8414 → OIDC)
//! - `pkce`: S256 verifier/challenge pairs
//! - `flow`: authorization URL, code exchange, refresh, DCR
//! - `provider`: the callback contract transports depend on, store-backed
//! - `manager`: per-server provider registry and flow entry points

pub mod discovery;
pub mod flow;
pub mod manager;
pub mod pkce;
pub mod provider;

pub use discovery::{AuthServerMetadata, OAuthDiscovery};
pub use flow::ClientMetadata;
pub use manager::{AuthOutcome, AuthStatus, OAuthManager};
pub use provider::{
    CredentialScope, OAuthClientServices, OAuthSettings, StoreBackedOAuthProvider,
};
