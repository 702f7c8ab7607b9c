//! The OAuth client contract a transport depends on, and its store-backed
//! implementation.
//!
//! The transport (and the manager driving the flow) talk to
//! [`OAuthClientServices`] only; where client info, tokens, and verifiers
//! actually live is this module's business.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use mcpgate_core::domain::AuthConfig;
use mcpgate_core::{OAuthClientInfo, OAuthTokens};
use mcpgate_store::FileStore;

use super::flow::ClientMetadata;

/// Which credential subset to discard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialScope {
    All,
    Client,
    Tokens,
    Verifier,
}

/// Static OAuth settings from a server's `AuthConfig`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OAuthSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub scopes: Option<Vec<String>>,
}

impl OAuthSettings {
    /// Extract settings when the auth mode is OAuth.
    pub fn from_auth(auth: &AuthConfig) -> Option<Self> {
        match auth {
            AuthConfig::Oauth {
                client_id,
                client_secret,
                scopes,
            } => Some(Self {
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
                scopes: scopes.clone(),
            }),
            _ => None,
        }
    }

    /// Space-joined scope string, when scopes are configured.
    pub fn scope_string(&self) -> Option<String> {
        self.scopes
            .as_ref()
            .filter(|s| !s.is_empty())
            .map(|s| s.join(" "))
    }
}

/// Invoked when an authorization needs the user's browser. The flow is then
/// suspended, not failed.
pub type AuthRedirectHook = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Callback surface an OAuth-protected transport requires of its client.
#[async_trait]
pub trait OAuthClientServices: Send + Sync {
    /// Redirect target carrying the server id through the browser
    /// round-trip; the callback handler routes on it.
    fn redirect_url(&self) -> String;

    /// Metadata advertised during DCR.
    fn client_metadata(&self) -> ClientMetadata;

    /// Known client credentials: persisted registration first, then static
    /// configuration, else `None` (caller may perform DCR).
    async fn client_information(&self) -> Option<OAuthClientInfo>;

    async fn save_client_information(&self, info: OAuthClientInfo);

    async fn tokens(&self) -> Option<OAuthTokens>;

    /// Persist a token set. Clears the one-shot code verifier before the
    /// tokens hit the store, so a completed flow never leaves a stale
    /// verifier behind.
    async fn save_tokens(&self, tokens: OAuthTokens);

    /// Hand the authorization URL to the outside world; does not block on
    /// the user.
    async fn redirect_to_authorization(&self, url: &str);

    /// Persist the PKCE verifier (memory and store) so a crash between
    /// redirect and callback does not orphan the flow.
    async fn save_code_verifier(&self, verifier: String);

    async fn code_verifier(&self) -> Option<String>;

    async fn invalidate_credentials(&self, scope: CredentialScope);
}

/// One provider per remote server id, backed by the durable store.
pub struct StoreBackedOAuthProvider {
    server_id: String,
    settings: OAuthSettings,
    gateway_base_url: String,
    store: FileStore,
    on_auth_redirect: AuthRedirectHook,
    verifier: parking_lot::Mutex<Option<String>>,
}

impl StoreBackedOAuthProvider {
    pub fn new(
        server_id: impl Into<String>,
        settings: OAuthSettings,
        gateway_base_url: impl Into<String>,
        store: FileStore,
        on_auth_redirect: AuthRedirectHook,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            settings,
            gateway_base_url: gateway_base_url.into(),
            store,
            on_auth_redirect,
            verifier: parking_lot::Mutex::new(None),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn settings(&self) -> &OAuthSettings {
        &self.settings
    }
}

#[async_trait]
impl OAuthClientServices for StoreBackedOAuthProvider {
    fn redirect_url(&self) -> String {
        format!(
            "{}/oauth/callback/{}",
            self.gateway_base_url.trim_end_matches('/'),
            urlencoding::encode(&self.server_id)
        )
    }

    fn client_metadata(&self) -> ClientMetadata {
        ClientMetadata {
            client_name: "mcpgate".to_string(),
            redirect_uris: vec![self.redirect_url()],
            grant_types: vec![
                "authorization_code".to_string(),
                "refresh_token".to_string(),
            ],
            response_types: vec!["code".to_string()],
            token_endpoint_auth_method: if self.settings.client_secret.is_some() {
                "client_secret_post".to_string()
            } else {
                "none".to_string()
            },
            scope: self.settings.scope_string(),
        }
    }

    async fn client_information(&self) -> Option<OAuthClientInfo> {
        if let Some(info) = self.store.get_client_info(&self.server_id).await {
            return Some(info);
        }
        self.settings.client_id.as_ref().map(|id| {
            OAuthClientInfo::new(id.clone(), self.settings.client_secret.clone())
        })
    }

    async fn save_client_information(&self, info: OAuthClientInfo) {
        self.store.set_client_info(&self.server_id, info).await;
    }

    async fn tokens(&self) -> Option<OAuthTokens> {
        self.store.get_tokens(&self.server_id).await
    }

    async fn save_tokens(&self, tokens: OAuthTokens) {
        *self.verifier.lock() = None;
        self.store.clear_code_verifier(&self.server_id).await;
        self.store.set_tokens(&self.server_id, tokens).await;
    }

    async fn redirect_to_authorization(&self, url: &str) {
        debug!(server_id = %self.server_id, "authorization redirect requested");
        (self.on_auth_redirect)(&self.server_id, url);
    }

    async fn save_code_verifier(&self, verifier: String) {
        *self.verifier.lock() = Some(verifier.clone());
        self.store.set_code_verifier(&self.server_id, verifier).await;
    }

    async fn code_verifier(&self) -> Option<String> {
        if let Some(v) = self.verifier.lock().clone() {
            return Some(v);
        }
        self.store.get_code_verifier(&self.server_id).await
    }

    async fn invalidate_credentials(&self, scope: CredentialScope) {
        match scope {
            CredentialScope::All => {
                *self.verifier.lock() = None;
                self.store.remove_oauth_state(&self.server_id).await;
            }
            CredentialScope::Client => {
                // client info only; tokens and verifier stay
                let state = self.store.get_oauth_state(&self.server_id).await;
                if state.client_info.is_some() {
                    self.store.remove_oauth_state(&self.server_id).await;
                    if let Some(tokens) = state.tokens {
                        self.store.set_tokens(&self.server_id, tokens).await;
                    }
                    if let Some(verifier) = state.code_verifier {
                        self.store.set_code_verifier(&self.server_id, verifier).await;
                    }
                }
            }
            CredentialScope::Tokens => {
                self.store.remove_tokens(&self.server_id).await;
            }
            CredentialScope::Verifier => {
                *self.verifier.lock() = None;
                self.store.clear_code_verifier(&self.server_id).await;
            }
        }
    }
}
