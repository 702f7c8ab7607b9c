//! OAuth manager - registry of per-server providers and the entry points
//! the REST surface and transports drive the flow through.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use mcpgate_core::event_bus::EventSender;
use mcpgate_core::{GatewayError, GatewayEvent, OAuthErrorKind, OAuthTokens};
use mcpgate_store::FileStore;

use super::discovery::{AuthServerMetadata, OAuthDiscovery};
use super::flow;
use super::provider::{
    CredentialScope, OAuthClientServices, OAuthSettings, StoreBackedOAuthProvider,
};

/// Refresh tokens that expire within this many seconds.
const REFRESH_BUFFER_SECS: i64 = 300;

/// Outcome of an auth initiation or callback.
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    /// Existing (or newly exchanged) tokens suffice.
    Authorized,
    /// The user must visit the authorization URL; the flow is suspended.
    Redirect { auth_url: String },
}

impl AuthOutcome {
    pub fn result_str(&self) -> &'static str {
        match self {
            Self::Authorized => "AUTHORIZED",
            Self::Redirect { .. } => "REDIRECT",
        }
    }

    pub fn auth_url(&self) -> Option<&str> {
        match self {
            Self::Redirect { auth_url } => Some(auth_url),
            Self::Authorized => None,
        }
    }
}

/// Pure read of a server's auth posture.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatus {
    pub requires_auth: bool,
    pub is_authenticated: bool,
    pub has_client_info: bool,
}

/// Registry of OAuth providers keyed by server id.
pub struct OAuthManager {
    store: FileStore,
    http: reqwest::Client,
    events: EventSender,
    gateway_base_url: String,
    providers: DashMap<String, Arc<StoreBackedOAuthProvider>>,
    metadata_cache: DashMap<String, AuthServerMetadata>,
}

impl OAuthManager {
    pub fn new(store: FileStore, events: EventSender, gateway_base_url: impl Into<String>) -> Self {
        Self {
            store,
            http: reqwest::Client::new(),
            events,
            gateway_base_url: gateway_base_url.into(),
            providers: DashMap::new(),
            metadata_cache: DashMap::new(),
        }
    }

    /// Return the provider for `id`, lazily creating it. A settings change
    /// on an existing id replaces the provider.
    pub fn get_provider(
        &self,
        id: &str,
        settings: OAuthSettings,
    ) -> Arc<StoreBackedOAuthProvider> {
        if let Some(existing) = self.providers.get(id) {
            if existing.settings() == &settings {
                return existing.clone();
            }
        }
        self.replace_provider(id, settings)
    }

    /// Install a fresh provider for `id`, discarding any previous one.
    pub fn replace_provider(
        &self,
        id: &str,
        settings: OAuthSettings,
    ) -> Arc<StoreBackedOAuthProvider> {
        let events = self.events.clone();
        let provider = Arc::new(StoreBackedOAuthProvider::new(
            id,
            settings,
            self.gateway_base_url.clone(),
            self.store.clone(),
            Arc::new(move |server_id: &str, url: &str| {
                events.emit(GatewayEvent::OauthRequired {
                    server_id: server_id.to_string(),
                    auth_url: url.to_string(),
                });
            }),
        ));
        self.providers.insert(id.to_string(), provider.clone());
        self.metadata_cache.remove(id);
        provider
    }

    /// Drop the provider (config no longer uses OAuth, or server removed).
    pub fn remove_provider(&self, id: &str) {
        self.providers.remove(id);
        self.metadata_cache.remove(id);
    }

    /// Run the authorization routine without a code. `Authorized` when the
    /// stored tokens already work, `Redirect` when a fresh user consent
    /// round-trip was started.
    pub async fn initiate_auth(
        &self,
        id: &str,
        server_url: &str,
        settings: OAuthSettings,
    ) -> Result<AuthOutcome, GatewayError> {
        let provider = self.get_provider(id, settings);

        if let Some(tokens) = provider.tokens().await {
            if !tokens.expires_soon(REFRESH_BUFFER_SECS) {
                debug!(server_id = id, "existing tokens still valid");
                return Ok(AuthOutcome::Authorized);
            }
            match self.try_refresh(id, server_url, &provider, &tokens).await {
                Ok(Some(_)) => return Ok(AuthOutcome::Authorized),
                Ok(None) => {}
                Err(e) => return Err(e),
            }
        }

        let metadata = self.metadata(id, server_url).await?;

        let client = match provider.client_information().await {
            Some(info) => info,
            None => {
                let Some(endpoint) = metadata.registration_endpoint.clone() else {
                    return Err(GatewayError::oauth(
                        OAuthErrorKind::DcrFailed,
                        format!(
                            "{} offers no registration endpoint and no client_id is configured",
                            metadata.issuer
                        ),
                    ));
                };
                let info =
                    flow::register_client(&self.http, &endpoint, &provider.client_metadata())
                        .await?;
                provider.save_client_information(info.clone()).await;
                info
            }
        };

        let request = flow::build_authorization_request(
            &metadata,
            &client.client_id,
            &provider.redirect_url(),
            provider.settings().scope_string().as_deref(),
        )?;

        provider.save_code_verifier(request.pkce.verifier.clone()).await;
        provider
            .redirect_to_authorization(&request.authorization_url)
            .await;

        info!(server_id = id, "authorization redirect issued");
        Ok(AuthOutcome::Redirect {
            auth_url: request.authorization_url,
        })
    }

    /// Exchange half of the flow, driven by the callback handler. Clears
    /// the code verifier on success.
    pub async fn handle_callback(
        &self,
        id: &str,
        server_url: &str,
        code: &str,
        settings: OAuthSettings,
    ) -> Result<AuthOutcome, GatewayError> {
        let provider = self.get_provider(id, settings);

        let Some(verifier) = provider.code_verifier().await else {
            return Err(GatewayError::oauth(
                OAuthErrorKind::StateMismatch,
                format!("no authorization in flight for server {id}"),
            ));
        };

        let Some(client) = provider.client_information().await else {
            return Err(GatewayError::oauth(
                OAuthErrorKind::StateMismatch,
                "authorization callback arrived with no client information",
            ));
        };

        let metadata = self.metadata(id, server_url).await?;
        let tokens = flow::exchange_code(
            &self.http,
            &metadata,
            &client,
            code,
            &provider.redirect_url(),
            &verifier,
        )
        .await?;

        // save_tokens clears the one-shot verifier before persisting
        provider.save_tokens(tokens).await;
        info!(server_id = id, "token exchange complete");
        Ok(AuthOutcome::Authorized)
    }

    /// Valid tokens for a transport, refreshing through the stored refresh
    /// token when the access token is about to lapse. `None` means the
    /// caller must suspend into the authorization flow.
    pub async fn fresh_tokens(
        &self,
        id: &str,
        server_url: &str,
        settings: OAuthSettings,
    ) -> Result<Option<OAuthTokens>, GatewayError> {
        let provider = self.get_provider(id, settings);
        let Some(tokens) = provider.tokens().await else {
            return Ok(None);
        };
        if !tokens.expires_soon(REFRESH_BUFFER_SECS) {
            return Ok(Some(tokens));
        }
        self.try_refresh(id, server_url, &provider, &tokens).await
    }

    /// Pure read of the auth posture for status endpoints.
    pub async fn auth_status(&self, id: &str, requires_auth: bool) -> AuthStatus {
        let state = self.store.get_oauth_state(id).await;
        let is_authenticated = state
            .tokens
            .as_ref()
            .map(|t| !t.is_expired() || t.can_refresh())
            .unwrap_or(false);
        AuthStatus {
            requires_auth,
            is_authenticated,
            has_client_info: state.client_info.is_some(),
        }
    }

    /// Clear all OAuth state for a server and discard the provider so the
    /// next connect starts from a clean slate.
    pub async fn revoke_tokens(&self, id: &str) {
        if let Some((_, provider)) = self.providers.remove(id) {
            provider.invalidate_credentials(CredentialScope::All).await;
        } else {
            self.store.remove_oauth_state(id).await;
        }
        self.metadata_cache.remove(id);
        info!(server_id = id, "OAuth state revoked");
    }

    async fn metadata(
        &self,
        id: &str,
        server_url: &str,
    ) -> Result<AuthServerMetadata, GatewayError> {
        if let Some(cached) = self.metadata_cache.get(id) {
            return Ok(cached.clone());
        }
        let discovery = OAuthDiscovery::new(self.http.clone());
        let metadata = discovery.discover_for_server(server_url).await?;
        self.metadata_cache.insert(id.to_string(), metadata.clone());
        Ok(metadata)
    }

    /// Attempt a refresh; `Ok(None)` means the grant is dead and the flow
    /// must restart from user consent.
    async fn try_refresh(
        &self,
        id: &str,
        server_url: &str,
        provider: &Arc<StoreBackedOAuthProvider>,
        tokens: &OAuthTokens,
    ) -> Result<Option<OAuthTokens>, GatewayError> {
        let Some(refresh_token) = tokens.refresh_token.clone() else {
            if tokens.is_expired() {
                provider.invalidate_credentials(CredentialScope::Tokens).await;
                return Ok(None);
            }
            // expiring soon but still alive and unrefreshable: use as-is
            return Ok(Some(tokens.clone()));
        };

        let metadata = self.metadata(id, server_url).await?;
        let Some(client) = provider.client_information().await else {
            provider.invalidate_credentials(CredentialScope::Tokens).await;
            return Ok(None);
        };

        match flow::refresh_tokens(&self.http, &metadata, &client, &refresh_token).await {
            Ok(mut new_tokens) => {
                // some servers rotate refresh tokens, some omit them
                if new_tokens.refresh_token.is_none() {
                    new_tokens.refresh_token = Some(refresh_token);
                }
                provider.save_tokens(new_tokens.clone()).await;
                debug!(server_id = id, "token refresh succeeded");
                Ok(Some(new_tokens))
            }
            Err(e) if flow::is_invalid_grant(&e) => {
                warn!(server_id = id, "refresh token rejected; restarting consent flow");
                provider.invalidate_credentials(CredentialScope::Tokens).await;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
