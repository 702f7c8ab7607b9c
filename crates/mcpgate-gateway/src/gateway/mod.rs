//! Gateway - registry of all upstream sessions.
//!
//! Serializes configuration mutations behind one lock so an update, a
//! removal, and a background reconnect can never interleave on the same
//! server id; observers always see a consistent (config, session,
//! provider) triple. Queries return snapshots, never aliases into live
//! session state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rmcp::model::{CallToolResult, GetPromptResult, ReadResourceResult};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use mcpgate_core::domain::{
    AggregatedPrompt, AggregatedResource, AggregatedTool, Annotated, ServerConfig, ServerPatch,
    ServerStatusSnapshot, TransportConfig,
};
use mcpgate_core::event_bus::EventSender;
use mcpgate_core::{routing, GatewayError, GatewayEvent};
use mcpgate_store::{FileStore, StoreError};

use crate::oauth::{AuthOutcome, AuthStatus, OAuthManager, OAuthSettings};
use crate::session::{SessionOptions, UpstreamSession};

/// Grace limit for one session's teardown during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Body of `POST /servers`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewServerRequest {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub transport: TransportConfig,
}

fn default_enabled() -> bool {
    true
}

/// The upstream-session registry and the single entry point for
/// configuration mutations.
pub struct Gateway {
    store: FileStore,
    oauth: Arc<OAuthManager>,
    events: EventSender,
    sessions: RwLock<HashMap<String, Arc<UpstreamSession>>>,
    /// Coarse mutation lock; every config-changing operation runs under it.
    mutation: Mutex<()>,
    options: SessionOptions,
    shutdown_requested: AtomicBool,
}

impl Gateway {
    pub fn new(
        store: FileStore,
        events: EventSender,
        oauth: Arc<OAuthManager>,
        options: SessionOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            oauth,
            events,
            sessions: RwLock::new(HashMap::new()),
            mutation: Mutex::new(()),
            options,
            shutdown_requested: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Load all configs and build their sessions (all `disconnected`),
    /// then start connecting every enabled one in parallel. Returns once
    /// those connects have *started*; progress is observable via events
    /// and status queries.
    pub async fn initialize(&self) {
        let _guard = self.mutation.lock().await;
        let configs = self.store.list_servers().await;
        info!(servers = configs.len(), "initializing gateway");

        let mut sessions = self.sessions.write().await;
        for config in configs {
            let session = self.build_session(config.clone());
            sessions.insert(config.id.clone(), session.clone());
            if config.enabled {
                tokio::spawn(async move {
                    let _ = session.connect().await;
                });
            }
        }
    }

    /// Cancel timers, disconnect everything in parallel, clear the table.
    pub async fn shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        let _guard = self.mutation.lock().await;

        let sessions: Vec<Arc<UpstreamSession>> =
            self.sessions.write().await.drain().map(|(_, s)| s).collect();
        info!(sessions = sessions.len(), "shutting down gateway");

        let teardowns = sessions.into_iter().map(|session| async move {
            if tokio::time::timeout(SHUTDOWN_GRACE, session.shutdown())
                .await
                .is_err()
            {
                warn!(server_id = %session.id(), "session teardown exceeded grace limit");
            }
        });
        futures::future::join_all(teardowns).await;
    }

    // ------------------------------------------------------------------
    // Configuration mutations
    // ------------------------------------------------------------------

    /// Persist a new server, build its session, and auto-connect when
    /// enabled.
    pub async fn register_server(
        &self,
        request: NewServerRequest,
    ) -> Result<ServerConfig, GatewayError> {
        let _guard = self.mutation.lock().await;

        let config = ServerConfig::new(request.name, request.enabled, request.transport);
        let stored = self.store.add_server(config).await.map_err(map_store_err)?;

        let session = self.build_session(stored.clone());
        self.sessions
            .write()
            .await
            .insert(stored.id.clone(), session.clone());

        self.events.emit(GatewayEvent::ServerAdded {
            server_id: stored.id.clone(),
            name: stored.name.clone(),
        });

        if stored.enabled {
            tokio::spawn(async move {
                let _ = session.connect().await;
            });
        }
        Ok(stored)
    }

    /// Persist a patch, keep the OAuth provider in step with the effective
    /// auth mode, and reconnect only when connection settings actually
    /// changed. `enabled` transitions connect/disconnect as appropriate.
    pub async fn update_server(
        &self,
        id: &str,
        patch: ServerPatch,
    ) -> Result<ServerConfig, GatewayError> {
        let _guard = self.mutation.lock().await;

        let old = self
            .store
            .get_server(id)
            .await
            .ok_or_else(|| GatewayError::ConfigNotFound(id.to_string()))?;
        let updated = self
            .store
            .update_server(id, patch)
            .await
            .map_err(map_store_err)?;

        let session = self.session(id).await?;
        session.set_config(updated.clone());

        match OAuthSettings::from_auth(updated.auth()) {
            Some(settings) => {
                self.oauth.replace_provider(id, settings);
            }
            None => self.oauth.remove_provider(id),
        }

        let connection_changed = old.transport != updated.transport;
        let was_enabled = old.enabled;

        self.events.emit(GatewayEvent::ServerUpdated {
            server_id: updated.id.clone(),
            name: updated.name.clone(),
        });

        if updated.enabled {
            if !was_enabled || connection_changed {
                let session = session.clone();
                tokio::spawn(async move {
                    let _ = session.reconnect().await;
                });
            }
        } else if was_enabled {
            session.disconnect().await;
        }

        Ok(updated)
    }

    /// Disconnect, drop the session and provider, remove from the store.
    pub async fn remove_server(&self, id: &str) -> Result<(), GatewayError> {
        let _guard = self.mutation.lock().await;

        let session = self.sessions.write().await.remove(id);
        let Some(session) = session else {
            return Err(GatewayError::ConfigNotFound(id.to_string()));
        };
        session.shutdown().await;

        self.oauth.remove_provider(id);
        self.store.remove_server(id).await.map_err(map_store_err)?;

        self.events.emit(GatewayEvent::ServerRemoved {
            server_id: id.to_string(),
        });
        Ok(())
    }

    pub async fn connect_server(&self, id: &str) -> Result<(), GatewayError> {
        let _guard = self.mutation.lock().await;
        self.session(id).await?.connect().await
    }

    pub async fn disconnect_server(&self, id: &str) -> Result<(), GatewayError> {
        let _guard = self.mutation.lock().await;
        self.session(id).await?.disconnect().await;
        Ok(())
    }

    pub async fn reconnect_server(&self, id: &str) -> Result<(), GatewayError> {
        let _guard = self.mutation.lock().await;
        self.session(id).await?.reconnect().await
    }

    pub async fn refresh_server(&self, id: &str) -> Result<(), GatewayError> {
        self.session(id).await?.refresh_capabilities().await
    }

    /// Resume a session whose OAuth flow just completed.
    pub async fn on_oauth_complete(&self, id: &str) -> Result<(), GatewayError> {
        let _guard = self.mutation.lock().await;
        self.session(id).await?.on_oauth_complete().await
    }

    // ------------------------------------------------------------------
    // OAuth entry points (REST surface)
    // ------------------------------------------------------------------

    pub async fn initiate_auth(&self, id: &str) -> Result<AuthOutcome, GatewayError> {
        let (url, settings) = self.oauth_context(id).await?;
        self.oauth.initiate_auth(id, &url, settings).await
    }

    /// Token-exchange half of the flow, then reconnect with fresh tokens.
    pub async fn handle_oauth_callback(&self, id: &str, code: &str) -> Result<(), GatewayError> {
        let (url, settings) = self.oauth_context(id).await?;
        self.oauth.handle_callback(id, &url, code, settings).await?;
        self.on_oauth_complete(id).await
    }

    pub async fn auth_status(&self, id: &str) -> Result<AuthStatus, GatewayError> {
        let config = self
            .store
            .get_server(id)
            .await
            .ok_or_else(|| GatewayError::ConfigNotFound(id.to_string()))?;
        Ok(self.oauth.auth_status(id, config.uses_oauth()).await)
    }

    /// Clear all OAuth state; a future connect starts from a clean slate.
    pub async fn revoke_auth(&self, id: &str) -> Result<(), GatewayError> {
        let _guard = self.mutation.lock().await;
        if self.store.get_server(id).await.is_none() {
            return Err(GatewayError::ConfigNotFound(id.to_string()));
        }
        self.oauth.revoke_tokens(id).await;
        Ok(())
    }

    async fn oauth_context(&self, id: &str) -> Result<(String, OAuthSettings), GatewayError> {
        let config = self
            .store
            .get_server(id)
            .await
            .ok_or_else(|| GatewayError::ConfigNotFound(id.to_string()))?;
        let Some(url) = config.transport.url() else {
            return Err(GatewayError::InvalidConfig(format!(
                "server {id} is not a remote server"
            )));
        };
        let settings = OAuthSettings::from_auth(config.auth()).unwrap_or_default();
        Ok((url.to_string(), settings))
    }

    // ------------------------------------------------------------------
    // Queries (snapshots)
    // ------------------------------------------------------------------

    pub async fn get_server_status(&self, id: &str) -> Option<ServerStatusSnapshot> {
        let sessions = self.sessions.read().await;
        sessions.get(id).map(|s| s.snapshot())
    }

    /// Statuses in registration order.
    pub async fn get_all_server_statuses(&self) -> Vec<ServerStatusSnapshot> {
        let configs = self.store.list_servers().await;
        let sessions = self.sessions.read().await;
        configs
            .iter()
            .filter_map(|c| sessions.get(&c.id).map(|s| s.snapshot()))
            .collect()
    }

    /// Aggregated tools, grouped per server in registration order,
    /// upstream-reported order preserved within a server.
    pub async fn get_all_tools(&self) -> Vec<AggregatedTool> {
        self.aggregate(|session| session.tools()).await
    }

    pub async fn get_all_resources(&self) -> Vec<AggregatedResource> {
        self.aggregate(|session| session.resources()).await
    }

    pub async fn get_all_prompts(&self) -> Vec<AggregatedPrompt> {
        self.aggregate(|session| session.prompts()).await
    }

    async fn aggregate<T>(
        &self,
        items: impl Fn(&Arc<UpstreamSession>) -> Vec<T>,
    ) -> Vec<Annotated<T>> {
        let configs = self.store.list_servers().await;
        let sessions = self.sessions.read().await;
        let mut out = Vec::new();
        for config in configs {
            if let Some(session) = sessions.get(&config.id) {
                for item in items(session) {
                    out.push(Annotated::new(config.id.clone(), config.name.clone(), item));
                }
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Routed delegation
    // ------------------------------------------------------------------

    pub async fn call_tool(
        &self,
        server_id: &str,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult, GatewayError> {
        self.session(server_id).await?.call_tool(name, arguments).await
    }

    /// Resolve a prefixed tool name and dispatch to its owner.
    pub async fn call_tool_by_name(
        &self,
        prefixed: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult, GatewayError> {
        let tools = self.get_all_tools().await;
        let target = routing::resolve_tool(&tools, prefixed)
            .ok_or_else(|| GatewayError::NoSuchTool(prefixed.to_string()))?;
        self.call_tool(&target.server_id, &target.item.name, arguments)
            .await
    }

    pub async fn read_resource(
        &self,
        server_id: &str,
        uri: &str,
    ) -> Result<ReadResourceResult, GatewayError> {
        self.session(server_id).await?.read_resource(uri).await
    }

    /// Find the server owning a resource URI (exact match over snapshots).
    pub async fn find_resource(&self, uri: &str) -> Option<AggregatedResource> {
        self.get_all_resources()
            .await
            .into_iter()
            .find(|r| r.item.uri == uri)
    }

    pub async fn get_prompt(
        &self,
        server_id: &str,
        name: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> Result<GetPromptResult, GatewayError> {
        self.session(server_id).await?.get_prompt(name, arguments).await
    }

    // ------------------------------------------------------------------

    fn build_session(&self, config: ServerConfig) -> Arc<UpstreamSession> {
        if let Some(settings) = OAuthSettings::from_auth(config.auth()) {
            self.oauth.get_provider(&config.id, settings);
        }
        UpstreamSession::new(
            config,
            self.events.clone(),
            self.oauth.clone(),
            self.options.clone(),
        )
    }

    async fn session(&self, id: &str) -> Result<Arc<UpstreamSession>, GatewayError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::ConfigNotFound(id.to_string()))
    }
}

fn map_store_err(e: StoreError) -> GatewayError {
    match e {
        StoreError::NotFound(id) => GatewayError::ConfigNotFound(id),
        StoreError::DuplicateName(name) => GatewayError::DuplicateName(name),
        StoreError::DuplicateId(id) => {
            GatewayError::InvalidConfig(format!("duplicate server id: {id}"))
        }
        StoreError::InvalidConfig(reason) => GatewayError::InvalidConfig(reason),
        StoreError::Immutable(field) => {
            GatewayError::InvalidConfig(format!("{field} is immutable"))
        }
        StoreError::Persist(detail) => GatewayError::StorePersist(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpgate_core::domain::AuthConfig;
    use mcpgate_core::{EventBus, SessionStatus};
    use tempfile::TempDir;

    async fn gateway() -> (TempDir, Arc<Gateway>, EventBus) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("g.json")).await.unwrap();
        let bus = EventBus::new();
        let oauth = Arc::new(OAuthManager::new(
            store.clone(),
            bus.sender(),
            "http://localhost:3100",
        ));
        let gateway = Gateway::new(store, bus.sender(), oauth, SessionOptions::default());
        (dir, gateway, bus)
    }

    fn stdio_request(name: &str) -> NewServerRequest {
        NewServerRequest {
            name: name.to_string(),
            // disabled so tests never spawn a real child process
            enabled: false,
            transport: TransportConfig::Stdio {
                command: "definitely-not-a-real-mcp-server".to_string(),
                args: vec![],
                env: HashMap::new(),
                cwd: None,
            },
        }
    }

    #[tokio::test]
    async fn register_creates_disconnected_session_and_emits() {
        let (_dir, gateway, bus) = gateway().await;
        let mut rx = bus.subscribe();

        let config = gateway.register_server(stdio_request("fs")).await.unwrap();
        let status = gateway.get_server_status(&config.id).await.unwrap();
        assert_eq!(status.status, SessionStatus::Disconnected);
        assert_eq!(status.tools, 0);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.type_name(), "server:added");
    }

    #[tokio::test]
    async fn duplicate_normalized_name_rejected_across_gateway() {
        let (_dir, gateway, _bus) = gateway().await;
        gateway.register_server(stdio_request("Foo Bar")).await.unwrap();
        let err = gateway
            .register_server(stdio_request("Foo-Bar"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::DuplicateName(_)));
    }

    #[tokio::test]
    async fn remove_drops_session_and_emits() {
        let (_dir, gateway, bus) = gateway().await;
        let config = gateway.register_server(stdio_request("fs")).await.unwrap();
        let mut rx = bus.subscribe();

        gateway.remove_server(&config.id).await.unwrap();
        assert!(gateway.get_server_status(&config.id).await.is_none());
        assert!(gateway.store().get_server(&config.id).await.is_none());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.type_name(), "server:removed");
    }

    #[tokio::test]
    async fn unknown_ids_are_config_not_found() {
        let (_dir, gateway, _bus) = gateway().await;
        assert!(matches!(
            gateway.connect_server("nope").await.unwrap_err(),
            GatewayError::ConfigNotFound(_)
        ));
        assert!(matches!(
            gateway.remove_server("nope").await.unwrap_err(),
            GatewayError::ConfigNotFound(_)
        ));
    }

    #[tokio::test]
    async fn call_tool_by_name_unresolvable_is_no_such_tool() {
        let (_dir, gateway, _bus) = gateway().await;
        let err = gateway
            .call_tool_by_name("ghost__tool", None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NoSuchTool(_)));
    }

    #[tokio::test]
    async fn update_enable_transition_and_auth_guard() {
        let (_dir, gateway, _bus) = gateway().await;
        let config = gateway.register_server(stdio_request("fs")).await.unwrap();

        // renaming only does not force a reconnect and keeps the session
        let updated = gateway
            .update_server(
                &config.id,
                ServerPatch {
                    name: Some("fs2".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "fs2");
        assert_eq!(
            gateway.get_server_status(&config.id).await.unwrap().name,
            "fs2"
        );

        // auth patches are rejected for stdio servers
        let err = gateway
            .update_server(
                &config.id,
                ServerPatch {
                    auth: Some(AuthConfig::Bearer {
                        token: "t".to_string(),
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn initialize_builds_sessions_from_store() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("g.json")).await.unwrap();
        let config = ServerConfig::new(
            "fs",
            false,
            TransportConfig::Stdio {
                command: "x".to_string(),
                args: vec![],
                env: HashMap::new(),
                cwd: None,
            },
        );
        store.add_server(config.clone()).await.unwrap();

        let bus = EventBus::new();
        let oauth = Arc::new(OAuthManager::new(
            store.clone(),
            bus.sender(),
            "http://localhost:3100",
        ));
        let gateway = Gateway::new(store, bus.sender(), oauth, SessionOptions::default());
        gateway.initialize().await;

        let statuses = gateway.get_all_server_statuses().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, SessionStatus::Disconnected);
    }
}
