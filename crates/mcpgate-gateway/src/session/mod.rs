//! Upstream session - one connection to one upstream MCP server.
//!
//! Owns the transport, the MCP handshake, capability discovery, request
//! forwarding, and the reconnect policy. State machine:
//!
//! ```text
//! disconnected -> connecting -> { connected | error | awaiting_oauth }
//! connected    -> disconnected on transport loss (reconnect scheduled)
//! awaiting_oauth -> disconnected -> connecting   (on_oauth_complete)
//! error        -> connecting via scheduled retry while enabled
//! ```
//!
//! Capability lists are non-empty only while `connected`. Sessions never
//! hold a reference back to the gateway; everything observable goes out
//! through the event bus.

pub mod handler;
pub mod transport;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use rmcp::model::{CallToolRequestParams, CallToolResult, GetPromptRequestParams, GetPromptResult, ReadResourceRequestParams, ReadResourceResult};
use rmcp::service::{Peer, RunningService, ServiceError};
use rmcp::RoleClient;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use mcpgate_core::domain::{PromptInfo, ResourceInfo, ServerConfig, ServerStatusSnapshot, SessionStatus, ToolInfo};
use mcpgate_core::event_bus::EventSender;
use mcpgate_core::{GatewayError, GatewayEvent};

use crate::oauth::{AuthOutcome, OAuthManager, OAuthSettings};
use handler::UpstreamClientHandler;
use transport::{create_transport, TransportConnectResult, TransportContext};

/// A running upstream MCP client.
pub type McpClient = RunningService<RoleClient, UpstreamClientHandler>;

/// Default per-request timeout. Some upstreams (long tool calls) are slow;
/// tune via [`SessionOptions`] rather than treating this as a constant.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Default timeout for the transport open + MCP handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(2);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
const RECONNECT_JITTER_MS: u64 = 1000;
/// Scheduled retries before the session parks in terminal `error`.
const RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// Tunables shared by all sessions of one gateway.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[derive(Default)]
struct Capabilities {
    tools: Vec<ToolInfo>,
    resources: Vec<ResourceInfo>,
    prompts: Vec<PromptInfo>,
}

/// One upstream session. Created by the gateway, addressed by server id.
pub struct UpstreamSession {
    self_weak: Weak<UpstreamSession>,
    config: parking_lot::RwLock<ServerConfig>,
    status: parking_lot::RwLock<SessionStatus>,
    last_error: parking_lot::RwLock<Option<String>>,
    caps: parking_lot::RwLock<Capabilities>,
    client: tokio::sync::RwLock<Option<McpClient>>,
    last_connected: parking_lot::RwLock<Option<DateTime<Utc>>>,
    reconnect_attempts: AtomicU32,
    reconnect_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    events: EventSender,
    oauth: Arc<OAuthManager>,
    options: SessionOptions,
}

impl UpstreamSession {
    pub fn new(
        config: ServerConfig,
        events: EventSender,
        oauth: Arc<OAuthManager>,
        options: SessionOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            config: parking_lot::RwLock::new(config),
            status: parking_lot::RwLock::new(SessionStatus::Disconnected),
            last_error: parking_lot::RwLock::new(None),
            caps: parking_lot::RwLock::new(Capabilities::default()),
            client: tokio::sync::RwLock::new(None),
            last_connected: parking_lot::RwLock::new(None),
            reconnect_attempts: AtomicU32::new(0),
            reconnect_task: parking_lot::Mutex::new(None),
            events,
            oauth,
            options,
        })
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn id(&self) -> String {
        self.config.read().id.clone()
    }

    pub fn name(&self) -> String {
        self.config.read().name.clone()
    }

    pub fn config(&self) -> ServerConfig {
        self.config.read().clone()
    }

    /// Swap the config in place (rename, enable toggle). Connection-
    /// relevant changes go through the gateway, which reconnects.
    pub fn set_config(&self, config: ServerConfig) {
        *self.config.write() = config;
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.read()
    }

    pub fn is_enabled(&self) -> bool {
        self.config.read().enabled
    }

    pub fn tools(&self) -> Vec<ToolInfo> {
        self.caps.read().tools.clone()
    }

    pub fn resources(&self) -> Vec<ResourceInfo> {
        self.caps.read().resources.clone()
    }

    pub fn prompts(&self) -> Vec<PromptInfo> {
        self.caps.read().prompts.clone()
    }

    pub fn snapshot(&self) -> ServerStatusSnapshot {
        let config = self.config.read();
        let caps = self.caps.read();
        ServerStatusSnapshot {
            id: config.id.clone(),
            name: config.name.clone(),
            enabled: config.enabled,
            transport: config.transport_kind(),
            status: *self.status.read(),
            error: self.last_error.read().clone(),
            tools: caps.tools.len(),
            resources: caps.resources.len(),
            prompts: caps.prompts.len(),
            last_connected: *self.last_connected.read(),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::SeqCst),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Connect. Idempotent: a second call while connecting or connected is
    /// a no-op. A suspended OAuth flow also returns `Ok` - the session sits
    /// in `awaiting_oauth` until the callback lands.
    pub async fn connect(&self) -> Result<(), GatewayError> {
        {
            let mut status = self.status.write();
            if matches!(
                *status,
                SessionStatus::Connecting | SessionStatus::Connected
            ) {
                debug!(server_id = %self.id(), "connect is a no-op in state {:?}", *status);
                return Ok(());
            }
            *status = SessionStatus::Connecting;
        }
        *self.last_error.write() = None;
        self.emit_status(None);

        let config = self.config();
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let transport = create_transport(
            &config.transport,
            TransportContext {
                server_id: config.id.clone(),
                oauth: self.oauth.clone(),
                connect_timeout: self.options.connect_timeout,
            },
        );
        let client_handler = UpstreamClientHandler::new(&config.id, Some(refresh_tx));

        match transport.connect(client_handler).await {
            TransportConnectResult::Connected(client) => {
                let discovered = discover_capabilities(&config.id, &client.peer().clone()).await;
                let (n_tools, n_resources, n_prompts) = (
                    discovered.tools.len(),
                    discovered.resources.len(),
                    discovered.prompts.len(),
                );

                *self.caps.write() = discovered;
                *self.client.write().await = Some(client);
                *self.last_connected.write() = Some(Utc::now());
                self.reconnect_attempts.store(0, Ordering::SeqCst);
                self.set_status(SessionStatus::Connected, None);
                self.spawn_refresh_listener(refresh_rx);

                info!(
                    server_id = %config.id,
                    tools = n_tools,
                    resources = n_resources,
                    prompts = n_prompts,
                    "upstream connected"
                );
                self.events.emit(GatewayEvent::ServerConnected {
                    server_id: config.id,
                    name: config.name,
                    tools: n_tools,
                    resources: n_resources,
                    prompts: n_prompts,
                });
                Ok(())
            }
            TransportConnectResult::AuthRequired { server_url } => {
                info!(server_id = %config.id, "connect suspended pending OAuth consent");
                self.set_status(SessionStatus::AwaitingOauth, None);

                let settings =
                    OAuthSettings::from_auth(config.transport.auth()).unwrap_or_default();
                match self
                    .oauth
                    .initiate_auth(&config.id, &server_url, settings)
                    .await
                {
                    // provider hook already published oauth:required
                    Ok(AuthOutcome::Redirect { .. }) => {}
                    // tokens turned out to be usable after all (e.g. a
                    // refresh raced in): retry off this call stack
                    Ok(AuthOutcome::Authorized) => {
                        self.set_status(SessionStatus::Disconnected, None);
                        self.spawn_connect();
                    }
                    Err(e) => {
                        warn!(server_id = %self.id(), error = %e, "OAuth initiation failed");
                        self.set_status(SessionStatus::Error, Some(e.to_string()));
                    }
                }
                Ok(())
            }
            TransportConnectResult::Failed(error) => {
                self.handle_connect_failure(error);
                Ok(())
            }
        }
    }

    /// Disconnect: cancel any pending reconnect, close the client and its
    /// transport, reset the capability lists.
    pub async fn disconnect(&self) {
        self.cancel_reconnect();
        let was_connected = self.status().is_connected();

        if let Some(client) = self.client.write().await.take() {
            if let Err(e) = client.cancel().await {
                debug!(server_id = %self.id(), error = %e, "client cancel returned error");
            }
        }
        *self.caps.write() = Capabilities::default();
        self.set_status(SessionStatus::Disconnected, None);

        if was_connected {
            let config = self.config();
            self.events.emit(GatewayEvent::ServerDisconnected {
                server_id: config.id,
                name: config.name,
            });
        }
    }

    /// Disconnect then connect, resetting the backoff counter.
    pub async fn reconnect(&self) -> Result<(), GatewayError> {
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.disconnect().await;
        self.connect().await
    }

    /// Resume after a completed OAuth callback: tear down any stale
    /// transport and connect with the fresh tokens. Valid from
    /// `awaiting_oauth`, `disconnected`, and `error`.
    pub async fn on_oauth_complete(&self) -> Result<(), GatewayError> {
        match self.status() {
            SessionStatus::AwaitingOauth | SessionStatus::Disconnected | SessionStatus::Error => {}
            SessionStatus::Connecting | SessionStatus::Connected => {
                debug!(server_id = %self.id(), "oauth completion ignored in active state");
                return Ok(());
            }
        }

        self.cancel_reconnect();
        if let Some(stale) = self.client.write().await.take() {
            let _ = stale.cancel().await;
        }
        *self.caps.write() = Capabilities::default();
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.set_status(SessionStatus::Disconnected, None);
        self.connect().await
    }

    /// Re-discover tools/resources/prompts. Requires `connected`.
    pub async fn refresh_capabilities(&self) -> Result<(), GatewayError> {
        let peer = self.peer().await?;
        let config = self.config();
        let discovered = discover_capabilities(&config.id, &peer).await;
        let (n_tools, n_resources, n_prompts) = (
            discovered.tools.len(),
            discovered.resources.len(),
            discovered.prompts.len(),
        );
        *self.caps.write() = discovered;

        // re-announce so downstream sessions re-list
        self.events.emit(GatewayEvent::ServerConnected {
            server_id: config.id,
            name: config.name,
            tools: n_tools,
            resources: n_resources,
            prompts: n_prompts,
        });
        Ok(())
    }

    /// Cancel timers and close; used during gateway shutdown.
    pub async fn shutdown(&self) {
        self.cancel_reconnect();
        self.disconnect().await;
    }

    // ------------------------------------------------------------------
    // Request forwarding
    // ------------------------------------------------------------------

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult, GatewayError> {
        let peer = self.peer().await?;
        let params = CallToolRequestParams {
            name: name.to_string().into(),
            arguments: arguments.and_then(|v| v.as_object().cloned()),
            task: None,
            meta: None,
        };
        self.forward(peer.call_tool(params)).await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, GatewayError> {
        let peer = self.peer().await?;
        let params = ReadResourceRequestParams {
            uri: uri.into(),
            meta: None,
        };
        self.forward(peer.read_resource(params)).await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> Result<GetPromptResult, GatewayError> {
        let peer = self.peer().await?;
        let params = GetPromptRequestParams {
            name: name.into(),
            arguments,
            meta: None,
        };
        self.forward(peer.get_prompt(params)).await
    }

    async fn forward<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, ServiceError>>,
    ) -> Result<T, GatewayError> {
        match tokio::time::timeout(self.options.request_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(self.map_service_error(e)),
            Err(_) => Err(GatewayError::Timeout(self.options.request_timeout)),
        }
    }

    async fn peer(&self) -> Result<Peer<RoleClient>, GatewayError> {
        if !self.status().is_connected() {
            return Err(GatewayError::NotConnected(self.id()));
        }
        self.client
            .read()
            .await
            .as_ref()
            .map(|c| c.peer().clone())
            .ok_or_else(|| GatewayError::NotConnected(self.id()))
    }

    fn map_service_error(&self, e: ServiceError) -> GatewayError {
        match e {
            ServiceError::McpError(data) => GatewayError::Upstream {
                code: data.code.0,
                message: data.message.to_string(),
            },
            ServiceError::TransportSend(_) | ServiceError::TransportClosed => {
                let detail = "transport closed while a request was in flight".to_string();
                self.spawn_transport_loss_handler();
                GatewayError::Transport(detail)
            }
            other => GatewayError::Transport(other.to_string()),
        }
    }

    // ------------------------------------------------------------------
    // Failure handling & reconnect policy
    // ------------------------------------------------------------------

    fn handle_connect_failure(&self, error: String) {
        let attempts = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;

        if attempts > RECONNECT_MAX_ATTEMPTS {
            let message = format!(
                "{error} (giving up after {RECONNECT_MAX_ATTEMPTS} reconnect attempts)"
            );
            warn!(server_id = %self.id(), "{message}");
            self.set_status(SessionStatus::Error, Some(message));
            return;
        }

        warn!(server_id = %self.id(), attempt = attempts, error = %error, "connect failed");
        self.set_status(SessionStatus::Error, Some(error));
        if self.is_enabled() {
            self.schedule_reconnect(attempts);
        }
    }

    /// Transport dropped under a connected session: back to `disconnected`,
    /// then retry with backoff while enabled. A 401 never lands here - the
    /// transport reports that as `AuthRequired` before the MCP layer runs.
    async fn handle_transport_loss(&self) {
        if !self.status().is_connected() {
            return;
        }
        if let Some(client) = self.client.write().await.take() {
            let _ = client.cancel().await;
        }
        *self.caps.write() = Capabilities::default();
        self.set_status(SessionStatus::Disconnected, None);

        let config = self.config();
        self.events.emit(GatewayEvent::ServerDisconnected {
            server_id: config.id,
            name: config.name,
        });

        if self.is_enabled() {
            let attempts = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempts <= RECONNECT_MAX_ATTEMPTS {
                self.schedule_reconnect(attempts);
            } else {
                self.set_status(
                    SessionStatus::Error,
                    Some(format!(
                        "transport lost; giving up after {RECONNECT_MAX_ATTEMPTS} reconnect attempts"
                    )),
                );
            }
        }
    }

    /// Retry delay: `min(30s, 2s * 2^(attempt-1))` plus up to 1 s jitter.
    fn backoff_delay(attempt: u32) -> Duration {
        let exp = RECONNECT_BASE_DELAY.saturating_mul(1u32 << (attempt - 1).min(16));
        let base = exp.min(RECONNECT_MAX_DELAY);
        let jitter = rand::thread_rng().gen_range(0..RECONNECT_JITTER_MS);
        base + Duration::from_millis(jitter)
    }

    fn schedule_reconnect(&self, attempt: u32) {
        let delay = Self::backoff_delay(attempt);
        debug!(server_id = %self.id(), attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");

        let weak = self.self_weak.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(session) = weak.upgrade() else {
                return;
            };
            if !session.is_enabled() {
                return;
            }
            match session.status() {
                SessionStatus::Error | SessionStatus::Disconnected => {
                    let _ = session.connect().await;
                }
                // a manual connect, oauth flow, or shutdown intervened
                _ => {}
            }
        });

        if let Some(previous) = self.reconnect_task.lock().replace(handle) {
            previous.abort();
        }
    }

    fn cancel_reconnect(&self) {
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
    }

    fn spawn_connect(&self) {
        let weak = self.self_weak.clone();
        tokio::spawn(async move {
            if let Some(session) = weak.upgrade() {
                let _ = session.connect().await;
            }
        });
    }

    fn spawn_transport_loss_handler(&self) {
        let weak = self.self_weak.clone();
        tokio::spawn(async move {
            if let Some(session) = weak.upgrade() {
                session.handle_transport_loss().await;
            }
        });
    }

    /// Consume upstream `list_changed` signals; each burst triggers one
    /// capability refresh. The task ends when the client (and with it the
    /// sender) is dropped.
    fn spawn_refresh_listener(&self, mut rx: mpsc::UnboundedReceiver<handler::CapabilityKind>) {
        let weak = self.self_weak.clone();
        tokio::spawn(async move {
            while let Some(_kind) = rx.recv().await {
                while rx.try_recv().is_ok() {}
                let Some(session) = weak.upgrade() else { break };
                if let Err(e) = session.refresh_capabilities().await {
                    debug!(error = %e, "capability refresh after list_changed failed");
                }
            }
        });
    }

    fn set_status(&self, status: SessionStatus, message: Option<String>) {
        let changed = {
            let mut current = self.status.write();
            let changed = *current != status;
            *current = status;
            changed
        };
        if message.is_some() {
            *self.last_error.write() = message.clone();
        } else if status != SessionStatus::Error {
            *self.last_error.write() = None;
        }
        // unchanged silent transitions (disconnect of an idle session)
        // are not worth an event
        if changed || message.is_some() {
            self.emit_status(message);
        }
    }

    fn emit_status(&self, message: Option<String>) {
        self.events.emit(GatewayEvent::ServerStatus {
            server_id: self.id(),
            status: self.status(),
            message,
        });
    }
}

/// Run the three discovery calls. Each may fail independently; a failure
/// yields an empty list for that capability, never a failed session.
async fn discover_capabilities(server_id: &str, peer: &Peer<RoleClient>) -> Capabilities {
    let tools = match peer.list_tools(Default::default()).await {
        Ok(result) => convert_items(result.tools),
        Err(e) => {
            warn!(server_id, error = %e, "tools/list failed; assuming none");
            Vec::new()
        }
    };
    let resources = match peer.list_resources(Default::default()).await {
        Ok(result) => convert_items(result.resources),
        Err(e) => {
            warn!(server_id, error = %e, "resources/list failed; assuming none");
            Vec::new()
        }
    };
    let prompts = match peer.list_prompts(Default::default()).await {
        Ok(result) => convert_items(result.prompts),
        Err(e) => {
            warn!(server_id, error = %e, "prompts/list failed; assuming none");
            Vec::new()
        }
    };
    Capabilities {
        tools,
        resources,
        prompts,
    }
}

/// SDK model types and our domain descriptors share the MCP wire shape;
/// convert through JSON rather than tracking SDK struct layout.
fn convert_items<S: serde::Serialize, T: serde::de::DeserializeOwned>(items: Vec<S>) -> Vec<T> {
    items
        .into_iter()
        .filter_map(|item| {
            serde_json::to_value(item)
                .ok()
                .and_then(|v| serde_json::from_value(v).ok())
        })
        .collect()
}
