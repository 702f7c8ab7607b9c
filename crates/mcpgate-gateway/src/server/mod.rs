//! Gateway HTTP server: the downstream MCP endpoint (Streamable HTTP at
//! `/mcp`) plus the REST control surface, one axum router.

mod handlers;

pub use handlers::AppState;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::{delete, get, patch, post};
use axum::Router;
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use mcpgate_core::{EventBus, RequestLog};

use crate::gateway::Gateway;
use crate::proxy::{ProxyHandler, ProxyNotifier};

/// Bind and base-URL configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
    /// Externally reachable base URL; feeds OAuth redirect URLs.
    pub base_url: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3100,
            enable_cors: true,
            base_url: "http://localhost:3100".to_string(),
        }
    }
}

impl HttpConfig {
    pub fn addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

/// The assembled HTTP server.
pub struct GatewayServer {
    config: HttpConfig,
    gateway: Arc<Gateway>,
    notifier: Arc<ProxyNotifier>,
    request_log: Arc<RequestLog>,
    events: EventBus,
}

impl GatewayServer {
    pub fn new(
        config: HttpConfig,
        gateway: Arc<Gateway>,
        request_log: Arc<RequestLog>,
        events: EventBus,
    ) -> Self {
        let notifier = ProxyNotifier::new(gateway.clone());
        Self {
            config,
            gateway,
            notifier,
            request_log,
            events,
        }
    }

    pub fn gateway(&self) -> Arc<Gateway> {
        self.gateway.clone()
    }

    /// Build the router: REST surface + `/mcp` MCP service.
    pub fn build_router(&self) -> Router {
        let state = AppState {
            gateway: self.gateway.clone(),
            notifier: self.notifier.clone(),
            request_log: self.request_log.clone(),
            events: self.events.clone(),
            started_at: Instant::now(),
        };

        // downstream notifier consumes the event bus from here on
        self.notifier.clone().start(self.events.subscribe());

        let proxy_handler = ProxyHandler::new(
            self.gateway.clone(),
            self.notifier.clone(),
            self.request_log.clone(),
        );

        // Stateful Streamable HTTP: Mcp-Session-Id headers, GET opens the
        // server->client stream, DELETE terminates the session.
        let mcp_service = StreamableHttpService::new(
            move || {
                debug!("creating handler for downstream MCP session");
                Ok(proxy_handler.clone())
            },
            LocalSessionManager::default().into(),
            StreamableHttpServerConfig {
                stateful_mode: true,
                sse_keep_alive: Some(std::time::Duration::from_secs(30)),
                sse_retry: Some(std::time::Duration::from_secs(3)),
                cancellation_token: CancellationToken::new(),
            },
        );

        let mut router = Router::new()
            .route("/health", get(handlers::health))
            // server registry
            .route("/servers", get(handlers::list_servers))
            .route("/servers", post(handlers::create_server))
            .route("/servers/{id}", get(handlers::get_server))
            .route("/servers/{id}", patch(handlers::update_server))
            .route("/servers/{id}", delete(handlers::delete_server))
            // lifecycle verbs
            .route("/servers/{id}/connect", post(handlers::connect_server))
            .route("/servers/{id}/disconnect", post(handlers::disconnect_server))
            .route("/servers/{id}/reconnect", post(handlers::reconnect_server))
            .route("/servers/{id}/refresh", post(handlers::refresh_server))
            .route("/servers/{id}/enable", post(handlers::enable_server))
            .route("/servers/{id}/disable", post(handlers::disable_server))
            // auth
            .route("/servers/{id}/auth/status", get(handlers::auth_status))
            .route("/servers/{id}/auth/initiate", post(handlers::auth_initiate))
            .route("/servers/{id}/auth/revoke", post(handlers::auth_revoke))
            .route("/oauth/callback/{server_id}", get(handlers::oauth_callback))
            // aggregated capabilities
            .route("/tools", get(handlers::list_tools))
            .route("/tools/call", post(handlers::call_tool))
            .route("/resources", get(handlers::list_resources))
            .route("/prompts", get(handlers::list_prompts))
            // events + request log
            .route("/events", get(handlers::events))
            .route("/logs", get(handlers::list_logs))
            .route("/logs", delete(handlers::clear_logs))
            .route("/logs/stats", get(handlers::log_stats))
            .route("/logs/{id}", get(handlers::get_log))
            // downstream MCP endpoint
            .nest_service("/mcp", mcp_service)
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            router = router.layer(cors);
        }

        router
    }

    /// Bind, initialize the gateway (enabled servers start connecting in
    /// the background), and serve until `shutdown` resolves.
    pub async fn run(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let addr = self.config.addr()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;

        self.gateway.initialize().await;

        info!(%addr, base_url = %self.config.base_url, "gateway listening");
        let router = self.build_router();
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}
