//! Client-side handler for upstream MCP connections.
//!
//! Forwards upstream-initiated `list_changed` notifications into the
//! owning session's refresh channel; the session re-discovers the affected
//! capability list and downstream clients are notified in turn.

use rmcp::model::{ClientCapabilities, ClientInfo, Implementation};
use rmcp::service::NotificationContext;
use rmcp::RoleClient;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Which capability list an upstream reported as changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    Tools,
    Resources,
    Prompts,
}

/// Handler attached to every upstream client connection.
#[derive(Clone)]
pub struct UpstreamClientHandler {
    info: ClientInfo,
    server_id: String,
    refresh_tx: Option<mpsc::UnboundedSender<CapabilityKind>>,
}

impl UpstreamClientHandler {
    pub fn new(server_id: &str, refresh_tx: Option<mpsc::UnboundedSender<CapabilityKind>>) -> Self {
        Self {
            info: ClientInfo {
                protocol_version: Default::default(),
                capabilities: ClientCapabilities::default(),
                client_info: Implementation {
                    name: format!("mcpgate-{server_id}"),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    title: Some("mcpgate gateway".to_string()),
                    ..Default::default()
                },
                meta: None,
            },
            server_id: server_id.to_string(),
            refresh_tx,
        }
    }

    fn forward(&self, kind: CapabilityKind) {
        info!(
            server_id = %self.server_id,
            kind = ?kind,
            "upstream reported list_changed"
        );
        if let Some(tx) = &self.refresh_tx {
            if tx.send(kind).is_err() {
                debug!(server_id = %self.server_id, "session refresh channel closed");
            }
        }
    }
}

impl rmcp::ClientHandler for UpstreamClientHandler {
    fn get_info(&self) -> ClientInfo {
        self.info.clone()
    }

    fn on_tool_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward(CapabilityKind::Tools);
        std::future::ready(())
    }

    fn on_resource_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward(CapabilityKind::Resources);
        std::future::ready(())
    }

    fn on_prompt_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        self.forward(CapabilityKind::Prompts);
        std::future::ready(())
    }
}
