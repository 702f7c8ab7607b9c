//! Gateway events.
//!
//! Every observable change flows through the event bus as one of these
//! variants. Consumers include the downstream notifier (list_changed
//! fan-out) and the REST `/events` SSE stream.

use serde::{Deserialize, Serialize};

use super::capability::{AggregatedPrompt, AggregatedResource, AggregatedTool};
use super::config::TransportKind;

/// Runtime status of an upstream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
    AwaitingOauth,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::AwaitingOauth => "awaiting_oauth",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Point-in-time view of one server's configuration and runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatusSnapshot {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub transport: TransportKind,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tools: usize,
    pub resources: usize,
    pub prompts: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<chrono::DateTime<chrono::Utc>>,
    pub reconnect_attempts: u32,
}

/// Tagged union carried by the event bus.
///
/// Serializes with a `type` field holding the colon-namespaced event name,
/// which is also what the `/events` SSE stream emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum GatewayEvent {
    #[serde(rename = "server:added")]
    ServerAdded { server_id: String, name: String },

    #[serde(rename = "server:updated")]
    ServerUpdated { server_id: String, name: String },

    #[serde(rename = "server:removed")]
    ServerRemoved { server_id: String },

    /// Status transition on an upstream session.
    #[serde(rename = "server:status")]
    ServerStatus {
        server_id: String,
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Session reached `connected`; capability lists are discovered.
    #[serde(rename = "server:connected")]
    ServerConnected {
        server_id: String,
        name: String,
        tools: usize,
        resources: usize,
        prompts: usize,
    },

    #[serde(rename = "server:disconnected")]
    ServerDisconnected { server_id: String, name: String },

    /// An OAuth authorization is suspended pending user consent.
    #[serde(rename = "oauth:required")]
    OauthRequired { server_id: String, auth_url: String },

    #[serde(rename = "log:started")]
    LogStarted { log_id: String },

    #[serde(rename = "log:completed")]
    LogCompleted { log_id: String, status: String },
}

impl GatewayEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ServerAdded { .. } => "server:added",
            Self::ServerUpdated { .. } => "server:updated",
            Self::ServerRemoved { .. } => "server:removed",
            Self::ServerStatus { .. } => "server:status",
            Self::ServerConnected { .. } => "server:connected",
            Self::ServerDisconnected { .. } => "server:disconnected",
            Self::OauthRequired { .. } => "oauth:required",
            Self::LogStarted { .. } => "log:started",
            Self::LogCompleted { .. } => "log:completed",
        }
    }

    pub fn server_id(&self) -> Option<&str> {
        match self {
            Self::ServerAdded { server_id, .. }
            | Self::ServerUpdated { server_id, .. }
            | Self::ServerRemoved { server_id }
            | Self::ServerStatus { server_id, .. }
            | Self::ServerConnected { server_id, .. }
            | Self::ServerDisconnected { server_id, .. }
            | Self::OauthRequired { server_id, .. } => Some(server_id),
            Self::LogStarted { .. } | Self::LogCompleted { .. } => None,
        }
    }

    /// Whether this event changes the aggregated capability set and so
    /// requires `list_changed` notifications downstream.
    pub fn affects_capabilities(&self) -> bool {
        matches!(
            self,
            Self::ServerConnected { .. }
                | Self::ServerDisconnected { .. }
                | Self::ServerRemoved { .. }
        )
    }
}

/// Aggregated capability snapshot, as returned by the gateway's queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilitySnapshot {
    pub tools: Vec<AggregatedTool>,
    pub resources: Vec<AggregatedResource>,
    pub prompts: Vec<AggregatedPrompt>,
}
