//! # mcpgate core
//!
//! Domain model and infrastructure shared by the store, the gateway
//! runtime, and the daemon:
//!
//! - server configuration and the auth union ([`domain::config`])
//! - capability descriptors and aggregated snapshots ([`domain::capability`])
//! - persisted OAuth state ([`domain::oauth`])
//! - gateway events and the broadcast event bus ([`event_bus`])
//! - prefixed-name routing ([`routing`])
//! - the request ledger ([`request_log`])

pub mod domain;
pub mod error;
pub mod event_bus;
pub mod request_log;
pub mod routing;

pub use domain::{
    build_auth_headers, migrate_legacy_oauth, AggregatedPrompt, AggregatedResource,
    AggregatedTool, Annotated, AuthConfig, CapabilitySnapshot, GatewayEvent, OAuthClientInfo,
    OAuthPersistedState, OAuthTokens, PromptArgument, PromptInfo, ResourceInfo, ServerConfig,
    ServerPatch, ServerStatusSnapshot, SessionStatus, ToolInfo, TransportConfig, TransportKind,
};
pub use error::{GatewayError, OAuthErrorKind};
pub use event_bus::{EventBus, EventReceiver, EventSender};
pub use request_log::{
    LogFilter, LogStats, RequestKind, RequestLog, RequestLogEntry, RequestStart, RequestStatus,
};
