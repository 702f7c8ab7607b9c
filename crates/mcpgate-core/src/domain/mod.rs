//! Domain model: server configuration, capabilities, OAuth state, events.

pub mod capability;
pub mod config;
pub mod event;
pub mod oauth;

pub use capability::{
    AggregatedPrompt, AggregatedResource, AggregatedTool, Annotated, PromptArgument, PromptInfo,
    ResourceInfo, ToolInfo,
};
pub use config::{
    build_auth_headers, migrate_legacy_oauth, AuthConfig, ServerConfig, ServerPatch,
    TransportConfig, TransportKind, DEFAULT_API_KEY_HEADER,
};
pub use event::{CapabilitySnapshot, GatewayEvent, ServerStatusSnapshot, SessionStatus};
pub use oauth::{OAuthClientInfo, OAuthPersistedState, OAuthTokens};
