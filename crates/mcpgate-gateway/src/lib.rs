//! # mcpgate gateway runtime
//!
//! Everything that runs: upstream sessions and their transports, the
//! session registry, the OAuth client state machine, the downstream proxy
//! MCP server with its meta-tools, and the axum HTTP surface.
//!
//! ```text
//! downstream MCP client ──► /mcp (StreamableHttpService)
//!                              │ ProxyHandler
//!                              ▼
//!                           Gateway ──► UpstreamSession ──► transport
//!                              │             │                 │
//!                           FileStore     EventBus         OAuthManager
//! ```

pub mod gateway;
pub mod oauth;
pub mod proxy;
pub mod server;
pub mod session;

pub use gateway::{Gateway, NewServerRequest};
pub use oauth::{AuthOutcome, AuthStatus, OAuthManager, OAuthSettings};
pub use proxy::{ProxyHandler, ProxyNotifier};
pub use server::{AppState, GatewayServer, HttpConfig};
pub use session::{SessionOptions, UpstreamSession};
