//! Downstream proxy MCP server: the handler served over Streamable HTTP,
//! the built-in meta-tools, and the `list_changed` notifier.

pub mod handler;
pub mod meta;
pub mod notifier;

pub use handler::ProxyHandler;
pub use notifier::{DownstreamSessionInfo, ProxyNotifier};
