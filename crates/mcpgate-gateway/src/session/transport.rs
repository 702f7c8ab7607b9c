//! Transports for upstream MCP connections.
//!
//! Stdio spawns the configured command as a child process; SSE and
//! Streamable HTTP connect over a reqwest client that carries the static
//! auth headers. OAuth-protected servers never get a frozen Authorization
//! header: the transport asks the OAuth manager for fresh tokens per
//! connection, and a missing/rejected token surfaces as the explicit
//! [`TransportConnectResult::AuthRequired`] variant - no error-string
//! sniffing.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::transport::sse_client::SseClientConfig;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess};
use rmcp::ServiceExt;
use tokio::process::Command;
use tracing::{debug, error, info};

use mcpgate_core::domain::{build_auth_headers, TransportConfig, TransportKind};

use crate::oauth::{OAuthManager, OAuthSettings};
use crate::session::handler::UpstreamClientHandler;
use crate::session::McpClient;

/// Outcome of one connection attempt.
pub enum TransportConnectResult {
    Connected(McpClient),
    /// The server demands OAuth and no usable tokens exist. The session
    /// suspends into `awaiting_oauth`; this is not a failure.
    AuthRequired { server_url: String },
    Failed(String),
}

/// One connection strategy. Implementations own the protocol specifics;
/// the session only sees the three-way result.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, handler: UpstreamClientHandler) -> TransportConnectResult;

    fn kind(&self) -> TransportKind;

    fn description(&self) -> String;
}

/// Shared context a transport needs beyond its own config.
#[derive(Clone)]
pub struct TransportContext {
    pub server_id: String,
    pub oauth: Arc<OAuthManager>,
    pub connect_timeout: Duration,
}

/// Build the transport for a config.
pub fn create_transport(config: &TransportConfig, ctx: TransportContext) -> Box<dyn Transport> {
    match config {
        TransportConfig::Stdio {
            command,
            args,
            env,
            cwd,
        } => Box::new(StdioTransport {
            command: command.clone(),
            args: args.clone(),
            env: env.clone(),
            cwd: cwd.clone(),
            ctx,
        }),
        TransportConfig::Sse { url, headers, auth } => Box::new(RemoteTransport {
            kind: TransportKind::Sse,
            url: url.clone(),
            headers: headers.clone(),
            oauth_settings: OAuthSettings::from_auth(auth),
            static_headers: build_auth_headers(auth),
            ctx,
        }),
        TransportConfig::StreamableHttp { url, headers, auth } => Box::new(RemoteTransport {
            kind: TransportKind::StreamableHttp,
            url: url.clone(),
            headers: headers.clone(),
            oauth_settings: OAuthSettings::from_auth(auth),
            static_headers: build_auth_headers(auth),
            ctx,
        }),
    }
}

// ----------------------------------------------------------------------
// Stdio
// ----------------------------------------------------------------------

/// Child-process transport (newline-delimited JSON-RPC over stdio).
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<String>,
    ctx: TransportContext,
}

impl StdioTransport {
    /// Split a command that carries embedded arguments (configs copied from
    /// other MCP clients often do: `"npx -y @scope/server"`). Explicit
    /// `args` win; the command is then taken verbatim as the executable.
    fn parse_command(command: &str, args: &[String]) -> Result<(String, Vec<String>), String> {
        if !args.is_empty() || !command.contains(' ') {
            return Ok((command.to_string(), args.to_vec()));
        }
        let parts = shell_words::split(command)
            .map_err(|e| format!("cannot parse command {command:?}: {e}"))?;
        match parts.split_first() {
            Some((executable, rest)) => Ok((executable.clone(), rest.to_vec())),
            None => Err("empty command".to_string()),
        }
    }

    /// Expand a leading `~` in the configured working directory. Done at
    /// spawn time so the stored config stays portable.
    fn expand_cwd(cwd: &str) -> std::path::PathBuf {
        if let Some(rest) = cwd.strip_prefix("~") {
            if let Some(home) = dirs::home_dir() {
                let rest = rest.trim_start_matches(['/', '\\']);
                return if rest.is_empty() { home } else { home.join(rest) };
            }
        }
        std::path::PathBuf::from(cwd)
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&self, handler: UpstreamClientHandler) -> TransportConnectResult {
        let server_id = &self.ctx.server_id;
        info!(server_id = %server_id, command = %self.command, "connecting stdio upstream");

        let (executable, args) = match Self::parse_command(&self.command, &self.args) {
            Ok(parsed) => parsed,
            Err(e) => return TransportConnectResult::Failed(e),
        };

        // Resolve eagerly so "command not found" is a clear error, not a
        // cryptic spawn failure.
        let command_path = match which::which(&executable) {
            Ok(path) => path,
            Err(_) => {
                let err = format!(
                    "command not found: {executable}. Ensure it is installed and in PATH."
                );
                error!(server_id = %server_id, "{err}");
                return TransportConnectResult::Failed(err);
            }
        };
        debug!(server_id = %server_id, path = ?command_path, "resolved command");

        let env = self.env.clone();
        let cwd = self.cwd.as_deref().map(Self::expand_cwd);
        let transport = match TokioChildProcess::new(Command::new(&command_path).configure(
            move |cmd| {
                cmd.args(&args)
                    .envs(&env)
                    .stderr(Stdio::piped())
                    .kill_on_drop(true);
                if let Some(dir) = &cwd {
                    cmd.current_dir(dir);
                }
                // keep terminal signals from reaching the child
                #[cfg(unix)]
                {
                    cmd.process_group(0);
                }
            },
        )) {
            Ok(t) => t,
            Err(e) => {
                let err = format!("failed to spawn {executable}: {e}");
                error!(server_id = %server_id, "{err}");
                return TransportConnectResult::Failed(err);
            }
        };

        match tokio::time::timeout(self.ctx.connect_timeout, handler.serve(transport)).await {
            Ok(Ok(client)) => {
                info!(server_id = %server_id, "stdio upstream connected");
                TransportConnectResult::Connected(client)
            }
            Ok(Err(e)) => {
                TransportConnectResult::Failed(format!("MCP handshake failed: {e}"))
            }
            Err(_) => TransportConnectResult::Failed(format!(
                "connection timeout ({:?})",
                self.ctx.connect_timeout
            )),
        }
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn description(&self) -> String {
        format!("stdio:{}", self.command)
    }
}

// ----------------------------------------------------------------------
// Remote (SSE / Streamable HTTP)
// ----------------------------------------------------------------------

/// Remote transport over reqwest; covers both SSE and Streamable HTTP.
pub struct RemoteTransport {
    kind: TransportKind,
    url: String,
    /// User-configured static headers.
    headers: HashMap<String, String>,
    /// `Some` when the auth mode is OAuth.
    oauth_settings: Option<OAuthSettings>,
    /// Headers derived from the non-OAuth auth modes.
    static_headers: HashMap<String, String>,
    ctx: TransportContext,
}

impl RemoteTransport {
    /// Assemble the default-header set for this connection. For OAuth mode
    /// this consults the manager for fresh tokens and returns `None` when
    /// the flow must go back through user consent.
    async fn build_headers(&self) -> Result<Option<reqwest::header::HeaderMap>, String> {
        let mut combined: HashMap<String, String> = self.headers.clone();
        combined.extend(self.static_headers.clone());

        if let Some(settings) = &self.oauth_settings {
            match self
                .ctx
                .oauth
                .fresh_tokens(&self.ctx.server_id, &self.url, settings.clone())
                .await
            {
                Ok(Some(tokens)) => {
                    combined.insert("Authorization".to_string(), tokens.authorization_header());
                }
                Ok(None) => return Ok(None),
                Err(e) => return Err(e.to_string()),
            }
        }

        let mut map = reqwest::header::HeaderMap::new();
        for (name, value) in &combined {
            let name: reqwest::header::HeaderName = name
                .parse()
                .map_err(|_| format!("invalid header name: {name}"))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|_| format!("invalid value for header {name:?}"))?;
            map.insert(name, value);
        }
        Ok(Some(map))
    }

    /// Probe the endpoint and report whether it rejects the current
    /// credentials. Branches on the HTTP status code only.
    async fn is_unauthorized(&self, client: &reqwest::Client) -> Result<bool, String> {
        let response = client
            .get(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .send()
            .await
            .map_err(|e| format!("probe of {} failed: {e}", self.url))?;
        Ok(response.status() == reqwest::StatusCode::UNAUTHORIZED)
    }
}

#[async_trait]
impl Transport for RemoteTransport {
    async fn connect(&self, handler: UpstreamClientHandler) -> TransportConnectResult {
        let server_id = &self.ctx.server_id;
        info!(server_id = %server_id, url = %self.url, kind = self.kind.as_str(), "connecting remote upstream");

        if url::Url::parse(&self.url).is_err() {
            return TransportConnectResult::Failed(format!("invalid URL: {}", self.url));
        }

        let headers = match self.build_headers().await {
            Ok(Some(headers)) => headers,
            Ok(None) => {
                debug!(server_id = %server_id, "no usable OAuth tokens; authorization required");
                return TransportConnectResult::AuthRequired {
                    server_url: self.url.clone(),
                };
            }
            Err(e) => return TransportConnectResult::Failed(e),
        };

        let client = match reqwest::Client::builder().default_headers(headers).build() {
            Ok(c) => c,
            Err(e) => {
                return TransportConnectResult::Failed(format!("failed to build HTTP client: {e}"))
            }
        };

        // OAuth servers answer 401 when the token is missing or stale;
        // that suspends the session instead of counting as a failure.
        if self.oauth_settings.is_some() {
            match self.is_unauthorized(&client).await {
                Ok(true) => {
                    info!(server_id = %server_id, "upstream rejected credentials (401)");
                    return TransportConnectResult::AuthRequired {
                        server_url: self.url.clone(),
                    };
                }
                Ok(false) => {}
                Err(e) => return TransportConnectResult::Failed(e),
            }
        }

        let connect = async {
            match self.kind {
                TransportKind::Sse => {
                    let transport = SseClientTransport::start_with_client(
                        client,
                        SseClientConfig {
                            sse_endpoint: self.url.clone().into(),
                            ..Default::default()
                        },
                    )
                    .await
                    .map_err(|e| format!("SSE stream failed to open: {e}"))?;
                    handler
                        .serve(transport)
                        .await
                        .map_err(|e| format!("MCP handshake failed: {e}"))
                }
                _ => {
                    let transport = StreamableHttpClientTransport::with_client(
                        client,
                        StreamableHttpClientTransportConfig::with_uri(self.url.as_str()),
                    );
                    handler
                        .serve(transport)
                        .await
                        .map_err(|e| format!("MCP handshake failed: {e}"))
                }
            }
        };

        match tokio::time::timeout(self.ctx.connect_timeout, connect).await {
            Ok(Ok(client)) => {
                info!(server_id = %server_id, "remote upstream connected");
                TransportConnectResult::Connected(client)
            }
            Ok(Err(e)) => TransportConnectResult::Failed(e),
            Err(_) => TransportConnectResult::Failed(format!(
                "connection timeout ({:?})",
                self.ctx.connect_timeout
            )),
        }
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn description(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.url)
    }
}
