//! Server configuration model.
//!
//! `ServerConfig` is the persistent description of one upstream MCP server.
//! Runtime connection state lives in the gateway, never here.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Persistent configuration for one upstream MCP server.
///
/// `id` and the transport kind are immutable after creation; `name` is
/// unique case-insensitively across the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Opaque stable identifier.
    pub id: String,

    /// Human-readable display name (unique, case-insensitive).
    pub name: String,

    /// Whether the gateway should keep this server connected.
    pub enabled: bool,

    /// Transport-specific settings.
    pub transport: TransportConfig,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServerConfig {
    /// Create a new config with a fresh id and timestamps.
    pub fn new(name: impl Into<String>, enabled: bool, transport: TransportConfig) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            enabled,
            transport,
            created_at: now,
            updated_at: now,
        }
    }

    /// Kind tag for status reporting (`stdio`, `sse`, `streamable_http`).
    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Effective auth configuration (`AuthConfig::None` for stdio).
    pub fn auth(&self) -> &AuthConfig {
        self.transport.auth()
    }

    /// Whether this server authenticates via OAuth.
    pub fn uses_oauth(&self) -> bool {
        matches!(self.auth(), AuthConfig::Oauth { .. })
    }

    /// Validate the parts of a config the store cannot express through types.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("server name must not be empty".to_string());
        }
        if crate::routing::normalize_prefix(&self.name).is_empty() {
            return Err(format!(
                "server name {:?} normalizes to an empty prefix",
                self.name
            ));
        }
        match &self.transport {
            TransportConfig::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err("stdio transport requires a command".to_string());
                }
            }
            TransportConfig::Sse { url, .. } | TransportConfig::StreamableHttp { url, .. } => {
                if url::Url::parse(url).is_err() {
                    return Err(format!("invalid server URL: {url}"));
                }
            }
        }
        Ok(())
    }
}

/// Transport kind discriminant, used in status views and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::StreamableHttp => "streamable_http",
        }
    }
}

/// Transport-specific configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Child process speaking MCP over stdin/stdout.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        /// Working directory; `~` is expanded at spawn time, not here.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    /// Remote server over the legacy SSE transport (POST to send, GET to receive).
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        auth: AuthConfig,
    },
    /// Remote server over a single bidirectional Streamable-HTTP stream.
    StreamableHttp {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        auth: AuthConfig,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Stdio { .. } => TransportKind::Stdio,
            Self::Sse { .. } => TransportKind::Sse,
            Self::StreamableHttp { .. } => TransportKind::StreamableHttp,
        }
    }

    /// Remote URL, if any.
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Sse { url, .. } | Self::StreamableHttp { url, .. } => Some(url),
            Self::Stdio { .. } => None,
        }
    }

    /// Effective auth configuration; stdio transports have none.
    pub fn auth(&self) -> &AuthConfig {
        const NONE: &AuthConfig = &AuthConfig::None;
        match self {
            Self::Sse { auth, .. } | Self::StreamableHttp { auth, .. } => auth,
            Self::Stdio { .. } => NONE,
        }
    }
}

/// Authentication for remote transports.
///
/// Non-OAuth variants compose a static header set once per connection via
/// [`build_auth_headers`]. OAuth injects nothing statically; the transport
/// asks the server's OAuth provider for tokens on demand.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AuthConfig {
    #[default]
    None,
    Oauth {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_secret: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scopes: Option<Vec<String>>,
    },
    Bearer {
        token: String,
    },
    ApiKey {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        header_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        header_value_prefix: Option<String>,
    },
    Custom {
        headers: HashMap<String, String>,
    },
}

/// Default header carrying an API key.
pub const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";

/// Compose the static headers a non-OAuth auth mode contributes.
///
/// OAuth returns an empty set: tokens are attached by the transport through
/// the per-server OAuth provider, never as a frozen header.
pub fn build_auth_headers(auth: &AuthConfig) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    match auth {
        AuthConfig::None | AuthConfig::Oauth { .. } => {}
        AuthConfig::Bearer { token } => {
            headers.insert("Authorization".to_string(), format!("Bearer {token}"));
        }
        AuthConfig::ApiKey {
            key,
            header_name,
            header_value_prefix,
        } => {
            let name = header_name
                .as_deref()
                .unwrap_or(DEFAULT_API_KEY_HEADER)
                .to_string();
            let value = match header_value_prefix {
                Some(prefix) => format!("{prefix}{key}"),
                None => key.clone(),
            };
            headers.insert(name, value);
        }
        AuthConfig::Custom { headers: custom } => {
            headers.extend(custom.clone());
        }
    }
    headers
}

/// Partial update applied by `updateServer`. `id` and the transport kind
/// cannot be patched.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServerPatch {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    // stdio
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<HashMap<String, String>>,
    #[serde(default, with = "double_option")]
    pub cwd: Option<Option<String>>,
    // remote
    pub url: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub auth: Option<AuthConfig>,
}

/// Serde helper distinguishing "absent" from "explicitly null".
mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn deserialize<'de, D, T>(de: D) -> Result<Option<Option<T>>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Option::<T>::deserialize(de).map(Some)
    }

    pub fn serialize<S, T>(value: &Option<Option<T>>, ser: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        match value {
            Some(inner) => inner.serialize(ser),
            None => ser.serialize_none(),
        }
    }
}

impl ServerPatch {
    /// Whether applying this patch can change how the connection is made
    /// (command/args/env/cwd for stdio, url/headers/auth for remote).
    pub fn touches_connection(&self) -> bool {
        self.command.is_some()
            || self.args.is_some()
            || self.env.is_some()
            || self.cwd.is_some()
            || self.url.is_some()
            || self.headers.is_some()
            || self.auth.is_some()
    }
}

/// Migrate a raw persisted server object that encodes OAuth in a legacy
/// top-level `oauth` field into the tagged `auth` union.
///
/// Runs once per entry at store load; already-migrated objects pass through
/// untouched.
pub fn migrate_legacy_oauth(mut raw: Value) -> Value {
    let Some(obj) = raw.as_object_mut() else {
        return raw;
    };
    let Some(legacy) = obj.remove("oauth") else {
        return raw;
    };
    if let Some(transport) = obj.get_mut("transport").and_then(Value::as_object_mut) {
        let has_auth = transport
            .get("auth")
            .and_then(|a| a.get("mode"))
            .map(|m| m != "none")
            .unwrap_or(false);
        if !has_auth {
            let mut auth = serde_json::Map::new();
            auth.insert("mode".to_string(), Value::String("oauth".to_string()));
            for key in ["clientId", "clientSecret", "scopes"] {
                if let Some(v) = legacy.get(key) {
                    if !v.is_null() {
                        auth.insert(key.to_string(), v.clone());
                    }
                }
            }
            transport.insert("auth".to_string(), Value::Object(auth));
        }
    }
    raw
}
