//! Durable store for server configs and OAuth state.
//!
//! One JSON document, `{servers, oauthState}`, owned exclusively by
//! [`FileStore`]. Writes are debounced (~200 ms) and always go through a
//! sibling temp file followed by an atomic rename, so the canonical file is
//! either a complete valid document or absent. Reads hand out deep copies.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use mcpgate_core::domain::{migrate_legacy_oauth, OAuthClientInfo, OAuthPersistedState, OAuthTokens, ServerConfig, ServerPatch, TransportConfig};
use mcpgate_core::routing::normalize_prefix;

/// Delay between a mutation and the coalesced write behind it.
const FLUSH_DEBOUNCE: Duration = Duration::from_millis(200);

/// Store-level failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("server not found: {0}")]
    NotFound(String),

    #[error("duplicate server id: {0}")]
    DuplicateId(String),

    #[error("duplicate server name: {0}")]
    DuplicateName(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("field is immutable: {0}")]
    Immutable(&'static str),

    #[error("persistence failed: {0}")]
    Persist(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The persisted document.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedState {
    #[serde(default)]
    servers: Vec<ServerConfig>,
    #[serde(default)]
    oauth_state: HashMap<String, OAuthPersistedState>,
}

struct StoreInner {
    path: PathBuf,
    state: RwLock<PersistedState>,
    pending_flush: Mutex<Option<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Handle to the store; clones share one document.
#[derive(Clone)]
pub struct FileStore {
    inner: Arc<StoreInner>,
}

impl FileStore {
    /// Open (or create) the store at `path`. A missing file is an empty
    /// store; a malformed file is quarantined with a loud warning rather
    /// than silently discarded.
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Persist(format!("creating {}: {e}", parent.display())))?;
        }

        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => match parse_document(&bytes) {
                Ok(state) => {
                    info!(
                        path = %path.display(),
                        servers = state.servers.len(),
                        "store loaded"
                    );
                    state
                }
                Err(e) => {
                    let quarantine = path.with_extension("json.corrupt");
                    error!(
                        path = %path.display(),
                        quarantine = %quarantine.display(),
                        error = %e,
                        "store file is malformed; starting empty and quarantining the old file"
                    );
                    if let Err(rename_err) = tokio::fs::rename(&path, &quarantine).await {
                        warn!(error = %rename_err, "failed to quarantine malformed store file");
                    }
                    PersistedState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PersistedState::default(),
            Err(e) => return Err(StoreError::Persist(format!("reading store: {e}"))),
        };

        Ok(Self {
            inner: Arc::new(StoreInner {
                path,
                state: RwLock::new(state),
                pending_flush: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    // ------------------------------------------------------------------
    // Server configs
    // ------------------------------------------------------------------

    pub async fn list_servers(&self) -> Vec<ServerConfig> {
        self.inner.state.read().await.servers.clone()
    }

    pub async fn get_server(&self, id: &str) -> Option<ServerConfig> {
        self.inner
            .state
            .read()
            .await
            .servers
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    pub async fn get_server_by_name(&self, name: &str) -> Option<ServerConfig> {
        let needle = name.to_lowercase();
        self.inner
            .state
            .read()
            .await
            .servers
            .iter()
            .find(|s| s.name.to_lowercase() == needle)
            .cloned()
    }

    /// Append a new config. Rejects duplicate ids, names that collide
    /// case-insensitively, and names whose normalized prefix is empty or
    /// already taken (reverse resolution must stay unambiguous).
    pub async fn add_server(&self, mut config: ServerConfig) -> StoreResult<ServerConfig> {
        config.validate().map_err(StoreError::InvalidConfig)?;

        let mut state = self.inner.state.write().await;
        if state.servers.iter().any(|s| s.id == config.id) {
            return Err(StoreError::DuplicateId(config.id));
        }
        check_name_free(&state.servers, &config.name, None)?;

        config.updated_at = chrono::Utc::now();
        state.servers.push(config.clone());
        drop(state);

        self.schedule_flush();
        Ok(config)
    }

    /// Apply a partial update. `id` and the transport kind are immutable;
    /// a patch that names fields of the other transport kind is invalid.
    pub async fn update_server(&self, id: &str, patch: ServerPatch) -> StoreResult<ServerConfig> {
        let mut state = self.inner.state.write().await;

        if !state.servers.iter().any(|s| s.id == id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        if let Some(name) = &patch.name {
            check_name_free(&state.servers, name, Some(id))?;
        }

        let servers = &mut state.servers;
        let Some(config) = servers.iter_mut().find(|s| s.id == id) else {
            return Err(StoreError::NotFound(id.to_string()));
        };

        apply_patch(config, patch)?;
        config.updated_at = chrono::Utc::now();
        let updated = config.clone();
        drop(state);

        self.schedule_flush();
        Ok(updated)
    }

    /// Remove a config and its OAuth state in one write.
    pub async fn remove_server(&self, id: &str) -> StoreResult<ServerConfig> {
        let mut state = self.inner.state.write().await;
        let Some(pos) = state.servers.iter().position(|s| s.id == id) else {
            return Err(StoreError::NotFound(id.to_string()));
        };
        let removed = state.servers.remove(pos);
        state.oauth_state.remove(id);
        drop(state);

        self.schedule_flush();
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // OAuth state
    // ------------------------------------------------------------------

    pub async fn get_oauth_state(&self, id: &str) -> OAuthPersistedState {
        self.inner
            .state
            .read()
            .await
            .oauth_state
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn get_tokens(&self, id: &str) -> Option<OAuthTokens> {
        self.inner
            .state
            .read()
            .await
            .oauth_state
            .get(id)
            .and_then(|s| s.tokens.clone())
    }

    pub async fn set_tokens(&self, id: &str, tokens: OAuthTokens) {
        let mut state = self.inner.state.write().await;
        state.oauth_state.entry(id.to_string()).or_default().tokens = Some(tokens);
        drop(state);
        self.schedule_flush();
    }

    pub async fn remove_tokens(&self, id: &str) {
        self.mutate_oauth(id, |s| s.tokens = None).await;
    }

    pub async fn get_client_info(&self, id: &str) -> Option<OAuthClientInfo> {
        self.inner
            .state
            .read()
            .await
            .oauth_state
            .get(id)
            .and_then(|s| s.client_info.clone())
    }

    pub async fn set_client_info(&self, id: &str, info: OAuthClientInfo) {
        let mut state = self.inner.state.write().await;
        state
            .oauth_state
            .entry(id.to_string())
            .or_default()
            .client_info = Some(info);
        drop(state);
        self.schedule_flush();
    }

    pub async fn get_code_verifier(&self, id: &str) -> Option<String> {
        self.inner
            .state
            .read()
            .await
            .oauth_state
            .get(id)
            .and_then(|s| s.code_verifier.clone())
    }

    pub async fn set_code_verifier(&self, id: &str, verifier: String) {
        let mut state = self.inner.state.write().await;
        state
            .oauth_state
            .entry(id.to_string())
            .or_default()
            .code_verifier = Some(verifier);
        drop(state);
        self.schedule_flush();
    }

    pub async fn clear_code_verifier(&self, id: &str) {
        self.mutate_oauth(id, |s| s.code_verifier = None).await;
    }

    pub async fn remove_oauth_state(&self, id: &str) {
        let mut state = self.inner.state.write().await;
        state.oauth_state.remove(id);
        drop(state);
        self.schedule_flush();
    }

    async fn mutate_oauth(&self, id: &str, f: impl FnOnce(&mut OAuthPersistedState)) {
        let mut state = self.inner.state.write().await;
        let now_empty = match state.oauth_state.get_mut(id) {
            Some(entry) => {
                f(entry);
                entry.is_empty()
            }
            None => return,
        };
        if now_empty {
            state.oauth_state.remove(id);
        }
        drop(state);
        self.schedule_flush();
    }

    // ------------------------------------------------------------------
    // Durability
    // ------------------------------------------------------------------

    /// Write the current document now, waiting for completion.
    pub async fn flush(&self) -> StoreResult<()> {
        if let Some(handle) = self.inner.pending_flush.lock().await.take() {
            handle.abort();
        }
        self.inner.write_to_disk().await
    }

    /// Flush and stop scheduling further writes.
    pub async fn close(&self) -> StoreResult<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.flush().await
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Coalesce writes behind a short timer; a crash between mutation and
    /// flush loses at most the debounce window.
    fn schedule_flush(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut pending = inner.pending_flush.lock().await;
            if inner.closed.load(Ordering::SeqCst) {
                return;
            }
            if let Some(handle) = &*pending {
                if !handle.is_finished() {
                    return;
                }
            }
            let task_inner = inner.clone();
            *pending = Some(tokio::spawn(async move {
                tokio::time::sleep(FLUSH_DEBOUNCE).await;
                if task_inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                if let Err(e) = task_inner.write_to_disk().await {
                    error!(error = %e, "debounced store flush failed");
                }
            }));
        });
    }
}

impl StoreInner {
    async fn write_to_disk(&self) -> StoreResult<()> {
        let bytes = {
            let state = self.state.read().await;
            serde_json::to_vec_pretty(&*state)
                .map_err(|e| StoreError::Persist(format!("serializing store: {e}")))?
        };

        let tmp = self.path.with_extension("json.tmp");
        write_private(&tmp, &bytes)
            .await
            .map_err(|e| StoreError::Persist(format!("writing {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::Persist(format!("renaming into place: {e}")))?;
        Ok(())
    }
}

/// Write `bytes` to `path` with owner-only permissions. The document holds
/// tokens and client secrets.
async fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let mut file = options.open(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

fn parse_document(bytes: &[u8]) -> Result<PersistedState, serde_json::Error> {
    let mut raw: serde_json::Value = serde_json::from_slice(bytes)?;
    if let Some(servers) = raw.get_mut("servers").and_then(|v| v.as_array_mut()) {
        for entry in servers.iter_mut() {
            *entry = migrate_legacy_oauth(entry.take());
        }
    }
    serde_json::from_value(raw)
}

/// Reject names that collide case-insensitively or whose normalized prefix
/// collides with another server's. `exclude` skips the server being renamed.
fn check_name_free(
    servers: &[ServerConfig],
    name: &str,
    exclude: Option<&str>,
) -> StoreResult<()> {
    let prefix = normalize_prefix(name);
    if prefix.is_empty() {
        return Err(StoreError::InvalidConfig(format!(
            "server name {name:?} normalizes to an empty prefix"
        )));
    }
    let lower = name.to_lowercase();
    for other in servers {
        if exclude == Some(other.id.as_str()) {
            continue;
        }
        if other.name.to_lowercase() == lower || normalize_prefix(&other.name) == prefix {
            return Err(StoreError::DuplicateName(name.to_string()));
        }
    }
    Ok(())
}

fn apply_patch(config: &mut ServerConfig, patch: ServerPatch) -> StoreResult<()> {
    if let Some(name) = patch.name {
        if name.trim().is_empty() {
            return Err(StoreError::InvalidConfig(
                "server name must not be empty".to_string(),
            ));
        }
        config.name = name;
    }
    if let Some(enabled) = patch.enabled {
        config.enabled = enabled;
    }

    match &mut config.transport {
        TransportConfig::Stdio {
            command, args, env, cwd,
        } => {
            if patch.url.is_some() || patch.headers.is_some() || patch.auth.is_some() {
                return Err(StoreError::InvalidConfig(
                    "url/headers/auth do not apply to a stdio server".to_string(),
                ));
            }
            if let Some(c) = patch.command {
                if c.trim().is_empty() {
                    return Err(StoreError::InvalidConfig(
                        "stdio command must not be empty".to_string(),
                    ));
                }
                *command = c;
            }
            if let Some(a) = patch.args {
                *args = a;
            }
            if let Some(e) = patch.env {
                *env = e;
            }
            if let Some(c) = patch.cwd {
                *cwd = c;
            }
        }
        TransportConfig::Sse { url, headers, auth }
        | TransportConfig::StreamableHttp { url, headers, auth } => {
            if patch.command.is_some()
                || patch.args.is_some()
                || patch.env.is_some()
                || patch.cwd.is_some()
            {
                return Err(StoreError::InvalidConfig(
                    "command/args/env/cwd do not apply to a remote server".to_string(),
                ));
            }
            if let Some(u) = patch.url {
                if url::Url::parse(&u).is_err() {
                    return Err(StoreError::InvalidConfig(format!("invalid server URL: {u}")));
                }
                *url = u;
            }
            if let Some(h) = patch.headers {
                *headers = h;
            }
            if let Some(a) = patch.auth {
                *auth = a;
            }
        }
    }
    Ok(())
}
