//! Downstream notifier - fans `list_changed` out to every open
//! downstream session when the aggregated capability set changes.
//!
//! Content-hash dedup keeps flapping upstreams from spamming clients: a
//! notification kind is only sent when the aggregated list actually
//! differs from what was last announced, and at most once per second.
//! Delivery is best-effort; a peer whose send fails is dropped.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rmcp::service::Peer;
use rmcp::RoleServer;
use serde::Serialize;
use tracing::{debug, info, warn};

use mcpgate_core::event_bus::EventReceiver;
use mcpgate_core::routing::prefix_name;

use crate::gateway::Gateway;

/// Minimum spacing between notifications of one kind. Content hashing
/// handles redundancy; this only damps rapid oscillation.
const THROTTLE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum NotificationKind {
    Tools,
    Resources,
    Prompts,
}

/// One connected downstream MCP client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownstreamSessionInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

struct PeerEntry {
    peer: Arc<Peer<RoleServer>>,
    created_at: DateTime<Utc>,
}

/// Peer registry + event-bus consumer.
pub struct ProxyNotifier {
    gateway: Arc<Gateway>,
    peers: RwLock<HashMap<String, PeerEntry>>,
    state_hashes: RwLock<HashMap<NotificationKind, u64>>,
    last_sent: RwLock<HashMap<NotificationKind, Instant>>,
}

impl ProxyNotifier {
    pub fn new(gateway: Arc<Gateway>) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            peers: RwLock::new(HashMap::new()),
            state_hashes: RwLock::new(HashMap::new()),
            last_sent: RwLock::new(HashMap::new()),
        })
    }

    /// Track a downstream session's peer for notification delivery.
    /// Returns the generated downstream session id.
    pub fn register_peer(&self, peer: Arc<Peer<RoleServer>>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.peers.write().insert(
            id.clone(),
            PeerEntry {
                peer,
                created_at: Utc::now(),
            },
        );
        info!(downstream_session = %id, "downstream session registered");
        id
    }

    pub fn unregister_peer(&self, id: &str) {
        if self.peers.write().remove(id).is_some() {
            info!(downstream_session = %id, "downstream session removed");
        }
    }

    pub fn sessions(&self) -> Vec<DownstreamSessionInfo> {
        self.peers
            .read()
            .iter()
            .map(|(id, entry)| DownstreamSessionInfo {
                id: id.clone(),
                created_at: entry.created_at,
            })
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Consume gateway events; capability-affecting ones trigger a
    /// notification sweep. Runs until the event bus closes.
    pub fn start(self: Arc<Self>, mut events: EventReceiver) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if event.affects_capabilities() {
                    debug!(event = event.type_name(), "capability change; notifying downstream");
                    self.notify_all().await;
                }
            }
            debug!("notifier event loop ended");
        });
    }

    /// Send `tools/resources/prompts list_changed` to every open session,
    /// skipping kinds whose aggregated content is unchanged.
    pub async fn notify_all(&self) {
        let kinds = [
            (NotificationKind::Tools, self.tools_hash().await),
            (NotificationKind::Resources, self.resources_hash().await),
            (NotificationKind::Prompts, self.prompts_hash().await),
        ];

        for (kind, hash) in kinds {
            if !self.should_send(kind, hash) {
                continue;
            }
            self.broadcast(kind).await;
        }
    }

    /// Seed the content hashes so a freshly initialized proxy does not
    /// blast spurious notifications at its first client.
    pub async fn prime_hashes(&self) {
        let tools = self.tools_hash().await;
        let resources = self.resources_hash().await;
        let prompts = self.prompts_hash().await;
        let mut hashes = self.state_hashes.write();
        hashes.entry(NotificationKind::Tools).or_insert(tools);
        hashes.entry(NotificationKind::Resources).or_insert(resources);
        hashes.entry(NotificationKind::Prompts).or_insert(prompts);
    }

    fn should_send(&self, kind: NotificationKind, hash: u64) -> bool {
        {
            let hashes = self.state_hashes.read();
            if hashes.get(&kind) == Some(&hash) {
                debug!(?kind, "content unchanged; skipping notification");
                return false;
            }
        }
        {
            let last = self.last_sent.read();
            if let Some(at) = last.get(&kind) {
                if at.elapsed() < THROTTLE_WINDOW {
                    debug!(?kind, "throttled notification");
                    return false;
                }
            }
        }
        self.state_hashes.write().insert(kind, hash);
        self.last_sent.write().insert(kind, Instant::now());
        true
    }

    async fn broadcast(&self, kind: NotificationKind) {
        let targets: Vec<(String, Arc<Peer<RoleServer>>)> = self
            .peers
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.peer.clone()))
            .collect();

        debug!(?kind, sessions = targets.len(), "sending list_changed");
        for (id, peer) in targets {
            let result = match kind {
                NotificationKind::Tools => peer.notify_tool_list_changed().await,
                NotificationKind::Resources => peer.notify_resource_list_changed().await,
                NotificationKind::Prompts => peer.notify_prompt_list_changed().await,
            };
            if let Err(e) = result {
                // best-effort: log, drop the dead session, keep going
                warn!(downstream_session = %id, error = %e, "notification failed; dropping session");
                self.unregister_peer(&id);
            }
        }
    }

    async fn tools_hash(&self) -> u64 {
        let names: Vec<String> = self
            .gateway
            .get_all_tools()
            .await
            .iter()
            .map(|t| prefix_name(&t.server_name, &t.item.name))
            .collect();
        hash_sorted(names)
    }

    async fn resources_hash(&self) -> u64 {
        let uris: Vec<String> = self
            .gateway
            .get_all_resources()
            .await
            .iter()
            .map(|r| format!("{}\u{1}{}", r.server_id, r.item.uri))
            .collect();
        hash_sorted(uris)
    }

    async fn prompts_hash(&self) -> u64 {
        let names: Vec<String> = self
            .gateway
            .get_all_prompts()
            .await
            .iter()
            .map(|p| prefix_name(&p.server_name, &p.item.name))
            .collect();
        hash_sorted(names)
    }
}

fn hash_sorted(mut items: Vec<String>) -> u64 {
    items.sort();
    let mut hasher = DefaultHasher::new();
    for item in items {
        item.hash(&mut hasher);
    }
    hasher.finish()
}
