//! Shared fixtures for the mcpgate integration tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use mcpgate_core::domain::{AuthConfig, TransportConfig};
use mcpgate_core::{EventBus, EventReceiver, GatewayEvent};
use mcpgate_gateway::{Gateway, NewServerRequest, OAuthManager, SessionOptions};
use mcpgate_store::FileStore;

/// A fully wired gateway over a temp-file store and a fresh event bus.
pub struct GatewayHarness {
    // owns the store file for the duration of the test
    _dir: TempDir,
    pub store: FileStore,
    pub bus: EventBus,
    pub oauth: Arc<OAuthManager>,
    pub gateway: Arc<Gateway>,
}

impl GatewayHarness {
    pub async fn new() -> Self {
        Self::with_base_url("http://localhost:3100").await
    }

    pub async fn with_base_url(base_url: &str) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let store = FileStore::open(dir.path().join("gateway.json"))
            .await
            .expect("store opens");
        let bus = EventBus::new();
        let oauth = Arc::new(OAuthManager::new(store.clone(), bus.sender(), base_url));
        let gateway = Gateway::new(
            store.clone(),
            bus.sender(),
            oauth.clone(),
            SessionOptions::default(),
        );
        Self {
            _dir: dir,
            store,
            bus,
            oauth,
            gateway,
        }
    }
}

/// A disabled stdio server config (tests never spawn real children).
pub fn stdio_request(name: &str) -> NewServerRequest {
    NewServerRequest {
        name: name.to_string(),
        enabled: false,
        transport: TransportConfig::Stdio {
            command: "mcpgate-test-echo".to_string(),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
        },
    }
}

/// A disabled remote config.
pub fn remote_request(name: &str, url: &str, auth: AuthConfig) -> NewServerRequest {
    NewServerRequest {
        name: name.to_string(),
        enabled: false,
        transport: TransportConfig::StreamableHttp {
            url: url.to_string(),
            headers: HashMap::new(),
            auth,
        },
    }
}

/// Drain every event that arrives within a short settling window.
pub async fn collect_events(rx: &mut EventReceiver) -> Vec<GatewayEvent> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
            Ok(Some(event)) => events.push(event),
            _ => break,
        }
    }
    events
}
