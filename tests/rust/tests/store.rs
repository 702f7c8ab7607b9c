//! Store durability and invariant tests.

use std::collections::HashMap;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use mcpgate_core::domain::{AuthConfig, ServerConfig, ServerPatch, TransportConfig};
use mcpgate_store::{FileStore, StoreError};

fn stdio_config(name: &str) -> ServerConfig {
    ServerConfig::new(
        name,
        true,
        TransportConfig::Stdio {
            command: "echo-mcp".to_string(),
            args: vec!["-root".to_string(), "/tmp".to_string()],
            env: HashMap::new(),
            cwd: None,
        },
    )
}

fn remote_config(name: &str) -> ServerConfig {
    ServerConfig::new(
        name,
        true,
        TransportConfig::Sse {
            url: "https://mcp.example/v1".to_string(),
            headers: HashMap::new(),
            auth: AuthConfig::Bearer {
                token: "abc".to_string(),
            },
        },
    )
}

#[tokio::test]
async fn add_get_round_trip_is_deep_equal_except_updated_at() {
    let dir = TempDir::new().unwrap();
    let store = FileStore::open(dir.path().join("g.json")).await.unwrap();

    let config = stdio_config("fs");
    store.add_server(config.clone()).await.unwrap();
    let fetched = store.get_server(&config.id).await.unwrap();

    assert_eq!(fetched.id, config.id);
    assert_eq!(fetched.name, config.name);
    assert_eq!(fetched.enabled, config.enabled);
    assert_eq!(fetched.transport, config.transport);
    assert_eq!(fetched.created_at, config.created_at);
}

#[tokio::test]
async fn lookup_by_name_is_case_insensitive() {
    let dir = TempDir::new().unwrap();
    let store = FileStore::open(dir.path().join("g.json")).await.unwrap();
    store.add_server(stdio_config("GitHub")).await.unwrap();

    assert!(store.get_server_by_name("github").await.is_some());
    assert!(store.get_server_by_name("GITHUB").await.is_some());
    assert!(store.get_server_by_name("gitlab").await.is_none());
}

#[tokio::test]
async fn names_normalizing_to_same_prefix_collide() {
    let dir = TempDir::new().unwrap();
    let store = FileStore::open(dir.path().join("g.json")).await.unwrap();

    store.add_server(stdio_config("Foo Bar")).await.unwrap();
    let err = store.add_server(stdio_config("Foo-Bar")).await.unwrap_err();
    assert!(matches!(err, StoreError::DuplicateName(_)));

    // renames hit the same check
    let other = store.add_server(stdio_config("Other")).await.unwrap();
    let err = store
        .update_server(
            &other.id,
            ServerPatch {
                name: Some("foo_bar".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateName(_)));
}

#[tokio::test]
async fn canonical_file_is_whole_or_absent() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("g.json");

    let store = FileStore::open(&path).await.unwrap();
    store.add_server(remote_config("api")).await.unwrap();
    store.flush().await.unwrap();

    // valid document on disk, no temp sibling left behind
    let doc: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(doc["servers"].as_array().unwrap().len(), 1);
    assert!(!path.with_extension("json.tmp").exists());

    // a stray temp file from a simulated crash is ignored on reload
    std::fs::write(path.with_extension("json.tmp"), b"{ partial").unwrap();
    drop(store);
    let reloaded = FileStore::open(&path).await.unwrap();
    assert_eq!(reloaded.list_servers().await.len(), 1);
}

#[tokio::test]
async fn debounced_writes_coalesce_and_close_is_durable() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("g.json");

    {
        let store = FileStore::open(&path).await.unwrap();
        for i in 0..5 {
            store.add_server(stdio_config(&format!("srv{i}"))).await.unwrap();
        }
        // close must block until everything is on disk
        store.close().await.unwrap();
    }

    let store = FileStore::open(&path).await.unwrap();
    assert_eq!(store.list_servers().await.len(), 5);
}

#[tokio::test]
async fn oauth_state_dies_with_its_server() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("g.json");
    let store = FileStore::open(&path).await.unwrap();

    let config = remote_config("api");
    store.add_server(config.clone()).await.unwrap();
    store.set_code_verifier(&config.id, "v".to_string()).await;
    store.remove_server(&config.id).await.unwrap();
    store.flush().await.unwrap();

    let doc: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert!(doc["oauthState"].as_object().unwrap().is_empty());
    assert!(doc["servers"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn update_rejects_cross_transport_patch() {
    let dir = TempDir::new().unwrap();
    let store = FileStore::open(dir.path().join("g.json")).await.unwrap();
    let config = remote_config("api");
    store.add_server(config.clone()).await.unwrap();

    let err = store
        .update_server(
            &config.id,
            ServerPatch {
                command: Some("echo".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidConfig(_)));
}

#[tokio::test]
async fn auth_mode_can_switch_between_static_modes() {
    let dir = TempDir::new().unwrap();
    let store = FileStore::open(dir.path().join("g.json")).await.unwrap();
    let config = remote_config("api");
    store.add_server(config.clone()).await.unwrap();

    let updated = store
        .update_server(
            &config.id,
            ServerPatch {
                auth: Some(AuthConfig::ApiKey {
                    key: "k".to_string(),
                    header_name: Some("X-Key".to_string()),
                    header_value_prefix: None,
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let headers = mcpgate_core::build_auth_headers(updated.auth());
    assert_eq!(headers.get("X-Key").map(String::as_str), Some("k"));
    assert!(!headers.contains_key("Authorization"));
}
