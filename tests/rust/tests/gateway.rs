//! Gateway registry lifecycle tests with mocked (disabled) sessions.

use pretty_assertions::assert_eq;

use mcpgate_core::domain::{AuthConfig, ServerPatch};
use mcpgate_core::{GatewayError, SessionStatus};
use tests::{collect_events, remote_request, stdio_request, GatewayHarness};

#[tokio::test]
async fn register_then_remove_emits_in_order() {
    let harness = GatewayHarness::new().await;
    let mut rx = harness.bus.subscribe();

    let config = harness
        .gateway
        .register_server(stdio_request("fs"))
        .await
        .unwrap();
    harness.gateway.remove_server(&config.id).await.unwrap();

    let names: Vec<&str> = collect_events(&mut rx)
        .await
        .iter()
        .map(|e| e.type_name())
        .collect::<Vec<_>>()
        .into_iter()
        .collect();
    assert_eq!(names, vec!["server:added", "server:removed"]);
}

#[tokio::test]
async fn raw_names_differing_only_in_symbols_collide() {
    let harness = GatewayHarness::new().await;
    harness
        .gateway
        .register_server(stdio_request("Foo Bar"))
        .await
        .unwrap();

    let err = harness
        .gateway
        .register_server(stdio_request("Foo-Bar"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::DuplicateName(_)));

    // registry is unchanged by the rejected registration
    assert_eq!(harness.gateway.get_all_server_statuses().await.len(), 1);
}

#[tokio::test]
async fn disconnected_sessions_advertise_nothing() {
    let harness = GatewayHarness::new().await;
    harness
        .gateway
        .register_server(stdio_request("fs"))
        .await
        .unwrap();
    harness
        .gateway
        .register_server(remote_request(
            "api",
            "https://mcp.example/v1",
            AuthConfig::None,
        ))
        .await
        .unwrap();

    assert!(harness.gateway.get_all_tools().await.is_empty());
    assert!(harness.gateway.get_all_resources().await.is_empty());
    assert!(harness.gateway.get_all_prompts().await.is_empty());

    for status in harness.gateway.get_all_server_statuses().await {
        assert_eq!(status.status, SessionStatus::Disconnected);
        assert_eq!(status.tools + status.resources + status.prompts, 0);
    }
}

#[tokio::test]
async fn statuses_preserve_registration_order() {
    let harness = GatewayHarness::new().await;
    for name in ["alpha", "beta", "gamma"] {
        harness
            .gateway
            .register_server(stdio_request(name))
            .await
            .unwrap();
    }
    let names: Vec<String> = harness
        .gateway
        .get_all_server_statuses()
        .await
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(names, vec!["alpha", "beta", "gamma"]);
}

#[tokio::test]
async fn operations_on_disconnected_sessions_fail_cleanly() {
    let harness = GatewayHarness::new().await;
    let config = harness
        .gateway
        .register_server(stdio_request("fs"))
        .await
        .unwrap();

    let err = harness
        .gateway
        .call_tool(&config.id, "anything", None)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::NotConnected(_)));

    let err = harness
        .gateway
        .call_tool_by_name("fs__anything", None)
        .await
        .unwrap_err();
    // the tool is not aggregated while disconnected, so resolution fails
    assert!(matches!(err, GatewayError::NoSuchTool(_)));
}

#[tokio::test]
async fn update_keeps_session_and_store_consistent() {
    let harness = GatewayHarness::new().await;
    let config = harness
        .gateway
        .register_server(remote_request(
            "api",
            "https://mcp.example/v1",
            AuthConfig::Bearer {
                token: "abc".to_string(),
            },
        ))
        .await
        .unwrap();
    let mut rx = harness.bus.subscribe();

    let updated = harness
        .gateway
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

    // store and session views agree
    let stored = harness.store.get_server(&config.id).await.unwrap();
    assert_eq!(stored.transport, updated.transport);
    let snapshot = harness.gateway.get_server_status(&config.id).await.unwrap();
    assert_eq!(snapshot.name, updated.name);

    let events = collect_events(&mut rx).await;
    assert!(events.iter().any(|e| e.type_name() == "server:updated"));
}

#[tokio::test]
async fn auth_status_tracks_oauth_configs() {
    let harness = GatewayHarness::new().await;
    let oauth_server = harness
        .gateway
        .register_server(remote_request(
            "secure",
            "https://mcp.example/v1",
            AuthConfig::Oauth {
                client_id: None,
                client_secret: None,
                scopes: None,
            },
        ))
        .await
        .unwrap();
    let plain_server = harness
        .gateway
        .register_server(stdio_request("fs"))
        .await
        .unwrap();

    let status = harness.gateway.auth_status(&oauth_server.id).await.unwrap();
    assert!(status.requires_auth);
    assert!(!status.is_authenticated);

    let status = harness.gateway.auth_status(&plain_server.id).await.unwrap();
    assert!(!status.requires_auth);

    assert!(matches!(
        harness.gateway.auth_status("missing").await.unwrap_err(),
        GatewayError::ConfigNotFound(_)
    ));
}

#[tokio::test]
async fn revoke_auth_wipes_oauth_state() {
    let harness = GatewayHarness::new().await;
    let config = harness
        .gateway
        .register_server(remote_request(
            "secure",
            "https://mcp.example/v1",
            AuthConfig::Oauth {
                client_id: Some("cid".to_string()),
                client_secret: None,
                scopes: None,
            },
        ))
        .await
        .unwrap();

    harness
        .store
        .set_code_verifier(&config.id, "v".to_string())
        .await;
    harness.gateway.revoke_auth(&config.id).await.unwrap();
    assert!(harness.store.get_oauth_state(&config.id).await.is_empty());
}

#[tokio::test]
async fn repeated_connect_failures_park_in_terminal_error() {
    let harness = GatewayHarness::new().await;
    // command that cannot resolve, so every connect fails immediately;
    // the server stays disabled so no retry timers run during the test
    let config = harness
        .gateway
        .register_server(stdio_request("broken"))
        .await
        .unwrap();

    for _ in 0..5 {
        harness.gateway.connect_server(&config.id).await.unwrap();
        let status = harness.gateway.get_server_status(&config.id).await.unwrap();
        assert_eq!(status.status, SessionStatus::Error);
        assert!(status.error.as_deref().unwrap().contains("command not found"));
    }

    // the sixth consecutive failure exhausts the retry budget
    harness.gateway.connect_server(&config.id).await.unwrap();
    let status = harness.gateway.get_server_status(&config.id).await.unwrap();
    assert_eq!(status.status, SessionStatus::Error);
    assert!(status.error.as_deref().unwrap().contains("giving up"));
    assert_eq!(status.reconnect_attempts, 6);

    // a manual reconnect resets the counter and tries again
    harness.gateway.reconnect_server(&config.id).await.unwrap();
    let status = harness.gateway.get_server_status(&config.id).await.unwrap();
    assert_eq!(status.reconnect_attempts, 1);
}

#[tokio::test]
async fn shutdown_clears_the_registry() {
    let harness = GatewayHarness::new().await;
    harness
        .gateway
        .register_server(stdio_request("fs"))
        .await
        .unwrap();

    harness.gateway.shutdown().await;
    assert!(harness.gateway.get_all_server_statuses().await.is_empty());
}
