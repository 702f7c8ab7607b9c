//! OAuth flow tests against a mocked authorization server.

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mcpgate_core::{GatewayEvent, OAuthTokens};
use mcpgate_gateway::oauth::{AuthOutcome, OAuthDiscovery, OAuthSettings};
use tests::{collect_events, GatewayHarness};

async fn mount_discovery(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/.well-known/oauth-protected-resource"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resource": format!("{}/mcp", server.uri()),
            "authorization_servers": [server.uri()],
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/.well-known/oauth-authorization-server"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": server.uri(),
            "authorization_endpoint": format!("{}/authorize", server.uri()),
            "token_endpoint": format!("{}/token", server.uri()),
            "registration_endpoint": format!("{}/register", server.uri()),
            "response_types_supported": ["code"],
            "grant_types_supported": ["authorization_code", "refresh_token"],
            "code_challenge_methods_supported": ["S256"],
        })))
        .mount(server)
        .await;
}

fn fresh_tokens(expires_in: Option<i64>) -> OAuthTokens {
    OAuthTokens {
        access_token: "AT".to_string(),
        token_type: "Bearer".to_string(),
        expires_in,
        scope: None,
        refresh_token: Some("RT".to_string()),
        obtained_at: Utc::now(),
        extra: serde_json::Map::new(),
    }
}

#[tokio::test]
async fn initiate_runs_dcr_and_emits_redirect_with_pkce() {
    let mock = MockServer::start().await;
    mount_discovery(&mock).await;
    Mock::given(method("POST"))
        .and(path("/register"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "client_id": "dcr-client",
            "client_id_issued_at": 1700000000,
        })))
        .mount(&mock)
        .await;

    let harness = GatewayHarness::new().await;
    let mut rx = harness.bus.subscribe();

    let outcome = harness
        .oauth
        .initiate_auth("srv-1", &mock.uri(), OAuthSettings::default())
        .await
        .unwrap();

    let AuthOutcome::Redirect { auth_url } = outcome else {
        panic!("expected a redirect outcome");
    };
    assert!(auth_url.contains("response_type=code"));
    assert!(auth_url.contains("client_id=dcr-client"));
    assert!(auth_url.contains("code_challenge_method=S256"));
    assert!(auth_url.contains("code_challenge="));
    assert!(auth_url.contains("oauth%2Fcallback%2Fsrv-1"));

    // DCR result and the one-shot verifier are durable before the redirect
    assert_eq!(
        harness.store.get_client_info("srv-1").await.unwrap().client_id,
        "dcr-client"
    );
    assert!(harness.store.get_code_verifier("srv-1").await.is_some());

    // and the suspension is published for the operator
    let events = collect_events(&mut rx).await;
    let oauth_event = events
        .iter()
        .find(|e| e.type_name() == "oauth:required")
        .expect("oauth:required emitted");
    match oauth_event {
        GatewayEvent::OauthRequired { server_id, auth_url: url } => {
            assert_eq!(server_id, "srv-1");
            assert_eq!(url, &auth_url);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn callback_exchanges_code_and_clears_the_verifier() {
    let mock = MockServer::start().await;
    mount_discovery(&mock).await;
    Mock::given(method("POST"))
        .and(path("/register"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "client_id": "dcr-client",
        })))
        .mount(&mock)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=AUTHCODE"))
        .and(body_string_contains("code_verifier="))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "AT",
            "token_type": "Bearer",
            "expires_in": 3600,
            "refresh_token": "RT",
        })))
        .mount(&mock)
        .await;

    let harness = GatewayHarness::new().await;
    harness
        .oauth
        .initiate_auth("srv-1", &mock.uri(), OAuthSettings::default())
        .await
        .unwrap();

    let outcome = harness
        .oauth
        .handle_callback("srv-1", &mock.uri(), "AUTHCODE", OAuthSettings::default())
        .await
        .unwrap();
    assert!(matches!(outcome, AuthOutcome::Authorized));

    let tokens = harness.store.get_tokens("srv-1").await.unwrap();
    assert_eq!(tokens.access_token, "AT");
    assert_eq!(tokens.refresh_token.as_deref(), Some("RT"));
    // the one-shot secret is gone once tokens landed
    assert!(harness.store.get_code_verifier("srv-1").await.is_none());
}

#[tokio::test]
async fn valid_tokens_short_circuit_to_authorized() {
    // no mocks mounted: any HTTP would fail the test
    let harness = GatewayHarness::new().await;
    harness.store.set_tokens("srv-1", fresh_tokens(None)).await;

    let outcome = harness
        .oauth
        .initiate_auth("srv-1", "https://unreachable.invalid", OAuthSettings::default())
        .await
        .unwrap();
    assert!(matches!(outcome, AuthOutcome::Authorized));
}

#[tokio::test]
async fn rejected_refresh_token_restarts_the_flow() {
    let mock = MockServer::start().await;
    mount_discovery(&mock).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({ "error": "invalid_grant" })),
        )
        .mount(&mock)
        .await;

    let harness = GatewayHarness::new().await;
    let mut expired = fresh_tokens(Some(10));
    expired.obtained_at = Utc::now() - Duration::hours(1);
    harness.store.set_tokens("srv-1", expired).await;

    let settings = OAuthSettings {
        client_id: Some("static-client".to_string()),
        ..Default::default()
    };
    let result = harness
        .oauth
        .fresh_tokens("srv-1", &mock.uri(), settings)
        .await
        .unwrap();

    // the grant is dead: no tokens to hand out, store wiped of them
    assert!(result.is_none());
    assert!(harness.store.get_tokens("srv-1").await.is_none());
}

#[tokio::test]
async fn refresh_preserves_rotating_refresh_token_absence() {
    let mock = MockServer::start().await;
    mount_discovery(&mock).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=RT"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "AT2",
            "token_type": "Bearer",
            "expires_in": 3600,
        })))
        .mount(&mock)
        .await;

    let harness = GatewayHarness::new().await;
    let mut expiring = fresh_tokens(Some(10));
    expiring.obtained_at = Utc::now() - Duration::hours(1);
    harness.store.set_tokens("srv-1", expiring).await;

    let settings = OAuthSettings {
        client_id: Some("static-client".to_string()),
        ..Default::default()
    };
    let refreshed = harness
        .oauth
        .fresh_tokens("srv-1", &mock.uri(), settings)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(refreshed.access_token, "AT2");
    // server omitted the refresh token; the stored one is carried forward
    assert_eq!(refreshed.refresh_token.as_deref(), Some("RT"));
}

#[tokio::test]
async fn discovery_falls_back_to_oidc() {
    let mock = MockServer::start().await;
    // no protected-resource and no AS metadata; only OIDC discovery
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": mock.uri(),
            "authorization_endpoint": format!("{}/authorize", mock.uri()),
            "token_endpoint": format!("{}/token", mock.uri()),
            "code_challenge_methods_supported": ["S256"],
        })))
        .mount(&mock)
        .await;

    let discovery = OAuthDiscovery::new(reqwest::Client::new());
    let metadata = discovery.discover_for_server(&mock.uri()).await.unwrap();
    assert_eq!(metadata.issuer, mock.uri());
    assert!(metadata.supports_pkce());
}
