//! Request-log behavior, including the event bus hookup.

use pretty_assertions::assert_eq;
use serde_json::json;

use mcpgate_core::request_log::{LogFilter, RequestKind, RequestStart, RequestStatus};
use mcpgate_core::{EventBus, RequestLog};

fn start(method: &str, server: &str) -> RequestStart {
    RequestStart {
        kind: RequestKind::Tool,
        method: method.to_string(),
        original_method: None,
        server_id: format!("id-{server}"),
        server_name: server.to_string(),
        arguments: json!({}),
        downstream_session_id: Some("ds-1".to_string()),
    }
}

#[tokio::test]
async fn lifecycle_events_reach_the_bus() {
    let bus = EventBus::new();
    let mut rx = bus.subscribe();
    let log = RequestLog::new(10).with_events(bus.sender());

    let id = log.start(start("github__search", "GitHub"));
    log.complete(&id, json!({ "content": [] }));

    let started = rx.recv().await.unwrap();
    assert_eq!(started.type_name(), "log:started");

    let completed = rx.recv().await.unwrap();
    assert_eq!(completed.type_name(), "log:completed");
    let json = serde_json::to_value(&completed).unwrap();
    assert_eq!(json["status"], "success");
}

#[test]
fn capacity_bound_holds_under_churn() {
    let log = RequestLog::new(50);
    for i in 0..500 {
        let id = log.start(start(&format!("tool{i}"), "srv"));
        if i % 2 == 0 {
            log.complete(&id, json!(null));
        }
    }
    assert_eq!(log.len(), 50);

    // newest-first: first snapshot entry is the last started
    let newest = &log.snapshot(&LogFilter::default())[0];
    assert_eq!(newest.method, "tool499");
}

#[test]
fn filters_and_paging_compose() {
    let log = RequestLog::new(100);
    for i in 0..10 {
        let id = log.start(start(&format!("a{i}"), "Alpha"));
        log.fail(&id, "boom");
    }
    for i in 0..10 {
        let id = log.start(start(&format!("b{i}"), "Beta"));
        log.complete(&id, json!(null));
    }

    let errors = log.snapshot(&LogFilter {
        status: Some(RequestStatus::Error),
        ..Default::default()
    });
    assert_eq!(errors.len(), 10);
    assert!(errors.iter().all(|e| e.server_name == "Alpha"));

    let page = log.snapshot(&LogFilter {
        status: Some(RequestStatus::Error),
        offset: Some(5),
        limit: Some(3),
        ..Default::default()
    });
    assert_eq!(page.len(), 3);

    let by_server = log.snapshot(&LogFilter {
        server_id: Some("id-Beta".to_string()),
        ..Default::default()
    });
    assert_eq!(by_server.len(), 10);
}

#[test]
fn stats_summarize_the_buffer() {
    let log = RequestLog::new(100);
    let a = log.start(start("x", "S"));
    log.complete(&a, json!(null));
    let b = log.start(start("y", "S"));
    log.fail(&b, "nope");
    log.start(start("z", "S"));

    let stats = log.stats();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.success, 1);
    assert_eq!(stats.error, 1);
    assert_eq!(stats.pending, 1);
    assert!(stats.avg_duration_ms.is_some());
}

#[test]
fn entries_serialize_with_wire_field_names() {
    let log = RequestLog::new(10);
    let id = log.start(start("github__search", "GitHub"));
    let entry = log.get(&id).unwrap();
    let json = serde_json::to_value(&entry).unwrap();

    assert_eq!(json["type"], "tool");
    assert_eq!(json["status"], "pending");
    assert_eq!(json["serverName"], "GitHub");
    assert_eq!(json["downstreamSessionId"], "ds-1");
    assert!(json.get("durationMs").is_none());
}
