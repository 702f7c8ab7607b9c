//! Request log - bounded ring buffer of proxied calls.
//!
//! Every upstream-bound proxy call opens an entry (`start`), then settles
//! it (`complete`/`fail`). Retention is newest-first with a fixed bound;
//! filters are pure transforms over snapshots.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::GatewayEvent;
use crate::event_bus::EventSender;

/// Default retention bound.
pub const DEFAULT_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Tool,
    Resource,
    Prompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Success,
    Error,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// One proxied call, from dispatch to settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: RequestKind,
    /// Downstream-visible method or name (prefixed form).
    pub method: String,
    /// Upstream-side name, when it differs from `method`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_method: Option<String>,
    pub server_id: String,
    pub server_name: String,
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downstream_session_id: Option<String>,
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Parameters for opening an entry.
#[derive(Debug, Clone)]
pub struct RequestStart {
    pub kind: RequestKind,
    pub method: String,
    pub original_method: Option<String>,
    pub server_id: String,
    pub server_name: String,
    pub arguments: Value,
    pub downstream_session_id: Option<String>,
}

/// Snapshot filter. All fields are conjunctive; `query` is a
/// case-insensitive substring over method and server name.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    #[serde(rename = "type")]
    pub kind: Option<RequestKind>,
    pub server_id: Option<String>,
    pub status: Option<RequestStatus>,
    pub query: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

/// Aggregate counters over the current buffer.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogStats {
    pub total: usize,
    pub pending: usize,
    pub success: usize,
    pub error: usize,
    pub by_type: HashMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_duration_ms: Option<f64>,
}

struct Inner {
    entries: VecDeque<RequestLogEntry>,
    /// Start instants for pending entries, for duration computation.
    started: HashMap<String, Instant>,
}

/// Bounded, thread-safe request ledger.
pub struct RequestLog {
    inner: Mutex<Inner>,
    capacity: usize,
    events: Option<EventSender>,
}

impl RequestLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
                started: HashMap::new(),
            }),
            capacity: capacity.max(1),
            events: None,
        }
    }

    /// Attach an event sender; `log:started` / `log:completed` are emitted
    /// from then on.
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Open a pending entry, newest-first. Returns the entry id.
    pub fn start(&self, params: RequestStart) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let entry = RequestLogEntry {
            id: id.clone(),
            timestamp: Utc::now(),
            kind: params.kind,
            method: params.method,
            original_method: params.original_method,
            server_id: params.server_id,
            server_name: params.server_name,
            arguments: params.arguments,
            response: None,
            duration_ms: None,
            downstream_session_id: params.downstream_session_id,
            status: RequestStatus::Pending,
            error_message: None,
        };

        {
            let mut inner = self.inner.lock();
            inner.started.insert(id.clone(), Instant::now());
            inner.entries.push_front(entry);
            while inner.entries.len() > self.capacity {
                if let Some(evicted) = inner.entries.pop_back() {
                    inner.started.remove(&evicted.id);
                }
            }
        }

        if let Some(events) = &self.events {
            events.emit(GatewayEvent::LogStarted { log_id: id.clone() });
        }
        id
    }

    /// Settle an entry with its response.
    pub fn complete(&self, id: &str, response: Value) {
        self.settle(id, RequestStatus::Success, Some(response), None);
    }

    /// Settle an entry with an error message.
    pub fn fail(&self, id: &str, error_message: impl Into<String>) {
        self.settle(id, RequestStatus::Error, None, Some(error_message.into()));
    }

    fn settle(
        &self,
        id: &str,
        status: RequestStatus,
        response: Option<Value>,
        error_message: Option<String>,
    ) {
        let mut settled = false;
        {
            let mut inner = self.inner.lock();
            let elapsed = inner
                .started
                .remove(id)
                .map(|t| t.elapsed().as_millis() as u64);
            if let Some(entry) = inner.entries.iter_mut().find(|e| e.id == id) {
                entry.status = status;
                entry.response = response;
                entry.error_message = error_message;
                entry.duration_ms = elapsed;
                settled = true;
            }
        }

        // Entries evicted by the ring bound settle silently.
        if settled {
            if let Some(events) = &self.events {
                events.emit(GatewayEvent::LogCompleted {
                    log_id: id.to_string(),
                    status: status.as_str().to_string(),
                });
            }
        }
    }

    /// Fetch one entry by id.
    pub fn get(&self, id: &str) -> Option<RequestLogEntry> {
        self.inner.lock().entries.iter().find(|e| e.id == id).cloned()
    }

    /// Filtered snapshot, newest-first.
    pub fn snapshot(&self, filter: &LogFilter) -> Vec<RequestLogEntry> {
        let inner = self.inner.lock();
        let query = filter.query.as_ref().map(|q| q.to_lowercase());
        let matched = inner.entries.iter().filter(|e| {
            filter.kind.map_or(true, |k| e.kind == k)
                && filter.server_id.as_ref().map_or(true, |s| &e.server_id == s)
                && filter.status.map_or(true, |s| e.status == s)
                && filter.since.map_or(true, |t| e.timestamp >= t)
                && filter.until.map_or(true, |t| e.timestamp <= t)
                && query.as_ref().map_or(true, |q| {
                    e.method.to_lowercase().contains(q)
                        || e.server_name.to_lowercase().contains(q)
                })
        });
        matched
            .skip(filter.offset.unwrap_or(0))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> LogStats {
        let inner = self.inner.lock();
        let mut stats = LogStats {
            total: inner.entries.len(),
            ..Default::default()
        };
        let mut durations = Vec::new();
        for entry in &inner.entries {
            match entry.status {
                RequestStatus::Pending => stats.pending += 1,
                RequestStatus::Success => stats.success += 1,
                RequestStatus::Error => stats.error += 1,
            }
            let kind = match entry.kind {
                RequestKind::Tool => "tool",
                RequestKind::Resource => "resource",
                RequestKind::Prompt => "prompt",
            };
            *stats.by_type.entry(kind.to_string()).or_default() += 1;
            if let Some(ms) = entry.duration_ms {
                durations.push(ms);
            }
        }
        if !durations.is_empty() {
            stats.avg_duration_ms =
                Some(durations.iter().sum::<u64>() as f64 / durations.len() as f64);
        }
        stats
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.started.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn start_params(method: &str) -> RequestStart {
        RequestStart {
            kind: RequestKind::Tool,
            method: method.to_string(),
            original_method: Some("search".to_string()),
            server_id: "s1".to_string(),
            server_name: "GitHub".to_string(),
            arguments: json!({"q": "x"}),
            downstream_session_id: None,
        }
    }

    #[test]
    fn start_complete_cycle() {
        let log = RequestLog::new(10);
        let id = log.start(start_params("github__search"));

        let entry = log.get(&id).unwrap();
        assert_eq!(entry.status, RequestStatus::Pending);
        assert!(entry.duration_ms.is_none());

        log.complete(&id, json!({"content": []}));
        let entry = log.get(&id).unwrap();
        assert_eq!(entry.status, RequestStatus::Success);
        assert!(entry.duration_ms.is_some());
        assert!(entry.response.is_some());
    }

    #[test]
    fn fail_records_message() {
        let log = RequestLog::new(10);
        let id = log.start(start_params("github__search"));
        log.fail(&id, "upstream exploded");
        let entry = log.get(&id).unwrap();
        assert_eq!(entry.status, RequestStatus::Error);
        assert_eq!(entry.error_message.as_deref(), Some("upstream exploded"));
    }

    #[test]
    fn ring_bound_evicts_oldest() {
        let log = RequestLog::new(3);
        let first = log.start(start_params("a"));
        for name in ["b", "c", "d"] {
            log.start(start_params(name));
        }
        assert_eq!(log.len(), 3);
        assert!(log.get(&first).is_none());
        // settling an evicted entry is a no-op, not a panic
        log.complete(&first, json!(null));
    }

    #[test]
    fn newest_first_ordering() {
        let log = RequestLog::new(10);
        log.start(start_params("first"));
        log.start(start_params("second"));
        let all = log.snapshot(&LogFilter::default());
        assert_eq!(all[0].method, "second");
        assert_eq!(all[1].method, "first");
    }

    #[test]
    fn filters_compose() {
        let log = RequestLog::new(10);
        let id = log.start(start_params("github__search"));
        log.start(RequestStart {
            kind: RequestKind::Resource,
            method: "file:///tmp/x".to_string(),
            original_method: None,
            server_id: "s2".to_string(),
            server_name: "Files".to_string(),
            arguments: json!({}),
            downstream_session_id: None,
        });
        log.complete(&id, json!({}));

        let only_tools = log.snapshot(&LogFilter {
            kind: Some(RequestKind::Tool),
            ..Default::default()
        });
        assert_eq!(only_tools.len(), 1);

        let by_query = log.snapshot(&LogFilter {
            query: Some("GITHUB".to_string()),
            ..Default::default()
        });
        assert_eq!(by_query.len(), 1);

        let errors = log.snapshot(&LogFilter {
            status: Some(RequestStatus::Error),
            ..Default::default()
        });
        assert!(errors.is_empty());
    }

    #[test]
    fn stats_counts_and_average() {
        let log = RequestLog::new(10);
        let a = log.start(start_params("a"));
        let b = log.start(start_params("b"));
        log.start(start_params("c"));
        log.complete(&a, json!({}));
        log.fail(&b, "nope");

        let stats = log.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.error, 1);
        assert_eq!(stats.by_type.get("tool"), Some(&3));
        assert!(stats.avg_duration_ms.is_some());
    }
}
