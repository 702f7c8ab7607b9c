//! Event bus - in-process fan-out of gateway events.
//!
//! Producers (gateway, sessions, OAuth manager, request log) emit
//! [`GatewayEvent`]s; consumers (downstream notifier, `/events` SSE stream)
//! subscribe. Delivery is best-effort in publication order per subscriber;
//! a slow subscriber lags and skips, it never blocks the publisher.

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::GatewayEvent;

/// Default channel capacity for the event bus.
const DEFAULT_CAPACITY: usize = 256;

/// Central hub for gateway event distribution.
///
/// Backed by a broadcast channel so every subscriber receives its own copy
/// of every event.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Get a sender for emitting events. Cheap to clone and share.
    pub fn sender(&self) -> EventSender {
        EventSender {
            sender: self.sender.clone(),
        }
    }

    /// Subscribe to all events emitted after this call.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Emitting half of the bus, one per producer.
#[derive(Clone)]
pub struct EventSender {
    sender: broadcast::Sender<GatewayEvent>,
}

impl EventSender {
    /// Emit an event. Returns the number of receivers; zero receivers is
    /// not an error.
    pub fn emit(&self, event: GatewayEvent) -> usize {
        let type_name = event.type_name();
        match self.sender.send(event) {
            Ok(count) => {
                debug!(event_type = type_name, receivers = count, "emitted event");
                count
            }
            Err(_) => {
                debug!(event_type = type_name, "no receivers for event");
                0
            }
        }
    }

    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

/// Receiving half of the bus, one per consumer.
pub struct EventReceiver {
    receiver: broadcast::Receiver<GatewayEvent>,
}

impl EventReceiver {
    /// Receive the next event. Returns `None` when the bus is closed.
    /// Lag is logged and skipped, not surfaced.
    pub async fn recv(&mut self) -> Option<GatewayEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped_events = skipped, "event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("event bus closed");
                    return None;
                }
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<GatewayEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                warn!(skipped_events = skipped, "event receiver lagged on try_recv");
                self.receiver.try_recv().ok()
            }
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn basic_emit_receive() {
        let bus = EventBus::new();
        let sender = bus.sender();
        let mut receiver = bus.subscribe();

        sender.emit(GatewayEvent::ServerAdded {
            server_id: "s1".to_string(),
            name: "fs".to_string(),
        });

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.type_name(), "server:added");
        assert_eq!(event.server_id(), Some("s1"));
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive() {
        let bus = EventBus::new();
        let sender = bus.sender();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        sender.emit(GatewayEvent::ServerRemoved {
            server_id: "s1".to_string(),
        });

        assert_eq!(rx1.recv().await.unwrap().type_name(), "server:removed");
        assert_eq!(rx2.recv().await.unwrap().type_name(), "server:removed");
    }

    #[test]
    fn emit_without_receivers_returns_zero() {
        let bus = EventBus::new();
        let sender = bus.sender();
        let count = sender.emit(GatewayEvent::LogStarted {
            log_id: "l1".to_string(),
        });
        assert_eq!(count, 0);
        assert!(!sender.has_subscribers());
    }
}
