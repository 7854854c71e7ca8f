use std::collections::HashMap;

use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use grouptab_protocol::{Event, SessionId};

/// Per-session broadcast channels for domain events.
///
/// The engine produces exactly one event per successful mutation; delivery
/// to slow subscribers is best-effort (lagging receivers drop, per
/// `tokio::sync::broadcast` semantics). The notification collaborator
/// subscribes here and fans out to participant devices.
pub struct EventBroker {
    channels: RwLock<HashMap<SessionId, broadcast::Sender<Event>>>,
    capacity: usize,
}

impl EventBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Create the channel for a new session.
    pub async fn register(&self, session_id: &str) {
        let (tx, _rx) = broadcast::channel(self.capacity);
        self.channels
            .write()
            .await
            .insert(session_id.to_string(), tx);
    }

    /// Drop the channel for a reaped session.
    pub async fn remove(&self, session_id: &str) {
        self.channels.write().await.remove(session_id);
    }

    /// Subscribe to a session's event stream. `None` if the session has
    /// no channel (unknown or already reaped).
    pub async fn subscribe(&self, session_id: &str) -> Option<broadcast::Receiver<Event>> {
        self.channels
            .read()
            .await
            .get(session_id)
            .map(|tx| tx.subscribe())
    }

    /// Publish one event. A send error only means nobody is subscribed.
    pub async fn emit(&self, session_id: &str, event: Event) {
        if let Some(tx) = self.channels.read().await.get(session_id) {
            if tx.send(event).is_err() {
                debug!(session_id = %session_id, "event emitted with no subscribers");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_emit_subscribe_remove_cycle() {
        let broker = EventBroker::new(8);
        broker.register("s1").await;
        let mut rx = broker.subscribe("s1").await.expect("subscribe");

        broker
            .emit(
                "s1",
                Event::SessionLocked {
                    session_id: "s1".to_string(),
                },
            )
            .await;

        let evt = rx.recv().await.expect("recv");
        assert!(matches!(evt, Event::SessionLocked { .. }));

        broker.remove("s1").await;
        assert!(broker.subscribe("s1").await.is_none());
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_not_an_error() {
        let broker = EventBroker::new(8);
        broker.register("s1").await;
        // No subscriber attached; emit must not panic or error.
        broker
            .emit(
                "s1",
                Event::SessionExpired {
                    session_id: "s1".to_string(),
                },
            )
            .await;
    }

    #[tokio::test]
    async fn emit_to_unknown_session_is_a_no_op() {
        let broker = EventBroker::new(8);
        broker
            .emit(
                "missing",
                Event::SessionExpired {
                    session_id: "missing".to_string(),
                },
            )
            .await;
    }
}
