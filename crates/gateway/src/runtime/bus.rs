//! Per-session websocket fan-out with presence tracking.
//!
//! Each subscriber owns an unbounded channel drained by its socket task.
//! Events are serialized once at publish time and enqueued in call order,
//! so subscribers observe session events in the order they were appended.
//! Broadcast is best-effort: a subscriber whose channel is closed is pruned
//! on the next send.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::events::{EventKind, SessionEvent};

struct Subscriber {
    id: u64,
    operator: String,
    #[allow(dead_code)]
    joined_at: DateTime<Utc>,
    tx: mpsc::UnboundedSender<Value>,
}

#[derive(Default)]
pub struct EventBus {
    sessions: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber and publish the updated presence set.
    pub fn subscribe(
        &self,
        session_id: &str,
        operator: String,
    ) -> (u64, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut sessions = self.sessions.lock();
            sessions
                .entry(session_id.to_string())
                .or_default()
                .push(Subscriber {
                    id,
                    operator,
                    joined_at: Utc::now(),
                    tx,
                });
        }
        self.publish_presence(session_id);
        (id, rx)
    }

    /// Drop a subscriber and publish the updated presence set.
    pub fn unsubscribe(&self, session_id: &str, subscriber_id: u64) {
        {
            let mut sessions = self.sessions.lock();
            if let Some(subs) = sessions.get_mut(session_id) {
                subs.retain(|s| s.id != subscriber_id);
                if subs.is_empty() {
                    sessions.remove(session_id);
                }
            }
        }
        self.publish_presence(session_id);
    }

    /// Current operator names for a session.
    pub fn presence(&self, session_id: &str) -> Vec<String> {
        self.sessions
            .lock()
            .get(session_id)
            .map(|subs| subs.iter().map(|s| s.operator.clone()).collect())
            .unwrap_or_default()
    }

    /// Send an event to every subscriber of a session, pruning dead ones.
    pub fn broadcast(&self, session_id: &str, kind: EventKind) {
        let event = SessionEvent::now(kind);
        let Ok(payload) = serde_json::to_value(&event) else {
            return;
        };
        let mut sessions = self.sessions.lock();
        if let Some(subs) = sessions.get_mut(session_id) {
            subs.retain(|s| s.tx.send(payload.clone()).is_ok());
            if subs.is_empty() {
                sessions.remove(session_id);
            }
        }
    }

    /// Deliver a raw payload to one subscriber (ping/pong replies).
    pub fn send_to(&self, session_id: &str, subscriber_id: u64, payload: Value) {
        let sessions = self.sessions.lock();
        if let Some(sub) = sessions
            .get(session_id)
            .and_then(|subs| subs.iter().find(|s| s.id == subscriber_id))
        {
            let _ = sub.tx.send(payload);
        }
    }

    fn publish_presence(&self, session_id: &str) {
        let users = self.presence(session_id);
        self.broadcast(session_id, EventKind::PresenceUpdate { users });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::new();
        let (_id, mut rx) = bus.subscribe("s1", "alice".into());

        // First delivery is the presence update from our own join.
        let first = rx.recv().await.unwrap();
        assert_eq!(first["type"], "presence_update");
        assert_eq!(first["users"][0], "alice");

        for i in 0..3 {
            bus.broadcast(
                "s1",
                EventKind::AutoStatus {
                    message: format!("step {i}"),
                    step: Some(i),
                    max_steps: None,
                },
            );
        }
        for i in 0..3 {
            let evt = rx.recv().await.unwrap();
            assert_eq!(evt["type"], "auto_status");
            assert_eq!(evt["message"], format!("step {i}"));
        }
    }

    #[tokio::test]
    async fn dead_subscribers_are_pruned() {
        let bus = EventBus::new();
        let (_a, rx_a) = bus.subscribe("s1", "alice".into());
        let (_b, mut rx_b) = bus.subscribe("s1", "bob".into());
        drop(rx_a);

        bus.broadcast(
            "s1",
            EventKind::AutoAiReply {
                message: "hi".into(),
            },
        );
        assert_eq!(bus.presence("s1"), vec!["bob"]);

        let mut saw_reply = false;
        while let Ok(evt) = rx_b.try_recv() {
            if evt["type"] == "auto_ai_reply" {
                saw_reply = true;
            }
        }
        assert!(saw_reply);
    }

    #[tokio::test]
    async fn unsubscribe_updates_presence() {
        let bus = EventBus::new();
        let (id_a, _rx_a) = bus.subscribe("s1", "alice".into());
        let (_id_b, _rx_b) = bus.subscribe("s1", "bob".into());
        assert_eq!(bus.presence("s1").len(), 2);

        bus.unsubscribe("s1", id_a);
        assert_eq!(bus.presence("s1"), vec!["bob"]);
    }

    #[tokio::test]
    async fn send_to_reaches_one_subscriber() {
        let bus = EventBus::new();
        let (id_a, mut rx_a) = bus.subscribe("s1", "alice".into());
        let (_id_b, mut rx_b) = bus.subscribe("s1", "bob".into());

        // Drain the join presence events first.
        while rx_a.try_recv().is_ok() {}
        while rx_b.try_recv().is_ok() {}

        bus.send_to("s1", id_a, serde_json::json!({ "type": "pong" }));
        assert_eq!(rx_a.try_recv().unwrap()["type"], "pong");
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn broadcast_to_empty_session_is_noop() {
        let bus = EventBus::new();
        bus.broadcast(
            "ghost",
            EventKind::AutoAiReply {
                message: "nobody home".into(),
            },
        );
        assert!(bus.presence("ghost").is_empty());
    }
}
