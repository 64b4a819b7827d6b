//! Typed turn events and the per-session event bus.
//!
//! One broadcast channel per session: the orchestrator publishes without
//! ever blocking, every subscriber sees events in publication order, and a
//! subscriber that falls behind observes `Lagged` on its receiver — the
//! consumer turns that into a final `subscriber_lagged` event and drops
//! the subscription.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;

/// Terminal status of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Ok,
    Error,
    Timeout,
    ToolLoopCap,
}

/// Everything a client can observe about runtime progress.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    TurnStarted {
        message_id: i64,
    },
    AssistantDelta {
        text: String,
    },
    ToolCallStarted {
        name: String,
        args_preview: String,
    },
    ToolCallFinished {
        name: String,
        ok: bool,
        duration_ms: u64,
        result_preview: String,
    },
    AssistantMessage {
        id: i64,
        text: String,
    },
    TurnFinished {
        status: TurnStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    AppStateChanged {
        key: String,
        value: String,
    },
    SubscriberLagged {
        missed: u64,
    },
    ReloadFailure {
        name: String,
        kind: String,
        detail: String,
    },
}

impl TurnEvent {
    /// SSE event name for this variant.
    pub fn name(&self) -> &'static str {
        match self {
            TurnEvent::TurnStarted { .. } => "turn_started",
            TurnEvent::AssistantDelta { .. } => "assistant_delta",
            TurnEvent::ToolCallStarted { .. } => "tool_call_started",
            TurnEvent::ToolCallFinished { .. } => "tool_call_finished",
            TurnEvent::AssistantMessage { .. } => "assistant_message",
            TurnEvent::TurnFinished { .. } => "turn_finished",
            TurnEvent::AppStateChanged { .. } => "app_state_changed",
            TurnEvent::SubscriberLagged { .. } => "subscriber_lagged",
            TurnEvent::ReloadFailure { .. } => "reload_failure",
        }
    }
}

/// An event stamped with its session, turn, and sequence number.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub session_id: String,
    /// Absent for events outside any turn (reloads, app-state changes).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    pub seq: u64,
    #[serde(flatten)]
    pub event: TurnEvent,
}

struct SessionChannel {
    tx: broadcast::Sender<Envelope>,
    seq: Arc<AtomicU64>,
}

/// Per-session fan-out of [`TurnEvent`]s.
pub struct EventBus {
    capacity: usize,
    sessions: Mutex<HashMap<String, SessionChannel>>,
}

impl EventBus {
    /// `capacity` bounds each session's buffer; a subscriber more than
    /// `capacity` events behind is lagged.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn channel(&self, session_id: &str) -> (broadcast::Sender<Envelope>, Arc<AtomicU64>) {
        let mut sessions = self.sessions.lock().expect("event bus poisoned");
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(self.capacity);
                SessionChannel {
                    tx,
                    seq: Arc::new(AtomicU64::new(0)),
                }
            });
        (entry.tx.clone(), entry.seq.clone())
    }

    /// Publish an event for a session. Never blocks; returns the assigned
    /// sequence number.
    pub fn publish(&self, session_id: &str, turn_id: Option<&str>, event: TurnEvent) -> u64 {
        let (tx, seq) = self.channel(session_id);
        let n = seq.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope {
            session_id: session_id.to_string(),
            turn_id: turn_id.map(String::from),
            seq: n,
            event,
        };
        // No subscribers is fine.
        let _ = tx.send(envelope);
        n
    }

    /// Publish a system event (reload failures, app-state flips) to every
    /// session that has ever had a subscriber or publication.
    pub fn publish_all(&self, event: TurnEvent) {
        let session_ids: Vec<String> = {
            let sessions = self.sessions.lock().expect("event bus poisoned");
            sessions.keys().cloned().collect()
        };
        for sid in session_ids {
            self.publish(&sid, None, event.clone());
        }
    }

    /// Subscribe to a session's events from now on (no replay).
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<Envelope> {
        self.channel(session_id).0.subscribe()
    }
}

// ── Tests ────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn events_arrive_in_publication_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe("s1");

        for i in 0..3 {
            bus.publish(
                "s1",
                Some("t1"),
                TurnEvent::AssistantDelta {
                    text: format!("d{i}"),
                },
            );
        }

        for i in 0..3u64 {
            let env = rx.recv().await.unwrap();
            assert_eq!(env.seq, i);
            assert!(matches!(
                env.event,
                TurnEvent::AssistantDelta { ref text } if *text == format!("d{i}")
            ));
        }
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let bus = EventBus::new(16);
        let mut rx_a = bus.subscribe("a");
        let mut rx_b = bus.subscribe("b");

        bus.publish("a", None, TurnEvent::AssistantDelta { text: "for a".into() });

        let env = rx_a.recv().await.unwrap();
        assert_eq!(env.session_id, "a");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_subscriber_observes_lag() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe("s");

        for i in 0..32 {
            bus.publish(
                "s",
                None,
                TurnEvent::AssistantDelta {
                    text: format!("{i}"),
                },
            );
        }

        match rx.recv().await {
            Err(RecvError::Lagged(missed)) => assert!(missed > 0),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        let seq = bus.publish("ghost", None, TurnEvent::SubscriberLagged { missed: 0 });
        assert_eq!(seq, 0);
    }

    #[tokio::test]
    async fn publish_all_reaches_known_sessions() {
        let bus = EventBus::new(16);
        let mut rx_a = bus.subscribe("a");
        let mut rx_b = bus.subscribe("b");

        bus.publish_all(TurnEvent::ReloadFailure {
            name: "echo".into(),
            kind: "load_failure".into(),
            detail: "syntax error".into(),
        });

        assert!(matches!(
            rx_a.recv().await.unwrap().event,
            TurnEvent::ReloadFailure { .. }
        ));
        assert!(matches!(
            rx_b.recv().await.unwrap().event,
            TurnEvent::ReloadFailure { .. }
        ));
    }

    #[test]
    fn envelope_serialisation_shape() {
        let env = Envelope {
            session_id: "s".into(),
            turn_id: Some("t".into()),
            seq: 7,
            event: TurnEvent::TurnFinished {
                status: TurnStatus::ToolLoopCap,
                kind: None,
                detail: None,
            },
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "turn_finished");
        assert_eq!(json["status"], "tool_loop_cap");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["turn_id"], "t");
    }
}
