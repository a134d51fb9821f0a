//! Fire-and-forget event hub.
//!
//! State transitions in the registry and recorder are announced on a hub so
//! UIs can follow along. Publishing never fails the transition that caused
//! it: callers go through [`publish_quietly`], which logs and drops errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

/// An event published on the hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub topic: String,
    pub session_id: String,
    pub payload: serde_json::Value,
    /// Unix milliseconds.
    pub timestamp: i64,
}

impl Event {
    pub fn new(
        topic: impl Into<String>,
        session_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            topic: topic.into(),
            session_id: session_id.into(),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("hub closed")]
    Closed,
    #[error("hub error: {0}")]
    Other(String),
}

/// Destination for session and recording events.
pub trait EventHub: Send + Sync {
    fn publish(&self, event: &Event) -> Result<(), HubError>;
}

/// Publish an event and swallow any failure.
pub fn publish_quietly(hub: &dyn EventHub, event: Event) {
    if let Err(e) = hub.publish(&event) {
        debug!(topic = %event.topic, session_id = %event.session_id, error = %e, "event publish failed");
    }
}

/// Hub that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHub;

impl EventHub for NoopHub {
    fn publish(&self, _event: &Event) -> Result<(), HubError> {
        Ok(())
    }
}

/// In-process hub backed by a tokio broadcast channel.
///
/// Having no subscribers is not an error; slow subscribers lag and lose
/// the oldest events.
#[derive(Debug, Clone)]
pub struct BroadcastHub {
    tx: broadcast::Sender<Event>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventHub for BroadcastHub {
    fn publish(&self, event: &Event) -> Result<(), HubError> {
        // send() only fails when nobody is listening.
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

// Well-known event topics
pub mod topics {
    pub const SESSION_OPENED: &str = "session.opened";
    pub const SESSION_PARTICIPANT_JOINED: &str = "session.participant_joined";
    pub const SESSION_PARTICIPANT_LEFT: &str = "session.participant_left";
    pub const SESSION_WRITE_GRANTED: &str = "session.write_granted";
    pub const SESSION_CHAT_POSTED: &str = "session.chat_posted";
    pub const SESSION_CLOSED: &str = "session.closed";
    pub const RECORDING_STARTED: &str = "recording.started";
    pub const RECORDING_FINISHED: &str = "recording.finished";
    pub const RECORDING_FAILED: &str = "recording.failed";
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingHub;

    impl EventHub for FailingHub {
        fn publish(&self, _event: &Event) -> Result<(), HubError> {
            Err(HubError::Closed)
        }
    }

    #[test]
    fn event_creation() {
        let event = Event::new(topics::SESSION_OPENED, "s1", serde_json::json!({"k": 1}));
        assert_eq!(event.topic, "session.opened");
        assert_eq!(event.session_id, "s1");
        assert!(event.timestamp > 0);
    }

    #[test]
    fn publish_quietly_swallows_errors() {
        publish_quietly(&FailingHub, Event::new("x", "s", serde_json::Value::Null));
    }

    #[tokio::test]
    async fn broadcast_hub_delivers_to_subscribers() {
        let hub = BroadcastHub::new(8);
        let mut rx = hub.subscribe();
        hub.publish(&Event::new(topics::SESSION_CLOSED, "s1", serde_json::json!({})))
            .unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.topic, topics::SESSION_CLOSED);
    }

    #[test]
    fn broadcast_hub_without_subscribers_is_ok() {
        let hub = BroadcastHub::default();
        assert_eq!(hub.subscriber_count(), 0);
        assert!(hub
            .publish(&Event::new("t", "s", serde_json::Value::Null))
            .is_ok());
    }
}
