//! In-process event broadcasting.
//!
//! Session log appends, agent output, and client drain progress are all
//! published here so WebSocket subscribers (and tests) can observe them
//! without polling the log.
//!
//! # Example
//!
//! ```rust
//! use relay_core::event_bus::{topics, EventBus};
//! use relay_core::SessionId;
//!
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe();
//!
//! let session = SessionId::from("s1");
//! bus.emit(&topics::client_done(&session), &serde_json::json!({}));
//! assert_eq!(rx.try_recv().unwrap().event_type, "client:done:s1");
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events beyond this capacity will cause slow subscribers to lag.
pub const DEFAULT_CAPACITY: usize = 1024;

/// An event type plus its JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastEvent {
    /// Topic, e.g. `session:event:abc123` or `client:done:abc123`.
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl BroadcastEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

/// Topic names. Every topic ends with the session id it belongs to.
pub mod topics {
    use crate::session::SessionId;

    /// A session log append.
    pub fn session_event(id: &SessionId) -> String {
        format!("session:event:{id}")
    }

    /// A chunk recorded from an agent run on the relay side.
    pub fn agent_chunk(id: &SessionId) -> String {
        format!("agent:chunk:{id}")
    }

    /// A chunk re-emitted by the client drain loop.
    pub fn client_chunk(id: &SessionId) -> String {
        format!("client:chunk:{id}")
    }

    pub fn client_suspended(id: &SessionId) -> String {
        format!("client:suspended:{id}")
    }

    pub fn client_auto_approved(id: &SessionId) -> String {
        format!("client:auto-approved:{id}")
    }

    pub fn client_done(id: &SessionId) -> String {
        format!("client:done:{id}")
    }

    pub fn client_error(id: &SessionId) -> String {
        format!("client:error:{id}")
    }

    /// Split a topic into `(family, kind, session_id)`.
    ///
    /// Families and kinds never contain `:`, so everything after the second
    /// separator is the session id.
    pub fn split(topic: &str) -> Option<(&str, &str, &str)> {
        let mut parts = topic.splitn(3, ':');
        let family = parts.next()?;
        let kind = parts.next()?;
        let session_id = parts.next().filter(|id| !id.is_empty())?;
        Some((family, kind, session_id))
    }
}

/// Multi-consumer event bus over a tokio broadcast channel.
pub struct EventBus {
    sender: broadcast::Sender<BroadcastEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event to all subscribers.
    ///
    /// Returns the number of subscribers that received it; 0 when nobody is
    /// listening or the payload fails to serialize.
    pub fn emit<T: Serialize>(&self, event_type: &str, payload: &T) -> usize {
        let json_payload = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("Failed to serialize event payload for {}: {}", event_type, e);
                return 0;
            }
        };

        self.sender
            .send(BroadcastEvent::new(event_type, json_payload))
            .unwrap_or(0)
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.sender.subscribe()
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

// ============================================================================
// TESTS
// ============================================================================
