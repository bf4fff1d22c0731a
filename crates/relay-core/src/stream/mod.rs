//! Append-only, session-scoped event log.
//!
//! # Overview
//!
//! Every session owns one ordered stream of [`Event`]s. The store assigns a
//! commit token ([`Txid`]) on each append; txids strictly increase across the
//! whole store, so any reader can tell which of two writes happened first.
//! Wall-clock timestamps are informational only and never used for ordering.
//!
//! # Idempotent appends
//!
//! Each event carries a unique `key`. Appending with a key that already exists
//! in the session returns the stored event untouched instead of writing a
//! duplicate. The session protocol derives keys for decisions so that a client
//! retrying the same decision cannot record it twice.
//!
//! # Backends
//!
//! - [`MemoryStreamStore`] keeps everything in process memory.
//! - [`JsonlStreamStore`] appends one JSON line per event to
//!   `{dir}/{session_id}.jsonl`.

mod jsonl;
mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agents::AgentTrigger;
use crate::session::SessionId;

pub use jsonl::JsonlStreamStore;
pub use memory::MemoryStreamStore;

/// Commit token assigned by the store on every append.
pub type Txid = u64;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream io failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid session id for stream: {0}")]
    InvalidSession(String),

    #[error("stream backend failure: {0}")]
    Backend(String),
}

pub type StreamResult<T> = Result<T, StreamError>;

/// Change operation recorded in the event headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[default]
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHeaders {
    pub operation: Operation,
}

/// Typed payload of a log event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum EventPayload {
    /// A message typed by a user.
    UserInput { message_id: String, content: String },

    /// The agent decided to call a tool.
    ToolCall {
        agent_id: String,
        tool_call_id: String,
        tool_name: String,
        input: serde_json::Value,
    },

    /// Output of a tool call.
    ToolResult {
        agent_id: String,
        tool_call_id: String,
        output: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },

    /// The agent is waiting for a yes/no decision on a tool call.
    ApprovalRequest {
        agent_id: String,
        approval_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
        tool_name: String,
        input: serde_json::Value,
    },

    /// A human or policy decision on a pending approval.
    ApprovalResponse {
        approval_id: String,
        actor_id: String,
        approved: bool,
        /// Client-supplied correlation token for this decision.
        txid: String,
    },

    /// Free-form answers to a tool question.
    AnswerResponse {
        tool_use_id: String,
        actor_id: String,
        answers: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original_input: Option<serde_json::Value>,
    },

    /// An agent was invoked for this session.
    AgentInvocation {
        agent_id: String,
        trigger: AgentTrigger,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },

    /// Assistant text accumulated over one run.
    AssistantMessage { agent_id: String, content: String },

    /// Cooperative request to stop generation.
    StopRequest {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
}

impl EventPayload {
    /// Wire name of the payload variant.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::UserInput { .. } => "user_input",
            EventPayload::ToolCall { .. } => "tool_call",
            EventPayload::ToolResult { .. } => "tool_result",
            EventPayload::ApprovalRequest { .. } => "approval_request",
            EventPayload::ApprovalResponse { .. } => "approval_response",
            EventPayload::AnswerResponse { .. } => "answer_response",
            EventPayload::AgentInvocation { .. } => "agent_invocation",
            EventPayload::AssistantMessage { .. } => "assistant_message",
            EventPayload::StopRequest { .. } => "stop_request",
        }
    }
}

/// An immutable, committed log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub key: String,
    pub value: EventPayload,
    pub headers: EventHeaders,
    pub txid: Txid,
    pub created_at: DateTime<Utc>,
}

/// An event that has not been committed yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub key: String,
    pub value: EventPayload,
    pub operation: Operation,
}

impl NewEvent {
    /// Insert with a freshly minted key.
    pub fn insert(value: EventPayload) -> Self {
        Self::keyed(Uuid::new_v4().to_string(), value)
    }

    /// Insert with a caller-chosen key; appending the same key twice is a no-op.
    pub fn keyed(key: impl Into<String>, value: EventPayload) -> Self {
        Self {
            key: key.into(),
            value,
            operation: Operation::Insert,
        }
    }

    pub(crate) fn commit(self, txid: Txid) -> Event {
        Event {
            key: self.key,
            value: self.value,
            headers: EventHeaders {
                operation: self.operation,
            },
            txid,
            created_at: Utc::now(),
        }
    }
}

/// Storage backend for session logs.
///
/// Implementations must assign txids under a single lock so that concurrent
/// writers observe a strict total order.
#[async_trait::async_trait]
pub trait StreamStore: Send + Sync {
    /// Make sure a stream exists for the session. Creating is idempotent.
    async fn ensure_stream(&self, session_id: &SessionId) -> StreamResult<()>;

    /// Commit an event. Returns the existing event if the key was already used.
    async fn append(&self, session_id: &SessionId, event: NewEvent) -> StreamResult<Event>;

    /// Read events in txid order, optionally only those after `after`.
    ///
    /// Unknown sessions read as empty.
    async fn read(&self, session_id: &SessionId, after: Option<Txid>) -> StreamResult<Vec<Event>>;
}

/// Handle to one session's log.
#[derive(Clone)]
pub struct SessionLog {
    session_id: SessionId,
    store: Arc<dyn StreamStore>,
}

impl SessionLog {
    pub fn new(session_id: SessionId, store: Arc<dyn StreamStore>) -> Self {
        Self { session_id, store }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub async fn append(&self, value: EventPayload) -> StreamResult<Event> {
        self.store
            .append(&self.session_id, NewEvent::insert(value))
            .await
    }

    pub async fn append_keyed(
        &self,
        key: impl Into<String> + Send,
        value: EventPayload,
    ) -> StreamResult<Event> {
        self.store
            .append(&self.session_id, NewEvent::keyed(key, value))
            .await
    }

    pub async fn read(&self, after: Option<Txid>) -> StreamResult<Vec<Event>> {
        self.store.read(&self.session_id, after).await
    }
}

impl std::fmt::Debug for SessionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLog")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}
