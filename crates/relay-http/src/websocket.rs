//! Live relay feed over WebSocket.
//!
//! Clients connect to `/ws/events` and receive bus events as
//! `{topic, family, kind, sessionId, payload}` frames. The feed is scoped to
//! sessions: `?sessionId=s1` watches one session from the start, and
//! `{"op":"watch","sessionId":"s2"}` / `{"op":"unwatch",...}` change the set
//! afterwards. A connection watching nothing gets every session. `?family=`
//! narrows the feed to one topic family (`session`, `agent` or `client`).

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use relay_core::event_bus::{topics, BroadcastEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;

use crate::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedQuery {
    session_id: Option<String>,
    family: Option<String>,
}

/// Commands a connected client may send.
#[derive(Debug, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", rename_all_fields = "camelCase")]
enum ClientCommand {
    Watch { session_id: String },
    Unwatch { session_id: String },
}

/// Which bus events reach one connection.
#[derive(Debug, Default)]
struct SessionFilter {
    sessions: HashSet<String>,
    family: Option<String>,
}

impl SessionFilter {
    fn from_query(query: FeedQuery) -> Self {
        Self {
            sessions: query.session_id.into_iter().collect(),
            family: query.family,
        }
    }

    fn apply(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Watch { session_id } => {
                log::debug!("WebSocket watching session {}", session_id);
                self.sessions.insert(session_id);
            }
            ClientCommand::Unwatch { session_id } => {
                log::debug!("WebSocket stopped watching session {}", session_id);
                self.sessions.remove(&session_id);
            }
        }
    }

    /// The frame for `event`, or `None` when this connection should not see it.
    fn frame(&self, event: BroadcastEvent) -> Option<Frame> {
        let (family, kind, session_id) = topics::split(&event.event_type)?;
        if self.family.as_deref().is_some_and(|f| f != family) {
            return None;
        }
        if !self.sessions.is_empty() && !self.sessions.contains(session_id) {
            return None;
        }
        Some(Frame {
            family: family.to_string(),
            kind: kind.to_string(),
            session_id: session_id.to_string(),
            topic: event.event_type,
            payload: event.payload,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Frame {
    topic: String,
    family: String,
    kind: String,
    session_id: String,
    payload: serde_json::Value,
}

/// Handler for GET /ws/events
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<FeedQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let filter = SessionFilter::from_query(query);
    ws.on_upgrade(|socket| handle_socket(socket, state, filter))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, filter: SessionFilter) {
    let (mut sender, mut receiver) = socket.split();

    let filter = Arc::new(Mutex::new(filter));
    let mut event_rx = state.event_bus().subscribe();

    let commands = Arc::clone(&filter);
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let Message::Text(text) = msg else {
                continue;
            };
            match serde_json::from_str::<ClientCommand>(&text) {
                Ok(command) => commands
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .apply(command),
                Err(e) => log::debug!("Ignoring WebSocket message: {}", e),
            }
        }
    });

    let send_task = tokio::spawn(async move {
        loop {
            let event = match event_rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(count)) => {
                    log::warn!("WebSocket client lagged by {} events", count);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let frame = filter.lock().unwrap_or_else(|e| e.into_inner()).frame(event);
            let Some(frame) = frame else {
                continue;
            };
            if let Ok(json) = serde_json::to_string(&frame) {
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = recv_task => {},
        _ = send_task => {},
    }

    log::debug!("WebSocket connection closed");
}

// ============================================================================
// TESTS
// ============================================================================
