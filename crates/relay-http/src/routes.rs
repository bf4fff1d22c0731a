//! Relay routes, mounted under `/sessions`.
//!
//! Handlers validate input, then drive the session protocol. Decisions are
//! always written to the session log before they are forwarded, and a failed
//! forward never undoes the write.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use relay_core::agents::HistoryMessage;
use relay_core::{AgentRegistration, AgentTrigger, Delivery, EventPayload, SessionId};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::AppState;

type ApiResult<T> = Result<T, ApiError>;

/// Actor recorded when a decision does not name one.
const DEFAULT_ACTOR: &str = "user";

const APPROVAL_NOT_FORWARDED: &str = "Approval persisted but failed to forward to agent";
const ANSWER_NOT_FORWARDED: &str = "Answer persisted but failed to forward to agent";

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/{session_id}/messages", post(send_message))
        .route("/{session_id}/regenerate", post(regenerate))
        .route("/{session_id}/stop", post(stop))
        .route("/{session_id}/approvals/{approval_id}", post(approve))
        .route("/{session_id}/answers/{tool_use_id}", post(answer))
        .route("/{session_id}/agents", post(register_agent))
        .route("/{session_id}/agents/{agent_id}", delete(unregister_agent))
        .route("/{session_id}/events", get(read_events))
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub message_id: Option<String>,
    /// Optional echo of the path id; must match it when present.
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegenerateRequest {
    pub content: String,
    #[serde(default)]
    pub message_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    #[serde(default)]
    pub message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalDecisionRequest {
    pub approved: bool,
    #[serde(default)]
    pub actor_id: Option<String>,
    /// Client correlation token; retries with the same value are recorded once.
    #[serde(default)]
    pub txid: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerRequest {
    pub answers: BTreeMap<String, String>,
    #[serde(default)]
    pub original_input: Option<Value>,
    #[serde(default)]
    pub actor_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub offset: Option<u64>,
}

/// Parse a JSON body, reporting failures as 400 rather than axum's 422.
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::Validation(format!("Invalid request body: {}", e)))
}

/// Like [`parse_body`], but an empty body yields the default.
fn parse_optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        Ok(T::default())
    } else {
        parse_body(body)
    }
}

fn require_content(content: &str) -> ApiResult<()> {
    if content.trim().is_empty() {
        return Err(ApiError::Validation("content must not be empty".to_string()));
    }
    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /sessions/{session_id}/messages
async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let request: SendMessageRequest = parse_body(&body)?;
    require_content(&request.content)?;
    if request
        .session_id
        .as_deref()
        .is_some_and(|id| id != session_id)
    {
        return Err(ApiError::Validation(
            "sessionId does not match the request path".to_string(),
        ));
    }

    let session_id = SessionId::from(session_id);
    let protocol = &state.protocol;
    let log = protocol.get_or_create_session(&session_id).await?;
    let event = protocol
        .append_user_input(&log, &request.content, request.message_id)
        .await?;
    let message_id = match &event.value {
        EventPayload::UserInput { message_id, .. } => Some(message_id.clone()),
        _ => None,
    };

    let history = protocol.history(&log).await?;
    let agents = protocol.get_registered_agents(&session_id);
    let invoked = protocol
        .start_runs(&log, agents, AgentTrigger::UserInput, history, message_id)
        .await?;

    Ok(Json(json!({
        "success": true,
        "txid": event.txid,
        "invoked": invoked,
    })))
}

/// POST /sessions/{session_id}/regenerate
///
/// Only the first registered agent is re-invoked.
async fn regenerate(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let request: RegenerateRequest = parse_body(&body)?;
    require_content(&request.content)?;

    let session_id = SessionId::from(session_id);
    let protocol = &state.protocol;
    let agent = protocol.regeneration_target(&session_id)?;

    let log = protocol.get_or_create_session(&session_id).await?;
    let stream = protocol
        .invoke_agent(
            &log,
            &agent,
            vec![HistoryMessage::user(request.content)],
            AgentTrigger::Regenerate,
            request.message_id,
        )
        .await?;
    protocol.spawn_record_run(&log, &agent.id, stream);

    Ok(Json(json!({ "success": true })))
}

/// POST /sessions/{session_id}/stop
async fn stop(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let request: StopRequest = parse_optional_body(&body)?;
    state
        .protocol
        .stop_generation(&SessionId::from(session_id), request.message_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Map a delivery to the decision routes' response.
fn decision_response(delivery: Delivery, failure: &str) -> ApiResult<StatusCode> {
    match delivery {
        Delivery::Delivered | Delivery::Stale | Delivery::NoTargets => Ok(StatusCode::NO_CONTENT),
        Delivery::Failed => Err(ApiError::ForwardFailed(failure.to_string())),
    }
}

/// POST /sessions/{session_id}/approvals/{approval_id}
async fn approve(
    State(state): State<Arc<AppState>>,
    Path((session_id, approval_id)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let request: ApprovalDecisionRequest = parse_body(&body)?;
    let session_id = SessionId::from(session_id);
    let protocol = &state.protocol;

    let log = protocol.get_or_create_session(&session_id).await?;
    protocol
        .write_approval_response(
            &log,
            request.actor_id.as_deref().unwrap_or(DEFAULT_ACTOR),
            &approval_id,
            request.approved,
            request.txid,
        )
        .await?;

    let delivery = protocol
        .forward_approval(&session_id, &approval_id, request.approved)
        .await;
    decision_response(delivery, APPROVAL_NOT_FORWARDED)
}

/// POST /sessions/{session_id}/answers/{tool_use_id}
async fn answer(
    State(state): State<Arc<AppState>>,
    Path((session_id, tool_use_id)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let request: AnswerRequest = parse_body(&body)?;
    if request.answers.is_empty() {
        return Err(ApiError::Validation("answers must not be empty".to_string()));
    }
    let session_id = SessionId::from(session_id);
    let protocol = &state.protocol;

    let log = protocol.get_or_create_session(&session_id).await?;
    protocol
        .write_answer_response(
            &log,
            request.actor_id.as_deref().unwrap_or(DEFAULT_ACTOR),
            &tool_use_id,
            request.answers.clone(),
            request.original_input.clone(),
        )
        .await?;

    let delivery = protocol
        .forward_answer(
            &session_id,
            &tool_use_id,
            &request.answers,
            request.original_input.as_ref(),
        )
        .await;
    decision_response(delivery, ANSWER_NOT_FORWARDED)
}

/// POST /sessions/{session_id}/agents
async fn register_agent(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let agent: AgentRegistration = parse_body(&body)?;
    let agents = state
        .protocol
        .register_agent(&SessionId::from(session_id), agent)
        .await?;
    Ok(Json(json!({ "success": true, "agents": agents })))
}

/// DELETE /sessions/{session_id}/agents/{agent_id}
async fn unregister_agent(
    State(state): State<Arc<AppState>>,
    Path((session_id, agent_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    if state
        .protocol
        .unregister_agent(&SessionId::from(session_id), &agent_id)
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Agent not registered: {}", agent_id)))
    }
}

/// GET /sessions/{session_id}/events?offset=N
///
/// Returns events with txid greater than `offset`; `nextOffset` is the last
/// txid returned, or `offset` again when nothing is new.
async fn read_events(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Value>> {
    let events = state
        .protocol
        .read_events(&SessionId::from(session_id), query.offset)
        .await?;
    let next_offset = events
        .last()
        .map(|e| e.txid)
        .or(query.offset)
        .unwrap_or(0);
    Ok(Json(json!({ "events": events, "nextOffset": next_offset })))
}

// ============================================================================
// TESTS
// ============================================================================
