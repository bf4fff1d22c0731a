//! SessionProtocol - the relay's core operations on a session.
//!
//! Every mutating operation appends to the session log before any network
//! call reaches a worker. Forwarding afterwards is best-effort: a failed
//! forward never rolls back the append.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::{json, Value};
use uuid::Uuid;

use super::manager::SessionManager;
use super::state::SessionId;
use crate::agents::{
    AgentChunk, AgentInvoker, AgentRegistration, AgentTrigger, ChunkStream, HistoryMessage,
    InvocationRequest, MessageRole, WorkerError,
};
use crate::config::RelayConfig;
use crate::event_bus::{topics, EventBus};
use crate::forwarder::{classify, Delivery, ForwardOutcome, Forwarder};
use crate::logging::TraceLog;
use crate::stream::{Event, EventPayload, SessionLog, StreamError, StreamStore, Txid};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("no agents registered for session {0}")]
    NoAgents(SessionId),

    #[error("invalid agent registration: {0}")]
    InvalidRegistration(String),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// What happened during one recorded agent run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub run_id: Option<String>,
    pub chunks: usize,
    pub text: String,
    /// Set when the run paused on an approval gate.
    pub pending_approval: Option<String>,
    pub error: Option<String>,
}

pub struct SessionProtocol {
    store: Arc<dyn StreamStore>,
    sessions: SessionManager,
    invoker: Arc<dyn AgentInvoker>,
    forwarder: Forwarder,
    event_bus: Arc<EventBus>,
    trace: TraceLog,
}

impl SessionProtocol {
    pub fn new(
        store: Arc<dyn StreamStore>,
        invoker: Arc<dyn AgentInvoker>,
        event_bus: Arc<EventBus>,
        config: &RelayConfig,
    ) -> Self {
        Self {
            store,
            sessions: SessionManager::new(),
            invoker,
            forwarder: Forwarder::new(config.forward_timeout),
            event_bus,
            trace: TraceLog::new(config.trace_dir.clone()),
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn list_sessions(&self) -> Vec<SessionId> {
        self.sessions.list_sessions()
    }

    // ========================================================================
    // Sessions and registrations
    // ========================================================================

    /// Return the session's log handle, creating the session on first access.
    pub async fn get_or_create_session(&self, session_id: &SessionId) -> ProtocolResult<SessionLog> {
        self.store.ensure_stream(session_id).await?;
        self.sessions.get_or_create(session_id);
        Ok(SessionLog::new(session_id.clone(), Arc::clone(&self.store)))
    }

    pub fn get_registered_agents(&self, session_id: &SessionId) -> Vec<AgentRegistration> {
        self.sessions.registered_agents(session_id)
    }

    pub async fn register_agent(
        &self,
        session_id: &SessionId,
        agent: AgentRegistration,
    ) -> ProtocolResult<Vec<AgentRegistration>> {
        agent
            .validate()
            .map_err(ProtocolError::InvalidRegistration)?;
        self.store.ensure_stream(session_id).await?;

        log::info!(
            "Registering agent {} for session {} at {}",
            agent.id,
            session_id,
            agent.endpoint
        );
        Ok(self.sessions.register_agent(session_id, agent))
    }

    pub fn unregister_agent(&self, session_id: &SessionId, agent_id: &str) -> bool {
        let removed = self.sessions.unregister_agent(session_id, agent_id);
        if removed {
            log::info!("Unregistered agent {} from session {}", agent_id, session_id);
        }
        removed
    }

    /// The agent a regenerate goes to: the first one registered.
    pub fn regeneration_target(&self, session_id: &SessionId) -> ProtocolResult<AgentRegistration> {
        self.get_registered_agents(session_id)
            .into_iter()
            .next()
            .ok_or_else(|| ProtocolError::NoAgents(session_id.clone()))
    }

    // ========================================================================
    // Log writes
    // ========================================================================

    async fn append(&self, log: &SessionLog, payload: EventPayload) -> ProtocolResult<Event> {
        let event = log.append(payload).await?;
        self.event_bus
            .emit(&topics::session_event(log.session_id()), &event);
        Ok(event)
    }

    async fn append_keyed(
        &self,
        log: &SessionLog,
        key: String,
        payload: EventPayload,
    ) -> ProtocolResult<Event> {
        let event = log.append_keyed(key, payload).await?;
        self.event_bus
            .emit(&topics::session_event(log.session_id()), &event);
        Ok(event)
    }

    /// Append a user message. Reusing a message id does not write twice.
    pub async fn append_user_input(
        &self,
        log: &SessionLog,
        content: &str,
        message_id: Option<String>,
    ) -> ProtocolResult<Event> {
        let message_id = message_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.append_keyed(
            log,
            format!("user_input:{message_id}"),
            EventPayload::UserInput {
                message_id,
                content: content.to_string(),
            },
        )
        .await
    }

    /// Record a decision on an approval.
    ///
    /// `txid` correlates retries of the same decision; writing the same
    /// `(approval_id, txid)` twice returns the original event.
    pub async fn write_approval_response(
        &self,
        log: &SessionLog,
        actor_id: &str,
        approval_id: &str,
        approved: bool,
        txid: Option<String>,
    ) -> ProtocolResult<Event> {
        let txid = txid.unwrap_or_else(|| Uuid::new_v4().to_string());
        log::info!(
            "Approval {} for session {}: approved={} by {}",
            approval_id,
            log.session_id(),
            approved,
            actor_id
        );
        self.append_keyed(
            log,
            format!("approval:{approval_id}:{txid}"),
            EventPayload::ApprovalResponse {
                approval_id: approval_id.to_string(),
                actor_id: actor_id.to_string(),
                approved,
                txid,
            },
        )
        .await
    }

    pub async fn write_answer_response(
        &self,
        log: &SessionLog,
        actor_id: &str,
        tool_use_id: &str,
        answers: BTreeMap<String, String>,
        original_input: Option<Value>,
    ) -> ProtocolResult<Event> {
        self.append(
            log,
            EventPayload::AnswerResponse {
                tool_use_id: tool_use_id.to_string(),
                actor_id: actor_id.to_string(),
                answers,
                original_input,
            },
        )
        .await
    }

    pub async fn read_events(
        &self,
        session_id: &SessionId,
        after: Option<Txid>,
    ) -> ProtocolResult<Vec<Event>> {
        Ok(self.store.read(session_id, after).await?)
    }

    /// Conversation history from the log: user inputs and assistant messages.
    pub async fn history(&self, log: &SessionLog) -> ProtocolResult<Vec<HistoryMessage>> {
        let events = log.read(None).await?;
        Ok(events
            .into_iter()
            .filter_map(|event| match event.value {
                EventPayload::UserInput { content, .. } => Some(HistoryMessage {
                    role: MessageRole::User,
                    content,
                }),
                EventPayload::AssistantMessage { content, .. } => Some(HistoryMessage {
                    role: MessageRole::Assistant,
                    content,
                }),
                _ => None,
            })
            .collect())
    }

    // ========================================================================
    // Agent runs
    // ========================================================================

    /// Record the invocation, then call the worker.
    pub async fn invoke_agent(
        &self,
        log: &SessionLog,
        agent: &AgentRegistration,
        history: Vec<HistoryMessage>,
        trigger: AgentTrigger,
        message_id: Option<String>,
    ) -> ProtocolResult<ChunkStream> {
        self.append(
            log,
            EventPayload::AgentInvocation {
                agent_id: agent.id.clone(),
                trigger,
                message_id: message_id.clone(),
            },
        )
        .await?;

        let request = InvocationRequest {
            session_id: log.session_id().clone(),
            messages: history,
            trigger,
            message_id,
        };
        Ok(self.invoker.invoke(agent, request).await?)
    }

    /// Invoke each agent and record its run in the background.
    ///
    /// Returns the ids of agents whose invocation started. An agent that
    /// cannot be invoked is logged and skipped.
    pub async fn start_runs(
        self: &Arc<Self>,
        log: &SessionLog,
        agents: Vec<AgentRegistration>,
        trigger: AgentTrigger,
        history: Vec<HistoryMessage>,
        message_id: Option<String>,
    ) -> ProtocolResult<Vec<String>> {
        let mut started = Vec::new();
        for agent in agents.into_iter().filter(|a| a.handles(trigger)) {
            let stream = match self
                .invoke_agent(log, &agent, history.clone(), trigger, message_id.clone())
                .await
            {
                Ok(stream) => stream,
                Err(ProtocolError::Worker(err)) => {
                    log::warn!(
                        "Failed to invoke agent {} for session {}: {}",
                        agent.id,
                        log.session_id(),
                        err
                    );
                    continue;
                }
                Err(err) => return Err(err),
            };

            self.spawn_record_run(log, &agent.id, stream);
            started.push(agent.id);
        }
        Ok(started)
    }

    /// Record a run on a background task.
    pub fn spawn_record_run(self: &Arc<Self>, log: &SessionLog, agent_id: &str, stream: ChunkStream) {
        let protocol = Arc::clone(self);
        let run_log = log.clone();
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = protocol.record_run(&run_log, &agent_id, stream).await {
                log::error!(
                    "Recording run of {} for session {} failed: {}",
                    agent_id,
                    run_log.session_id(),
                    err
                );
            }
        });
    }

    /// Pump a worker stream into the log and onto the event bus.
    ///
    /// Tool calls, tool results, and approval requests are durable; text
    /// deltas are broadcast and written once as a single assistant message
    /// when the stream ends.
    pub async fn record_run(
        &self,
        log: &SessionLog,
        agent_id: &str,
        mut stream: ChunkStream,
    ) -> ProtocolResult<RunSummary> {
        let session_id = log.session_id().clone();
        let mut summary = RunSummary::default();

        while let Some(item) = stream.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(err) => {
                    log::warn!("Agent {} stream for {} ended: {}", agent_id, session_id, err);
                    summary.error = Some(err.to_string());
                    break;
                }
            };
            summary.chunks += 1;
            self.event_bus.emit(
                &topics::agent_chunk(&session_id),
                &json!({"agentId": agent_id, "chunk": chunk}),
            );

            match chunk {
                AgentChunk::RunStarted { run_id } => summary.run_id = Some(run_id),
                AgentChunk::TextDelta { delta } => summary.text.push_str(&delta),
                AgentChunk::ToolCall {
                    tool_call_id,
                    tool_name,
                    input,
                } => {
                    self.append(
                        log,
                        EventPayload::ToolCall {
                            agent_id: agent_id.to_string(),
                            tool_call_id,
                            tool_name,
                            input,
                        },
                    )
                    .await?;
                }
                AgentChunk::ToolCallApproval(request) => {
                    summary.pending_approval = Some(request.approval_id.clone());
                    self.append_keyed(
                        log,
                        format!("approval_request:{}", request.approval_id),
                        EventPayload::ApprovalRequest {
                            agent_id: agent_id.to_string(),
                            approval_id: request.approval_id,
                            tool_call_id: request.tool_call_id,
                            tool_name: request.tool_name,
                            input: request.input,
                        },
                    )
                    .await?;
                }
                AgentChunk::ToolResult {
                    tool_call_id,
                    output,
                    is_error,
                } => {
                    self.append(
                        log,
                        EventPayload::ToolResult {
                            agent_id: agent_id.to_string(),
                            tool_call_id,
                            output,
                            is_error,
                        },
                    )
                    .await?;
                }
                AgentChunk::Finish => {}
                AgentChunk::Error { message } => {
                    log::warn!("Agent {} reported error for {}: {}", agent_id, session_id, message);
                    summary.error = Some(message);
                }
            }
        }

        if !summary.text.is_empty() {
            self.append(
                log,
                EventPayload::AssistantMessage {
                    agent_id: agent_id.to_string(),
                    content: summary.text.clone(),
                },
            )
            .await?;
        }

        log::debug!(
            "Recorded run of {} for {}: {} chunks",
            agent_id,
            session_id,
            summary.chunks
        );
        Ok(summary)
    }

    // ========================================================================
    // Forwarding
    // ========================================================================

    /// Send a persisted decision to every registered agent of the session.
    pub async fn forward_decision(&self, session_id: &SessionId, path: &str, body: &Value) -> Delivery {
        let agents = self.get_registered_agents(session_id);
        self.trace
            .line(session_id, "FORWARD", &format!("{path} -> {} agent(s) {body}", agents.len()));

        let outcomes = self.forwarder.forward_all(&agents, path, body).await;
        for (agent_id, outcome) in &outcomes {
            self.trace_outcome(session_id, path, agent_id, outcome);
        }

        let delivery = classify(&outcomes);
        if delivery == Delivery::Stale {
            log::warn!(
                "Decision {} for session {} was already resolved by every agent",
                path,
                session_id
            );
        }
        delivery
    }

    fn trace_outcome(&self, session_id: &SessionId, path: &str, agent_id: &str, outcome: &ForwardOutcome) {
        match outcome {
            ForwardOutcome::Delivered => {
                self.trace
                    .line(session_id, "RESULT", &format!("{agent_id} {path} ok"));
            }
            ForwardOutcome::Rejected {
                status,
                status_text,
            } => {
                if !outcome.is_stale() {
                    log::warn!(
                        "Forward {} to agent {} failed: {} {}",
                        path,
                        agent_id,
                        status,
                        status_text
                    );
                }
                self.trace.line(
                    session_id,
                    "RESULT",
                    &format!("{agent_id} {path} {status} {status_text}"),
                );
            }
        }
    }

    pub async fn forward_approval(
        &self,
        session_id: &SessionId,
        approval_id: &str,
        approved: bool,
    ) -> Delivery {
        self.forward_decision(
            session_id,
            &format!("approvals/{approval_id}"),
            &json!({ "approved": approved }),
        )
        .await
    }

    pub async fn forward_answer(
        &self,
        session_id: &SessionId,
        tool_use_id: &str,
        answers: &BTreeMap<String, String>,
        original_input: Option<&Value>,
    ) -> Delivery {
        let mut body = json!({ "answers": answers });
        if let Some(input) = original_input {
            body["originalInput"] = input.clone();
        }
        self.forward_decision(session_id, &format!("answers/{tool_use_id}"), &body)
            .await
    }

    /// Ask workers to stop generating.
    ///
    /// `None` stops the whole session, `Some` targets one message. The
    /// request is logged first; delivery is advisory and failures are only
    /// logged.
    pub async fn stop_generation(
        &self,
        session_id: &SessionId,
        message_id: Option<String>,
    ) -> ProtocolResult<Delivery> {
        let log = self.get_or_create_session(session_id).await?;
        self.append(
            &log,
            EventPayload::StopRequest {
                message_id: message_id.clone(),
            },
        )
        .await?;

        let delivery = self
            .forward_decision(session_id, "stop", &json!({ "messageId": message_id }))
            .await;
        if delivery == Delivery::Failed {
            log::warn!("Stop signal for session {} was not delivered", session_id);
        }
        Ok(delivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::ApprovalRequestChunk;
    use crate::stream::MemoryStreamStore;
    use crate::test_support::{spawn_server, ScriptedInvoker};
    use axum::{http::StatusCode, routing::post, Router};
    use std::time::Duration;

    fn protocol_with(invoker: Arc<ScriptedInvoker>, config: &RelayConfig) -> SessionProtocol {
        SessionProtocol::new(
            Arc::new(MemoryStreamStore::new()),
            invoker,
            Arc::new(EventBus::new()),
            config,
        )
    }

    fn protocol() -> SessionProtocol {
        protocol_with(Arc::new(ScriptedInvoker::default()), &RelayConfig::default())
    }

    fn kinds(events: &[Event]) -> Vec<&'static str> {
        events.iter().map(|e| e.value.kind()).collect()
    }

    mod sessions {
        use super::*;

        #[tokio::test]
        async fn get_or_create_session_tracks_session() {
            let protocol = protocol();
            let id = SessionId::from("s1");

            let log = protocol.get_or_create_session(&id).await.unwrap();

            assert_eq!(log.session_id(), &id);
            assert_eq!(protocol.list_sessions(), vec![id]);
        }

        #[tokio::test]
        async fn register_rejects_invalid_agent() {
            let protocol = protocol();
            let result = protocol
                .register_agent(&SessionId::from("s1"), AgentRegistration::new("a", "not-a-url"))
                .await;
            assert!(matches!(result, Err(ProtocolError::InvalidRegistration(_))));
        }

        #[tokio::test]
        async fn regeneration_target_is_first_registered() {
            let protocol = protocol();
            let id = SessionId::from("s1");
            assert!(matches!(
                protocol.regeneration_target(&id),
                Err(ProtocolError::NoAgents(_))
            ));

            protocol
                .register_agent(&id, AgentRegistration::new("first", "http://a"))
                .await
                .unwrap();
            protocol
                .register_agent(&id, AgentRegistration::new("second", "http://b"))
                .await
                .unwrap();

            assert_eq!(protocol.regeneration_target(&id).unwrap().id, "first");
        }
    }

    mod writes {
        use super::*;

        #[tokio::test]
        async fn user_input_is_idempotent_per_message_id() {
            let protocol = protocol();
            let log = protocol
                .get_or_create_session(&SessionId::from("s1"))
                .await
                .unwrap();

            let first = protocol
                .append_user_input(&log, "add a test", Some("m1".to_string()))
                .await
                .unwrap();
            let retry = protocol
                .append_user_input(&log, "add a test", Some("m1".to_string()))
                .await
                .unwrap();

            assert_eq!(first.txid, retry.txid);
            assert_eq!(kinds(&log.read(None).await.unwrap()), vec!["user_input"]);
        }

        #[tokio::test]
        async fn approval_retry_with_same_txid_writes_once() {
            let protocol = protocol();
            let log = protocol
                .get_or_create_session(&SessionId::from("s1"))
                .await
                .unwrap();

            let txid = Some("client-tx-1".to_string());
            protocol
                .write_approval_response(&log, "user", "approval-1", true, txid.clone())
                .await
                .unwrap();
            protocol
                .write_approval_response(&log, "user", "approval-1", true, txid)
                .await
                .unwrap();

            assert_eq!(log.read(None).await.unwrap().len(), 1);
        }

        #[tokio::test]
        async fn distinct_decisions_are_totally_ordered() {
            let protocol = protocol();
            let log = protocol
                .get_or_create_session(&SessionId::from("s1"))
                .await
                .unwrap();

            let (a, b) = tokio::join!(
                protocol.write_approval_response(&log, "u1", "approval-1", true, None),
                protocol.write_approval_response(&log, "u2", "approval-1", false, None),
            );
            let (a, b) = (a.unwrap(), b.unwrap());

            assert_ne!(a.txid, b.txid);
            let events = log.read(None).await.unwrap();
            assert_eq!(events.len(), 2);
            assert!(events[0].txid < events[1].txid);
        }

        #[tokio::test]
        async fn appends_are_broadcast() {
            let protocol = protocol();
            let mut rx = protocol.event_bus().subscribe();
            let log = protocol
                .get_or_create_session(&SessionId::from("s1"))
                .await
                .unwrap();

            protocol.append_user_input(&log, "hi", None).await.unwrap();

            let event = rx.recv().await.unwrap();
            assert_eq!(event.event_type, "session:event:s1");
            assert_eq!(event.payload["value"]["type"], "user_input");
        }

        #[tokio::test]
        async fn history_includes_user_and_assistant_messages() {
            let protocol = protocol();
            let log = protocol
                .get_or_create_session(&SessionId::from("s1"))
                .await
                .unwrap();
            protocol.append_user_input(&log, "hi", None).await.unwrap();
            protocol
                .write_approval_response(&log, "user", "a1", true, None)
                .await
                .unwrap();

            let history = protocol.history(&log).await.unwrap();
            assert_eq!(history, vec![HistoryMessage::user("hi")]);
        }
    }

    mod runs {
        use super::*;

        #[tokio::test]
        async fn invoke_logs_invocation_before_calling_worker() {
            let invoker = Arc::new(ScriptedInvoker::failing());
            let protocol = protocol_with(Arc::clone(&invoker), &RelayConfig::default());
            let log = protocol
                .get_or_create_session(&SessionId::from("s1"))
                .await
                .unwrap();

            let result = protocol
                .invoke_agent(
                    &log,
                    &AgentRegistration::new("a", "http://a"),
                    vec![HistoryMessage::user("hi")],
                    AgentTrigger::UserInput,
                    None,
                )
                .await;

            assert!(matches!(result, Err(ProtocolError::Worker(_))));
            assert_eq!(kinds(&log.read(None).await.unwrap()), vec!["agent_invocation"]);
            assert_eq!(invoker.calls().len(), 1);
        }

        #[tokio::test]
        async fn record_run_persists_durable_chunks() {
            let invoker = Arc::new(ScriptedInvoker::new(vec![
                AgentChunk::RunStarted {
                    run_id: "run-1".to_string(),
                },
                AgentChunk::TextDelta {
                    delta: "Writing ".to_string(),
                },
                AgentChunk::ToolCall {
                    tool_call_id: "c1".to_string(),
                    tool_name: "read_file".to_string(),
                    input: json!({"path": "a.rs"}),
                },
                AgentChunk::ToolResult {
                    tool_call_id: "c1".to_string(),
                    output: json!("fn main() {}"),
                    is_error: false,
                },
                AgentChunk::TextDelta {
                    delta: "the test".to_string(),
                },
                AgentChunk::ToolCallApproval(ApprovalRequestChunk {
                    approval_id: "approval-1".to_string(),
                    tool_call_id: Some("c2".to_string()),
                    tool_name: "write_file".to_string(),
                    input: json!({}),
                }),
            ]));
            let protocol = protocol_with(Arc::clone(&invoker), &RelayConfig::default());
            let agent = AgentRegistration::new("a", "http://a");
            let log = protocol
                .get_or_create_session(&SessionId::from("s1"))
                .await
                .unwrap();

            let stream = protocol
                .invoke_agent(&log, &agent, vec![], AgentTrigger::UserInput, None)
                .await
                .unwrap();
            let summary = protocol.record_run(&log, "a", stream).await.unwrap();

            assert_eq!(summary.run_id.as_deref(), Some("run-1"));
            assert_eq!(summary.pending_approval.as_deref(), Some("approval-1"));
            assert_eq!(summary.text, "Writing the test");
            assert_eq!(
                kinds(&log.read(None).await.unwrap()),
                vec![
                    "agent_invocation",
                    "tool_call",
                    "tool_result",
                    "approval_request",
                    "assistant_message"
                ]
            );
        }

        #[tokio::test]
        async fn start_runs_skips_agents_that_ignore_trigger() {
            let invoker = Arc::new(ScriptedInvoker::new(vec![AgentChunk::Finish]));
            let protocol = Arc::new(protocol_with(Arc::clone(&invoker), &RelayConfig::default()));
            let log = protocol
                .get_or_create_session(&SessionId::from("s1"))
                .await
                .unwrap();
            let agents = vec![
                AgentRegistration::new("chat", "http://a"),
                AgentRegistration::new("regen-only", "http://b")
                    .with_triggers(vec![AgentTrigger::Regenerate]),
            ];

            let started = protocol
                .start_runs(&log, agents, AgentTrigger::UserInput, vec![], None)
                .await
                .unwrap();

            assert_eq!(started, vec!["chat".to_string()]);
            assert_eq!(invoker.calls()[0].0, "chat");
        }

        #[tokio::test]
        async fn start_runs_skips_failed_invocations() {
            let protocol = Arc::new(protocol_with(
                Arc::new(ScriptedInvoker::failing()),
                &RelayConfig::default(),
            ));
            let log = protocol
                .get_or_create_session(&SessionId::from("s1"))
                .await
                .unwrap();

            let started = protocol
                .start_runs(
                    &log,
                    vec![AgentRegistration::new("a", "http://a")],
                    AgentTrigger::UserInput,
                    vec![],
                    None,
                )
                .await
                .unwrap();

            assert!(started.is_empty());
        }
    }

    mod forwarding {
        use super::*;

        fn worker() -> Router {
            Router::new()
                .route(
                    "/fresh/approvals/{id}",
                    post(|| async { StatusCode::NO_CONTENT }),
                )
                .route(
                    "/forgetful/approvals/{id}",
                    post(|| async { StatusCode::NOT_FOUND }),
                )
                .route(
                    "/slow/approvals/{id}",
                    post(|| async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        StatusCode::NO_CONTENT
                    }),
                )
                .route("/fresh/stop", post(|| async { StatusCode::NO_CONTENT }))
                .route(
                    "/fresh/answers/{id}",
                    post(|| async { StatusCode::NO_CONTENT }),
                )
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn stale_forward_keeps_decision_in_log() {
            let base = spawn_server(worker()).await;
            let protocol = protocol();
            let id = SessionId::from("s1");
            protocol
                .register_agent(&id, AgentRegistration::new("a", format!("{base}/forgetful")))
                .await
                .unwrap();
            let log = protocol.get_or_create_session(&id).await.unwrap();

            protocol
                .write_approval_response(&log, "user", "approval-1", true, None)
                .await
                .unwrap();
            let delivery = protocol.forward_approval(&id, "approval-1", true).await;

            assert_eq!(delivery, Delivery::Stale);
            assert_eq!(kinds(&log.read(None).await.unwrap()), vec!["approval_response"]);
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn timeout_is_failed_delivery() {
            let base = spawn_server(worker()).await;
            let config = RelayConfig::default().with_forward_timeout(Duration::from_millis(200));
            let protocol = protocol_with(Arc::new(ScriptedInvoker::default()), &config);
            let id = SessionId::from("s1");
            protocol
                .register_agent(&id, AgentRegistration::new("a", format!("{base}/slow")))
                .await
                .unwrap();

            assert_eq!(
                protocol.forward_approval(&id, "approval-1", true).await,
                Delivery::Failed
            );
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn answers_forward_to_answer_path() {
            let base = spawn_server(worker()).await;
            let protocol = protocol();
            let id = SessionId::from("s1");
            protocol
                .register_agent(&id, AgentRegistration::new("a", format!("{base}/fresh")))
                .await
                .unwrap();

            let answers = BTreeMap::from([("q1".to_string(), "yes".to_string())]);
            assert_eq!(
                protocol.forward_answer(&id, "tool-1", &answers, None).await,
                Delivery::Delivered
            );
        }

        #[tokio::test]
        async fn forward_without_agents_has_no_targets() {
            let protocol = protocol();
            assert_eq!(
                protocol
                    .forward_approval(&SessionId::from("s1"), "approval-1", true)
                    .await,
                Delivery::NoTargets
            );
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn stop_generation_logs_then_signals() {
            let base = spawn_server(worker()).await;
            let protocol = protocol();
            let id = SessionId::from("s1");
            protocol
                .register_agent(&id, AgentRegistration::new("a", format!("{base}/fresh")))
                .await
                .unwrap();

            let delivery = protocol
                .stop_generation(&id, Some("m1".to_string()))
                .await
                .unwrap();

            assert_eq!(delivery, Delivery::Delivered);
            let events = protocol.read_events(&id, None).await.unwrap();
            assert_eq!(
                events[0].value,
                EventPayload::StopRequest {
                    message_id: Some("m1".to_string())
                }
            );
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn forwards_are_traced_per_session() {
            let base = spawn_server(worker()).await;
            let dir = tempfile::tempdir().unwrap();
            let config = RelayConfig::default().with_trace_dir(dir.path());
            let protocol = protocol_with(Arc::new(ScriptedInvoker::default()), &config);
            let id = SessionId::from("s1");
            protocol
                .register_agent(&id, AgentRegistration::new("a", format!("{base}/forgetful")))
                .await
                .unwrap();

            protocol.forward_approval(&id, "approval-1", true).await;

            let trace = std::fs::read_to_string(dir.path().join("s1.log")).unwrap();
            assert!(trace.contains("FORWARD: approvals/approval-1"));
            assert!(trace.contains("RESULT: a approvals/approval-1 404"));
        }
    }
}
