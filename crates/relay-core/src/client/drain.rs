//! The client drain loop.
//!
//! Consumes one agent run's chunk stream, re-emitting every chunk to session
//! subscribers. Approval requests are either resolved locally under the
//! session's permission mode, in which case the loop switches to the resumed
//! stream and keeps going, or they suspend the session and the loop returns.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;

use super::context::ClientSessionContext;
use super::registry::{DrainTicket, SessionRegistry};
use super::ClientError;
use crate::agents::{AgentChunk, ApprovalRequestChunk, ChunkStream, ResumeCall, RunResumer};
use crate::approval::{decide, GateDecision};
use crate::event_bus::{topics, EventBus};
use crate::session::SessionId;

/// How a drain ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The stream ran out; `done` was emitted.
    Done,
    /// Waiting on a human decision for `approval_id`.
    Suspended { approval_id: String },
    /// A newer drain for the same session took over; nothing was emitted.
    Superseded,
    /// `error` was emitted and the session entry dropped.
    Failed { message: String },
}

#[derive(Clone)]
pub struct DrainLoop {
    pub(super) registry: Arc<SessionRegistry>,
    pub(super) resumer: Arc<dyn RunResumer>,
    pub(super) event_bus: Arc<EventBus>,
}

enum Step {
    Continue,
    Switch(ChunkStream),
    Stop(DrainOutcome),
}

impl DrainLoop {
    pub fn new(
        registry: Arc<SessionRegistry>,
        resumer: Arc<dyn RunResumer>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            resumer,
            event_bus,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Start draining `stream` for a session.
    ///
    /// Any drain already running for the session is superseded. `run_id` may
    /// be unknown until the stream's `run-started` chunk arrives.
    pub async fn start(
        &self,
        session_id: &SessionId,
        context: ClientSessionContext,
        run_id: Option<String>,
        stream: ChunkStream,
    ) -> DrainOutcome {
        log::info!(
            "Draining session {} ({})",
            session_id,
            context.permission_mode
        );
        match self.registry.begin(session_id, context, run_id) {
            Ok(ticket) => self.drain(ticket, stream).await,
            Err(err) => DrainOutcome::Failed {
                message: err.to_string(),
            },
        }
    }

    pub(super) async fn drain(&self, ticket: DrainTicket, mut stream: ChunkStream) -> DrainOutcome {
        loop {
            let Some(item) = stream.next().await else {
                return self.complete(&ticket);
            };

            let step = match item {
                Ok(chunk) => self.handle_chunk(&ticket, chunk).await,
                Err(err) => Err(ClientError::Worker(err)),
            };

            match step {
                Ok(Step::Continue) => {}
                Ok(Step::Switch(next)) => stream = next,
                Ok(Step::Stop(outcome)) => return outcome,
                Err(ClientError::Superseded(_)) => return DrainOutcome::Superseded,
                Err(err) => return self.fail(&ticket, err),
            }
        }
    }

    async fn handle_chunk(&self, ticket: &DrainTicket, chunk: AgentChunk) -> Result<Step, ClientError> {
        if !self.registry.is_current(ticket) {
            return Err(ClientError::Superseded(ticket.session_id.clone()));
        }
        self.event_bus
            .emit(&topics::client_chunk(&ticket.session_id), &chunk);

        match chunk {
            AgentChunk::RunStarted { run_id } => {
                self.registry.set_run_id(ticket, run_id)?;
                Ok(Step::Continue)
            }
            AgentChunk::ToolCallApproval(request) => self.gate(ticket, request).await,
            _ => Ok(Step::Continue),
        }
    }

    async fn gate(&self, ticket: &DrainTicket, request: ApprovalRequestChunk) -> Result<Step, ClientError> {
        let session_id = &ticket.session_id;
        let context = self
            .registry
            .context(session_id)
            .ok_or_else(|| ClientError::Superseded(session_id.clone()))?;

        match decide(context.permission_mode, &request.tool_name) {
            GateDecision::AutoApprove => {
                let run_id = self
                    .registry
                    .run_id(session_id)
                    .ok_or_else(|| ClientError::MissingRunId(session_id.clone()))?;
                self.registry.auto_approve(ticket)?;
                log::info!(
                    "Auto-approving {} ({}) for session {} under {}",
                    request.tool_name,
                    request.approval_id,
                    session_id,
                    context.permission_mode
                );
                self.event_bus.emit(
                    &topics::client_auto_approved(session_id),
                    &json!({
                        "approvalId": request.approval_id,
                        "toolName": request.tool_name,
                    }),
                );

                let resumed = self
                    .resumer
                    .resume(ResumeCall {
                        run_id,
                        approval_id: Some(request.approval_id),
                        approved: true,
                        context,
                    })
                    .await?;
                Ok(Step::Switch(resumed))
            }
            GateDecision::AwaitHuman => {
                let approval_id = request.approval_id.clone();
                let payload = json!({
                    "approvalId": request.approval_id,
                    "toolName": request.tool_name,
                    "runId": self.registry.run_id(session_id),
                });
                self.registry.suspend(ticket, request)?;
                log::info!(
                    "Session {} suspended on approval {}",
                    session_id,
                    approval_id
                );
                self.event_bus
                    .emit(&topics::client_suspended(session_id), &payload);
                Ok(Step::Stop(DrainOutcome::Suspended { approval_id }))
            }
        }
    }

    fn complete(&self, ticket: &DrainTicket) -> DrainOutcome {
        match self.registry.finish(ticket) {
            Ok(()) => {
                self.event_bus
                    .emit(&topics::client_done(&ticket.session_id), &json!({}));
                DrainOutcome::Done
            }
            Err(ClientError::Superseded(_)) => DrainOutcome::Superseded,
            Err(err) => self.fail(ticket, err),
        }
    }

    /// Report a failure for the drain owning `ticket`.
    pub(super) fn fail(&self, ticket: &DrainTicket, err: ClientError) -> DrainOutcome {
        if !self.registry.fail(ticket) {
            return DrainOutcome::Superseded;
        }
        let message = err.to_string();
        log::error!("Drain for session {} failed: {}", ticket.session_id, message);
        self.event_bus.emit(
            &topics::client_error(&ticket.session_id),
            &json!({ "message": message }),
        );
        DrainOutcome::Failed { message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::WorkerError;
    use crate::approval::PermissionMode;
    use crate::event_bus::BroadcastEvent;
    use crate::test_support::{chunk_stream, ScriptedResumer};
    use tokio::sync::broadcast;

    fn run_started(run_id: &str) -> AgentChunk {
        AgentChunk::RunStarted {
            run_id: run_id.to_string(),
        }
    }

    fn text(delta: &str) -> AgentChunk {
        AgentChunk::TextDelta {
            delta: delta.to_string(),
        }
    }

    fn approval(approval_id: &str, tool_name: &str) -> AgentChunk {
        AgentChunk::ToolCallApproval(ApprovalRequestChunk {
            approval_id: approval_id.to_string(),
            tool_call_id: None,
            tool_name: tool_name.to_string(),
            input: serde_json::Value::Null,
        })
    }

    fn context(mode: PermissionMode) -> ClientSessionContext {
        ClientSessionContext::new("/repo", "model-1", mode).with_entry("origin", "cli")
    }

    fn setup(resumer: Arc<ScriptedResumer>) -> (DrainLoop, broadcast::Receiver<BroadcastEvent>) {
        let bus = Arc::new(EventBus::new());
        let rx = bus.subscribe();
        (
            DrainLoop::new(Arc::new(SessionRegistry::new()), resumer, bus),
            rx,
        )
    }

    fn topics_seen(rx: &mut broadcast::Receiver<BroadcastEvent>) -> Vec<String> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event.event_type);
        }
        seen
    }

    mod completion {
        use super::*;

        #[tokio::test]
        async fn exhausted_stream_emits_done_once_and_clears_entry() {
            let (drain, mut rx) = setup(Arc::new(ScriptedResumer::default()));
            let id = SessionId::from("s1");

            let outcome = drain
                .start(
                    &id,
                    context(PermissionMode::Default),
                    None,
                    chunk_stream(vec![run_started("run-1"), text("hi"), AgentChunk::Finish]),
                )
                .await;

            assert_eq!(outcome, DrainOutcome::Done);
            assert!(drain.registry().is_empty());
            let seen = topics_seen(&mut rx);
            assert_eq!(seen.iter().filter(|t| *t == "client:chunk:s1").count(), 3);
            assert_eq!(seen.iter().filter(|t| *t == "client:done:s1").count(), 1);
        }

        #[tokio::test]
        async fn stream_error_fails_drain() {
            let (drain, mut rx) = setup(Arc::new(ScriptedResumer::default()));
            let id = SessionId::from("s1");
            let stream = futures::stream::iter(vec![
                Ok(run_started("run-1")),
                Err(WorkerError::Stream("connection reset".to_string())),
            ])
            .boxed();

            let outcome = drain
                .start(&id, context(PermissionMode::Default), None, stream)
                .await;

            assert!(matches!(outcome, DrainOutcome::Failed { .. }));
            assert!(drain.registry().is_empty());
            assert!(topics_seen(&mut rx).contains(&"client:error:s1".to_string()));
        }
    }

    mod gating {
        use super::*;

        #[tokio::test]
        async fn accept_edits_auto_approves_edit_tools() {
            let resumer = Arc::new(ScriptedResumer::new(vec![vec![
                text("edited"),
                AgentChunk::Finish,
            ]]));
            let (drain, mut rx) = setup(Arc::clone(&resumer));
            let id = SessionId::from("s1");

            let outcome = drain
                .start(
                    &id,
                    context(PermissionMode::AcceptEdits),
                    None,
                    chunk_stream(vec![run_started("run-1"), approval("approval-1", "write_file")]),
                )
                .await;

            assert_eq!(outcome, DrainOutcome::Done);
            let calls = resumer.calls();
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].run_id, "run-1");
            assert_eq!(calls[0].approval_id.as_deref(), Some("approval-1"));
            assert!(calls[0].approved);
            assert_eq!(calls[0].context, context(PermissionMode::AcceptEdits));

            let seen = topics_seen(&mut rx);
            assert!(seen.contains(&"client:auto-approved:s1".to_string()));
            assert!(!seen.contains(&"client:suspended:s1".to_string()));
            assert_eq!(seen.iter().filter(|t| *t == "client:done:s1").count(), 1);
        }

        #[tokio::test]
        async fn accept_edits_suspends_on_other_tools() {
            let resumer = Arc::new(ScriptedResumer::default());
            let (drain, _rx) = setup(Arc::clone(&resumer));
            let id = SessionId::from("s1");

            let outcome = drain
                .start(
                    &id,
                    context(PermissionMode::AcceptEdits),
                    None,
                    chunk_stream(vec![run_started("run-1"), approval("approval-1", "Bash")]),
                )
                .await;

            assert_eq!(
                outcome,
                DrainOutcome::Suspended {
                    approval_id: "approval-1".to_string()
                }
            );
            assert!(resumer.calls().is_empty());
        }

        #[tokio::test]
        async fn bypass_chains_multiple_auto_approvals() {
            let resumer = Arc::new(ScriptedResumer::new(vec![
                vec![approval("approval-2", "Bash")],
                vec![text("done"), AgentChunk::Finish],
            ]));
            let (drain, mut rx) = setup(Arc::clone(&resumer));
            let id = SessionId::from("s1");

            let outcome = drain
                .start(
                    &id,
                    context(PermissionMode::BypassPermissions),
                    Some("run-1".to_string()),
                    chunk_stream(vec![approval("approval-1", "Bash")]),
                )
                .await;

            assert_eq!(outcome, DrainOutcome::Done);
            let approvals: Vec<_> = resumer
                .calls()
                .into_iter()
                .filter_map(|c| c.approval_id)
                .collect();
            assert_eq!(approvals, vec!["approval-1", "approval-2"]);
            let seen = topics_seen(&mut rx);
            assert_eq!(seen.iter().filter(|t| *t == "client:done:s1").count(), 1);
        }

        #[tokio::test]
        async fn default_mode_suspends_and_keeps_entry() {
            let (drain, mut rx) = setup(Arc::new(ScriptedResumer::default()));
            let id = SessionId::from("s1");

            let outcome = drain
                .start(
                    &id,
                    context(PermissionMode::Default),
                    None,
                    chunk_stream(vec![
                        run_started("run-1"),
                        approval("approval-1", "write_file"),
                        text("never consumed"),
                    ]),
                )
                .await;

            assert!(matches!(outcome, DrainOutcome::Suspended { .. }));
            assert!(drain.registry().is_suspended(&id));
            assert_eq!(drain.registry().run_id(&id).as_deref(), Some("run-1"));

            let seen = topics_seen(&mut rx);
            assert!(seen.contains(&"client:suspended:s1".to_string()));
            assert!(!seen.contains(&"client:done:s1".to_string()));
            // run-started and the approval request; nothing after suspension.
            assert_eq!(seen.iter().filter(|t| *t == "client:chunk:s1").count(), 2);
        }

        #[tokio::test]
        async fn auto_approve_without_run_id_fails() {
            let (drain, mut rx) = setup(Arc::new(ScriptedResumer::default()));
            let id = SessionId::from("s1");

            let outcome = drain
                .start(
                    &id,
                    context(PermissionMode::BypassPermissions),
                    None,
                    chunk_stream(vec![approval("approval-1", "Bash")]),
                )
                .await;

            assert!(matches!(outcome, DrainOutcome::Failed { .. }));
            assert!(topics_seen(&mut rx).contains(&"client:error:s1".to_string()));
        }

        #[tokio::test]
        async fn failed_auto_resume_fails_drain() {
            let (drain, _rx) = setup(Arc::new(ScriptedResumer::failing()));
            let id = SessionId::from("s1");

            let outcome = drain
                .start(
                    &id,
                    context(PermissionMode::BypassPermissions),
                    Some("run-1".to_string()),
                    chunk_stream(vec![approval("approval-1", "Bash")]),
                )
                .await;

            assert!(matches!(outcome, DrainOutcome::Failed { .. }));
            assert!(drain.registry().is_empty());
        }
    }

    mod supersede {
        use super::*;

        #[tokio::test]
        async fn old_drain_stops_silently_when_replaced() {
            let (drain, mut rx) = setup(Arc::new(ScriptedResumer::default()));
            let id = SessionId::from("s1");

            let old = drain
                .registry
                .begin(&id, context(PermissionMode::Default), None)
                .unwrap();
            drain
                .registry
                .begin(&id, context(PermissionMode::Default), None)
                .unwrap();

            let outcome = drain
                .drain(old, chunk_stream(vec![text("late"), AgentChunk::Finish]))
                .await;

            assert_eq!(outcome, DrainOutcome::Superseded);
            assert_eq!(drain.registry().len(), 1);
            assert!(topics_seen(&mut rx).is_empty());
        }
    }
}
