//! Resumption of suspended drains after a human decision.

use serde_json::json;

use super::drain::{DrainLoop, DrainOutcome};
use super::registry::DrainTicket;
use super::ClientError;
use crate::agents::ResumeCall;
use crate::event_bus::topics;
use crate::session::SessionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeRequest {
    pub session_id: SessionId,
    /// Overrides the run id recorded for the session.
    pub run_id: Option<String>,
    pub approved: bool,
    /// Only resume if the session is parked on this approval.
    pub approval_id: Option<String>,
    /// Merged into the stored request context before resuming.
    pub extra_context: Vec<(String, String)>,
}

impl ResumeRequest {
    pub fn new(session_id: SessionId, approved: bool) -> Self {
        Self {
            session_id,
            run_id: None,
            approved,
            approval_id: None,
            extra_context: Vec::new(),
        }
    }

    pub fn for_approval(mut self, approval_id: impl Into<String>) -> Self {
        self.approval_id = Some(approval_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// Nothing to resume; the session was not suspended.
    NotSuspended,
    Drained(DrainOutcome),
    /// The resume call itself failed; `error` was emitted.
    Failed { message: String },
}

#[derive(Clone)]
pub struct ResumptionController {
    drain: DrainLoop,
}

impl ResumptionController {
    pub fn new(drain: DrainLoop) -> Self {
        Self { drain }
    }

    /// Resume a suspended session with an approve-or-decline decision and
    /// keep draining under the session's recorded permission mode.
    pub async fn resume_approved_stream(&self, request: ResumeRequest) -> ResumeOutcome {
        let registry = &self.drain.registry;
        let snapshot = match &request.approval_id {
            Some(approval_id) => {
                registry.resume_pending(&request.session_id, approval_id, request.extra_context)
            }
            None => registry.resume(&request.session_id, request.extra_context),
        };
        let Some(snapshot) = snapshot else {
            log::debug!(
                "Session {} is not suspended, ignoring resume",
                request.session_id
            );
            return ResumeOutcome::NotSuspended;
        };

        let ticket = snapshot.ticket;
        let Some(run_id) = request.run_id.or(snapshot.run_id) else {
            let err = ClientError::MissingRunId(ticket.session_id.clone());
            return self.failed(&ticket, err);
        };

        log::info!(
            "Resuming session {} run {} (approved: {})",
            ticket.session_id,
            run_id,
            request.approved
        );
        let call = ResumeCall {
            run_id,
            approval_id: snapshot.pending.map(|p| p.approval_id),
            approved: request.approved,
            context: snapshot.context,
        };

        match self.drain.resumer.resume(call).await {
            Ok(stream) => ResumeOutcome::Drained(self.drain.drain(ticket, stream).await),
            Err(err) => self.failed(&ticket, ClientError::Worker(err)),
        }
    }

    fn failed(&self, ticket: &DrainTicket, err: ClientError) -> ResumeOutcome {
        let message = err.to_string();
        log::error!("Resume of session {} failed: {}", ticket.session_id, message);
        if self.drain.registry.fail(ticket) {
            self.drain.event_bus.emit(
                &topics::client_error(&ticket.session_id),
                &json!({ "message": message }),
            );
        }
        ResumeOutcome::Failed { message }
    }
}
