//! Resumes suspended drains when a decision lands in the session log.
//!
//! Approvals posted to the relay are appended to the log and broadcast on
//! `session:event:{id}`. The watcher turns each `approval_response` into a
//! [`ResumeRequest`] scoped to that approval id, so a decision for some other
//! approval leaves the session suspended.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use super::resume::{ResumeOutcome, ResumeRequest, ResumptionController};
use crate::event_bus::{topics, BroadcastEvent, EventBus};
use crate::session::SessionId;
use crate::stream::{Event, EventPayload};

pub struct DecisionWatcher {
    controller: ResumptionController,
    event_bus: Arc<EventBus>,
}

impl DecisionWatcher {
    pub fn new(controller: ResumptionController, event_bus: Arc<EventBus>) -> Self {
        Self {
            controller,
            event_bus,
        }
    }

    /// Subscribe now and watch on a background task until the bus closes.
    ///
    /// Each resume runs on its own task so a long drain does not hold up
    /// decisions for other sessions.
    pub fn spawn(self) -> JoinHandle<()> {
        let rx = self.event_bus.subscribe();
        tokio::spawn(self.run(rx))
    }

    async fn run(self, mut rx: broadcast::Receiver<BroadcastEvent>) {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(count)) => {
                    log::warn!("Decision watcher lagged by {} events", count);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let Some(request) = resume_request(&event) else {
                continue;
            };

            let controller = self.controller.clone();
            tokio::spawn(async move {
                let session_id = request.session_id.clone();
                match controller.resume_approved_stream(request).await {
                    ResumeOutcome::NotSuspended => {}
                    outcome => log::debug!("Decision for {} resumed: {:?}", session_id, outcome),
                }
            });
        }
        log::debug!("Decision watcher stopped");
    }
}

/// The resume an `approval_response` log append asks for, if any.
fn resume_request(event: &BroadcastEvent) -> Option<ResumeRequest> {
    let ("session", "event", session_id) = topics::split(&event.event_type)? else {
        return None;
    };
    let logged: Event = serde_json::from_value(event.payload.clone()).ok()?;
    match logged.value {
        EventPayload::ApprovalResponse {
            approval_id,
            approved,
            ..
        } => Some(
            ResumeRequest::new(SessionId::from(session_id), approved).for_approval(approval_id),
        ),
        _ => None,
    }
}
