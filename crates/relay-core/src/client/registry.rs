//! Per-session client state, one entry per in-flight drain.
//!
//! An entry is created when a drain starts and removed when it finishes or
//! fails. Starting a new drain for a session replaces the entry and bumps its
//! generation, which invalidates the [`DrainTicket`] held by any older drain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::context::ClientSessionContext;
use super::machine::{DrainInput, DrainState};
use super::ClientError;
use crate::agents::ApprovalRequestChunk;
use crate::session::SessionId;

/// Proof that a drain still owns its session's entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainTicket {
    pub session_id: SessionId,
    pub generation: u64,
}

struct ClientSession {
    generation: u64,
    context: ClientSessionContext,
    run_id: Option<String>,
    state: DrainState,
    pending: Option<ApprovalRequestChunk>,
}

/// State handed to the resumption controller when a suspended session resumes.
#[derive(Debug, Clone)]
pub struct ResumeSnapshot {
    pub ticket: DrainTicket,
    pub context: ClientSessionContext,
    pub run_id: Option<String>,
    pub pending: Option<ApprovalRequestChunk>,
}

#[derive(Default)]
pub struct SessionRegistry {
    entries: Mutex<HashMap<SessionId, ClientSession>>,
    next_generation: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<SessionId, ClientSession>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Entry owned by `ticket`, or `Superseded` if a newer drain took over.
    fn owned<'a>(
        entries: &'a mut HashMap<SessionId, ClientSession>,
        ticket: &DrainTicket,
    ) -> Result<&'a mut ClientSession, ClientError> {
        entries
            .get_mut(&ticket.session_id)
            .filter(|entry| entry.generation == ticket.generation)
            .ok_or_else(|| ClientError::Superseded(ticket.session_id.clone()))
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Start a drain, replacing whatever the session had before.
    pub fn begin(
        &self,
        session_id: &SessionId,
        context: ClientSessionContext,
        run_id: Option<String>,
    ) -> Result<DrainTicket, ClientError> {
        let state = DrainState::Idle.apply(DrainInput::Start)?;
        let generation = self.next_generation();
        let previous = self.entries().insert(
            session_id.clone(),
            ClientSession {
                generation,
                context,
                run_id,
                state,
                pending: None,
            },
        );
        if let Some(previous) = previous {
            log::info!(
                "New drain for session {} replaces one that was {}",
                session_id,
                previous.state
            );
        }

        Ok(DrainTicket {
            session_id: session_id.clone(),
            generation,
        })
    }

    pub fn is_current(&self, ticket: &DrainTicket) -> bool {
        self.entries()
            .get(&ticket.session_id)
            .is_some_and(|entry| entry.generation == ticket.generation)
    }

    pub fn context(&self, session_id: &SessionId) -> Option<ClientSessionContext> {
        self.entries()
            .get(session_id)
            .map(|entry| entry.context.clone())
    }

    pub fn run_id(&self, session_id: &SessionId) -> Option<String> {
        self.entries()
            .get(session_id)
            .and_then(|entry| entry.run_id.clone())
    }

    pub fn state(&self, session_id: &SessionId) -> Option<DrainState> {
        self.entries().get(session_id).map(|entry| entry.state)
    }

    pub fn is_suspended(&self, session_id: &SessionId) -> bool {
        self.state(session_id) == Some(DrainState::Suspended)
    }

    pub fn set_run_id(&self, ticket: &DrainTicket, run_id: String) -> Result<(), ClientError> {
        let mut entries = self.entries();
        Self::owned(&mut entries, ticket)?.run_id = Some(run_id);
        Ok(())
    }

    pub fn auto_approve(&self, ticket: &DrainTicket) -> Result<(), ClientError> {
        let mut entries = self.entries();
        let entry = Self::owned(&mut entries, ticket)?;
        entry.state = entry.state.apply(DrainInput::AutoApprove)?;
        Ok(())
    }

    /// Park the drain on a pending approval.
    pub fn suspend(
        &self,
        ticket: &DrainTicket,
        request: ApprovalRequestChunk,
    ) -> Result<(), ClientError> {
        let mut entries = self.entries();
        let entry = Self::owned(&mut entries, ticket)?;
        entry.state = entry.state.apply(DrainInput::Suspend)?;
        entry.pending = Some(request);
        Ok(())
    }

    /// Take a suspended session back into draining.
    ///
    /// Returns `None` when the session is not suspended, which makes a
    /// duplicate resume a no-op. Extra context entries are merged into the
    /// stored context before the snapshot is taken.
    pub fn resume(
        &self,
        session_id: &SessionId,
        extra_context: Vec<(String, String)>,
    ) -> Option<ResumeSnapshot> {
        self.resume_matching(session_id, None, extra_context)
    }

    /// Like [`resume`](Self::resume), but only when the session is parked on
    /// `approval_id`. A decision for any other approval leaves it suspended.
    pub fn resume_pending(
        &self,
        session_id: &SessionId,
        approval_id: &str,
        extra_context: Vec<(String, String)>,
    ) -> Option<ResumeSnapshot> {
        self.resume_matching(session_id, Some(approval_id), extra_context)
    }

    /// Approval id the session is suspended on, if any.
    pub fn pending_approval(&self, session_id: &SessionId) -> Option<String> {
        self.entries()
            .get(session_id)
            .filter(|entry| entry.state == DrainState::Suspended)
            .and_then(|entry| entry.pending.as_ref())
            .map(|pending| pending.approval_id.clone())
    }

    fn resume_matching(
        &self,
        session_id: &SessionId,
        approval_id: Option<&str>,
        extra_context: Vec<(String, String)>,
    ) -> Option<ResumeSnapshot> {
        let generation = self.next_generation();
        let mut entries = self.entries();
        let entry = entries.get_mut(session_id)?;
        if let Some(expected) = approval_id {
            if entry.pending.as_ref().map(|p| p.approval_id.as_str()) != Some(expected) {
                return None;
            }
        }
        entry.state = entry.state.apply(DrainInput::Resume).ok()?;
        entry.generation = generation;
        entry.context.merge(extra_context);

        Some(ResumeSnapshot {
            ticket: DrainTicket {
                session_id: session_id.clone(),
                generation,
            },
            context: entry.context.clone(),
            run_id: entry.run_id.clone(),
            pending: entry.pending.take(),
        })
    }

    /// Complete the drain and drop its entry.
    ///
    /// Fails with `Superseded` if the ticket no longer owns the entry, in
    /// which case the caller must not report completion.
    pub fn finish(&self, ticket: &DrainTicket) -> Result<(), ClientError> {
        let mut entries = self.entries();
        let entry = Self::owned(&mut entries, ticket)?;
        entry.state.apply(DrainInput::Exhausted)?;
        entries.remove(&ticket.session_id);
        Ok(())
    }

    /// Abort the drain and drop its entry. Returns whether the ticket owned it.
    pub fn fail(&self, ticket: &DrainTicket) -> bool {
        let mut entries = self.entries();
        let owned = match Self::owned(&mut entries, ticket) {
            Ok(entry) => {
                if let Err(err) = entry.state.apply(DrainInput::Fail) {
                    log::debug!("{} for session {}", err, ticket.session_id);
                }
                true
            }
            Err(_) => false,
        };
        if owned {
            entries.remove(&ticket.session_id);
        }
        owned
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
