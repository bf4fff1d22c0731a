//! SessionManager - registry of sessions and the agents attached to them.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::state::{Session, SessionId};
use crate::agents::AgentRegistration;

/// Tracks every session the relay has seen.
///
/// Sessions are created lazily on first access and never removed; the
/// registration list is best-effort fan-out, not a source of truth.
#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get a session, creating it if this is the first access.
    pub fn get_or_create(&self, session_id: &SessionId) -> Session {
        self.sessions()
            .entry(session_id.clone())
            .or_insert_with(|| Session::new(session_id.clone()))
            .clone()
    }

    /// Snapshot of the agents registered against a session.
    pub fn registered_agents(&self, session_id: &SessionId) -> Vec<AgentRegistration> {
        self.sessions()
            .get(session_id)
            .map(|s| s.agents().to_vec())
            .unwrap_or_default()
    }

    /// Register an agent and return the updated registration list.
    pub fn register_agent(
        &self,
        session_id: &SessionId,
        agent: AgentRegistration,
    ) -> Vec<AgentRegistration> {
        let mut sessions = self.sessions();
        let session = sessions
            .entry(session_id.clone())
            .or_insert_with(|| Session::new(session_id.clone()));
        session.register(agent);
        session.agents().to_vec()
    }

    /// Remove an agent. Returns whether it was registered.
    pub fn unregister_agent(&self, session_id: &SessionId, agent_id: &str) -> bool {
        self.sessions()
            .get_mut(session_id)
            .is_some_and(|s| s.unregister(agent_id))
    }

    /// List all known session IDs.
    pub fn list_sessions(&self) -> Vec<SessionId> {
        self.sessions().keys().cloned().collect()
    }
}
