//! Per-session state.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agents::AgentRegistration;

/// Opaque session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Relay-side view of a session: the agents currently registered against it.
///
/// The log itself lives in the stream store; this only tracks where
/// decisions can be relayed to.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,

    /// Registered agents in registration order.
    agents: Vec<AgentRegistration>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            agents: Vec::new(),
        }
    }

    pub fn agents(&self) -> &[AgentRegistration] {
        &self.agents
    }

    /// Add an agent, replacing an earlier registration with the same id in place.
    pub fn register(&mut self, agent: AgentRegistration) {
        match self.agents.iter_mut().find(|a| a.id == agent.id) {
            Some(existing) => *existing = agent,
            None => self.agents.push(agent),
        }
    }

    /// Remove an agent. Returns whether it was registered.
    pub fn unregister(&mut self, agent_id: &str) -> bool {
        let before = self.agents.len();
        self.agents.retain(|a| a.id != agent_id);
        self.agents.len() != before
    }
}
