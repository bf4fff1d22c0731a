//! Agent workers as seen from the relay.
//!
//! Workers are external processes reachable over HTTP. The relay only knows
//! how to reach them ([`AgentRegistration`]), how to invoke them
//! ([`AgentInvoker`]), and the shape of what they stream back ([`AgentChunk`]).

pub mod chunk;
pub mod worker;

use serde::{Deserialize, Serialize};

pub use chunk::{AgentChunk, ApprovalRequestChunk, ChunkStream};
pub use worker::{
    AgentInvoker, HistoryMessage, HttpAgentWorker, HttpRunResumer, InvocationRequest, MessageRole,
    ResumeCall, RunResumer, WorkerError,
};

/// What causes the relay to invoke an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentTrigger {
    UserInput,
    Regenerate,
}

/// How the relay reaches a worker and how to invoke it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRegistration {
    pub id: String,

    /// Base URL of the worker (e.g. `http://127.0.0.1:7001/agent`).
    pub endpoint: String,

    /// Triggers this agent responds to. Empty means all of them.
    #[serde(default)]
    pub triggers: Vec<AgentTrigger>,

    /// JSON object merged into every invocation body.
    #[serde(default)]
    pub body_template: serde_json::Value,
}

impl AgentRegistration {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            triggers: Vec::new(),
            body_template: serde_json::Value::Null,
        }
    }

    pub fn with_triggers(mut self, triggers: Vec<AgentTrigger>) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn with_body_template(mut self, template: serde_json::Value) -> Self {
        self.body_template = template;
        self
    }

    /// Whether this agent should be invoked for `trigger`.
    pub fn handles(&self, trigger: AgentTrigger) -> bool {
        self.triggers.is_empty() || self.triggers.contains(&trigger)
    }

    /// Check the registration before it is accepted.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("agent id must not be empty".to_string());
        }
        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(format!(
                "agent endpoint must be an http(s) URL: {}",
                self.endpoint
            ));
        }
        if !(self.body_template.is_null() || self.body_template.is_object()) {
            return Err("bodyTemplate must be a JSON object".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_triggers_handle_everything() {
        let agent = AgentRegistration::new("a", "http://a");
        assert!(agent.handles(AgentTrigger::UserInput));
        assert!(agent.handles(AgentTrigger::Regenerate));
    }

    #[test]
    fn explicit_triggers_filter() {
        let agent =
            AgentRegistration::new("a", "http://a").with_triggers(vec![AgentTrigger::Regenerate]);
        assert!(!agent.handles(AgentTrigger::UserInput));
        assert!(agent.handles(AgentTrigger::Regenerate));
    }

    #[test]
    fn deserializes_camel_case_with_defaults() {
        let agent: AgentRegistration = serde_json::from_value(json!({
            "id": "worker-1",
            "endpoint": "http://localhost:7001",
            "bodyTemplate": {"model": "small"}
        }))
        .unwrap();

        assert_eq!(agent.id, "worker-1");
        assert!(agent.triggers.is_empty());
        assert_eq!(agent.body_template["model"], "small");
    }

    #[test]
    fn validate_rejects_bad_registrations() {
        assert!(AgentRegistration::new("", "http://a").validate().is_err());
        assert!(AgentRegistration::new("a", "ftp://a").validate().is_err());
        assert!(AgentRegistration::new("a", "http://a")
            .with_body_template(json!(["not", "an", "object"]))
            .validate()
            .is_err());
        assert!(AgentRegistration::new("a", "https://a")
            .with_body_template(json!({"k": 1}))
            .validate()
            .is_ok());
    }
}
