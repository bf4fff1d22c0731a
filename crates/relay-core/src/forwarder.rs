//! Delivery of persisted decisions to agent workers.
//!
//! Every attempt is a single POST bounded by a fixed timeout. There is no
//! retry here: the decision is already in the session log, so a lost delivery
//! is recoverable by the worker re-requesting the tool call.

use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;

use crate::agents::AgentRegistration;

/// How long a single forward may take before it is abandoned.
pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

/// Status reported for attempts that never got an HTTP response.
pub const STATUS_UNREACHABLE: u16 = 0;

const STATUS_NOT_FOUND: u16 = 404;

// ============================================================================
// Outcomes
// ============================================================================

/// Result of one forward attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    Delivered,
    /// HTTP-level failure, or `status == 0` for network errors and timeouts.
    Rejected { status: u16, status_text: String },
}

impl ForwardOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, ForwardOutcome::Delivered)
    }

    /// The worker no longer tracks the id the decision was addressed to.
    pub fn is_stale(&self) -> bool {
        self.status() == Some(STATUS_NOT_FOUND)
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ForwardOutcome::Delivered => None,
            ForwardOutcome::Rejected { status, .. } => Some(*status),
        }
    }

    fn unreachable(reason: impl Into<String>) -> Self {
        ForwardOutcome::Rejected {
            status: STATUS_UNREACHABLE,
            status_text: reason.into(),
        }
    }
}

/// Aggregate over every agent a decision was sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// No agents were registered.
    NoTargets,
    /// At least one agent accepted the decision.
    Delivered,
    /// Nobody accepted it, but at least one agent had already resolved it.
    Stale,
    Failed,
}

/// Collapse per-agent outcomes. Any success wins; a stale 404 beats a failure.
pub fn classify(outcomes: &[(String, ForwardOutcome)]) -> Delivery {
    if outcomes.is_empty() {
        Delivery::NoTargets
    } else if outcomes.iter().any(|(_, o)| o.is_ok()) {
        Delivery::Delivered
    } else if outcomes.iter().any(|(_, o)| o.is_stale()) {
        Delivery::Stale
    } else {
        Delivery::Failed
    }
}

// ============================================================================
// Forwarder
// ============================================================================

#[derive(Clone)]
pub struct Forwarder {
    http: ureq::Agent,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: ureq::AgentBuilder::new().timeout(timeout).build(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// POST `body` to `{base}{path}`.
    pub async fn forward(&self, base: &str, path: &str, body: &Value) -> ForwardOutcome {
        let url = join_url(base, path);
        let http = self.http.clone();
        let payload = body.clone();
        let request_url = url.clone();

        let attempt = tokio::task::spawn_blocking(move || {
            http.post(&request_url)
                .set("Content-Type", "application/json")
                .send_json(payload)
        });

        match tokio::time::timeout(self.timeout, attempt).await {
            Err(_) => {
                log::warn!("Forward to {} timed out after {:?}", url, self.timeout);
                ForwardOutcome::unreachable("timed out")
            }
            Ok(Err(join_err)) => {
                log::error!("Forward task to {} failed: {}", url, join_err);
                ForwardOutcome::unreachable(join_err.to_string())
            }
            Ok(Ok(Ok(_))) => ForwardOutcome::Delivered,
            Ok(Ok(Err(ureq::Error::Status(status, response)))) => ForwardOutcome::Rejected {
                status,
                status_text: response.status_text().to_string(),
            },
            Ok(Ok(Err(ureq::Error::Transport(transport)))) => {
                log::warn!("Forward to {} failed: {}", url, transport);
                ForwardOutcome::unreachable(transport.to_string())
            }
        }
    }

    /// Forward to every agent concurrently; each attempt has its own timeout.
    pub async fn forward_all(
        &self,
        agents: &[AgentRegistration],
        path: &str,
        body: &Value,
    ) -> Vec<(String, ForwardOutcome)> {
        let attempts = agents.iter().map(|agent| async move {
            let outcome = self.forward(&agent.endpoint, path, body).await;
            (agent.id.clone(), outcome)
        });
        join_all(attempts).await
    }
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new(DEFAULT_FORWARD_TIMEOUT)
    }
}

/// Ensure a relative path starts with exactly one `/`.
pub fn normalize_path(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

pub fn join_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), normalize_path(path))
}
