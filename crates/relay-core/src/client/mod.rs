//! Client side of the relay: draining agent runs and resuming them.
//!
//! One [`SessionRegistry`] entry exists per in-flight drain. [`DrainLoop`]
//! consumes a run and either finishes it, auto-approves gated tool calls, or
//! suspends; [`ResumptionController`] picks a suspended session back up once
//! a human decides, and [`DecisionWatcher`] calls it when that decision shows
//! up in the session log.

mod context;
mod decisions;
mod drain;
mod machine;
mod registry;
mod resume;

pub use context::ClientSessionContext;
pub use decisions::DecisionWatcher;
pub use drain::{DrainLoop, DrainOutcome};
pub use machine::{DrainInput, DrainState, TransitionError};
pub use registry::{DrainTicket, ResumeSnapshot, SessionRegistry};
pub use resume::{ResumeOutcome, ResumeRequest, ResumptionController};

use crate::agents::WorkerError;
use crate::session::SessionId;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("drain for session {0} was superseded")]
    Superseded(SessionId),

    #[error("no run id recorded for session {0}")]
    MissingRunId(SessionId),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}
