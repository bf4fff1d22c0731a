//! Drain lifecycle state machine.
//!
//! ```text
//! idle --start--> draining --exhausted--> done
//!                  |    ^  \
//!        suspend   |    |   auto-approve (stays draining)
//!                  v    |
//!               suspended --resume--> draining
//!
//! draining | suspended --fail--> failed
//! ```

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainState {
    Idle,
    Draining,
    Suspended,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainInput {
    Start,
    AutoApprove,
    Suspend,
    Resume,
    Exhausted,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid drain transition: {input:?} while {from}")]
pub struct TransitionError {
    pub from: DrainState,
    pub input: DrainInput,
}

impl DrainState {
    pub fn apply(self, input: DrainInput) -> Result<DrainState, TransitionError> {
        use DrainInput::*;
        use DrainState::*;

        match (self, input) {
            (Idle, Start) => Ok(Draining),
            (Draining, AutoApprove) => Ok(Draining),
            (Draining, Suspend) => Ok(Suspended),
            (Suspended, Resume) => Ok(Draining),
            (Draining, Exhausted) => Ok(Done),
            (Draining | Suspended, Fail) => Ok(Failed),
            (from, input) => Err(TransitionError { from, input }),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DrainState::Done | DrainState::Failed)
    }
}

impl fmt::Display for DrainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DrainState::Idle => "idle",
            DrainState::Draining => "draining",
            DrainState::Suspended => "suspended",
            DrainState::Done => "done",
            DrainState::Failed => "failed",
        };
        f.write_str(s)
    }
}
