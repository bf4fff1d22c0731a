//! Relay-side sessions.
//!
//! A session is a durable log plus the set of agent workers currently
//! registered against it. [`SessionProtocol`] is the entry point the HTTP
//! routes drive.

mod manager;
mod protocol;
mod state;

pub use manager::SessionManager;
pub use protocol::{ProtocolError, RunSummary, SessionProtocol};
pub use state::{Session, SessionId};
