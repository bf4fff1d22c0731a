//! # relay-core
//!
//! Core protocol logic for the agent session relay.
//!
//! This crate is framework-agnostic and can be used by:
//! - The HTTP relay (via `relay-http`)
//! - A client process that drains agent runs
//!
//! ## Key Concepts
//!
//! - **Session log**: append-only, txid-ordered events per session
//! - **Decision**: an approval or answer, always logged before it is forwarded
//! - **Drain**: consuming one agent run until it finishes or suspends

pub mod agents;
pub mod approval;
pub mod client;
pub mod config;
pub mod event_bus;
pub mod forwarder;
pub mod logging;
pub mod session;
pub mod stream;

// Re-export commonly used types
pub use agents::{AgentChunk, AgentRegistration, AgentTrigger};
pub use approval::PermissionMode;
pub use config::RelayConfig;
pub use event_bus::EventBus;
pub use forwarder::Delivery;
pub use session::{SessionId, SessionProtocol};
pub use stream::{Event, EventPayload, SessionLog, StreamStore};
