//! Shared state for the HTTP server.

use std::sync::Arc;

use relay_core::event_bus::EventBus;
use relay_core::SessionProtocol;

/// Shared state available to all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub protocol: Arc<SessionProtocol>,
}

impl AppState {
    pub fn new(protocol: Arc<SessionProtocol>) -> Self {
        Self { protocol }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        self.protocol.event_bus()
    }
}
