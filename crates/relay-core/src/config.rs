//! Runtime settings shared by the relay components.

use std::path::PathBuf;
use std::time::Duration;

use crate::agents::worker::DEFAULT_CONNECT_TIMEOUT;
use crate::event_bus::DEFAULT_CAPACITY;
use crate::forwarder::DEFAULT_FORWARD_TIMEOUT;

#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    /// Upper bound for a single decision forward.
    pub forward_timeout: Duration,
    /// Connect timeout for agent invocations and resumes.
    pub invoke_connect_timeout: Duration,
    /// Where per-session trace files go. `None` disables tracing.
    pub trace_dir: Option<PathBuf>,
    pub event_bus_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            forward_timeout: DEFAULT_FORWARD_TIMEOUT,
            invoke_connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            trace_dir: None,
            event_bus_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl RelayConfig {
    pub fn with_forward_timeout(mut self, timeout: Duration) -> Self {
        self.forward_timeout = timeout;
        self
    }

    pub fn with_trace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trace_dir = Some(dir.into());
        self
    }
}
