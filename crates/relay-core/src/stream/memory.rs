//! In-memory stream store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Event, NewEvent, StreamResult, StreamStore, Txid};
use crate::session::SessionId;

#[derive(Debug, Default)]
struct MemoryState {
    last_txid: Txid,
    streams: HashMap<SessionId, Vec<Event>>,
}

impl MemoryState {
    fn allocate_txid(&mut self) -> Txid {
        self.last_txid += 1;
        self.last_txid
    }
}

/// Process-local store. Cloning shares the same underlying streams.
#[derive(Clone, Debug, Default)]
pub struct MemoryStreamStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of sessions with a stream.
    pub fn stream_count(&self) -> usize {
        self.state().streams.len()
    }
}

#[async_trait::async_trait]
impl StreamStore for MemoryStreamStore {
    async fn ensure_stream(&self, session_id: &SessionId) -> StreamResult<()> {
        self.state().streams.entry(session_id.clone()).or_default();
        Ok(())
    }

    async fn append(&self, session_id: &SessionId, event: NewEvent) -> StreamResult<Event> {
        let mut state = self.state();

        if let Some(existing) = state
            .streams
            .get(session_id)
            .and_then(|events| events.iter().find(|e| e.key == event.key))
        {
            return Ok(existing.clone());
        }

        let txid = state.allocate_txid();
        let committed = event.commit(txid);
        state
            .streams
            .entry(session_id.clone())
            .or_default()
            .push(committed.clone());

        Ok(committed)
    }

    async fn read(&self, session_id: &SessionId, after: Option<Txid>) -> StreamResult<Vec<Event>> {
        let state = self.state();
        let Some(events) = state.streams.get(session_id) else {
            return Ok(Vec::new());
        };

        Ok(events
            .iter()
            .filter(|e| after.map_or(true, |offset| e.txid > offset))
            .cloned()
            .collect())
    }
}
