//! JSONL-backed stream store.
//!
//! Stores each session as append-only JSON lines in `{dir}/{session_id}.jsonl`.
//! The last committed txid is recovered from disk on open so that txids keep
//! increasing across restarts. A line left torn by a crash is skipped on read
//! and cut off before the session's next append.

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Event, NewEvent, StreamError, StreamResult, StreamStore, Txid};
use crate::session::SessionId;

#[derive(Debug, Default)]
struct JsonlState {
    last_txid: Txid,
    /// Keys per session, loaded lazily on first touch.
    keys: HashMap<SessionId, HashSet<String>>,
}

#[derive(Debug)]
struct JsonlInner {
    dir: PathBuf,
    state: Mutex<JsonlState>,
}

/// Durable store writing one line per event.
///
/// File I/O runs on the blocking pool; the handle is cheap to clone.
#[derive(Debug, Clone)]
pub struct JsonlStreamStore {
    inner: Arc<JsonlInner>,
}

impl JsonlStreamStore {
    /// Open (or create) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> StreamResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut last_txid = 0;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if let Some(last) = load_events(&path)?.last() {
                last_txid = last_txid.max(last.txid);
            }
        }

        log::info!(
            "Opened JSONL stream store at {} (last txid {})",
            dir.display(),
            last_txid
        );

        Ok(Self {
            inner: Arc::new(JsonlInner {
                dir,
                state: Mutex::new(JsonlState {
                    last_txid,
                    keys: HashMap::new(),
                }),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    async fn blocking<T, F>(&self, op: F) -> StreamResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&JsonlInner) -> StreamResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| StreamError::Backend(format!("store task failed: {e}")))?
    }
}

impl JsonlInner {
    fn state(&self) -> MutexGuard<'_, JsonlState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stream_path(&self, session_id: &SessionId) -> StreamResult<PathBuf> {
        validate_path_component(session_id.as_str())?;
        Ok(self.dir.join(format!("{}.jsonl", session_id.as_str())))
    }

    fn ensure_stream(&self, session_id: &SessionId) -> StreamResult<()> {
        let path = self.stream_path(session_id)?;
        let _guard = self.state();
        OpenOptions::new().create(true).append(true).open(path)?;
        Ok(())
    }

    fn append(&self, session_id: &SessionId, event: NewEvent) -> StreamResult<Event> {
        let path = self.stream_path(session_id)?;
        let mut state = self.state();

        if !state.keys.contains_key(session_id) {
            truncate_torn_tail(&path)?;
            let keys = load_events(&path)?.into_iter().map(|e| e.key).collect();
            state.keys.insert(session_id.clone(), keys);
        }

        let seen = state
            .keys
            .get(session_id)
            .is_some_and(|keys| keys.contains(&event.key));
        if seen {
            return load_events(&path)?
                .into_iter()
                .find(|e| e.key == event.key)
                .ok_or_else(|| {
                    StreamError::Backend(format!("key {} indexed but not on disk", event.key))
                });
        }

        let committed = event.commit(state.last_txid + 1);
        let mut line = serde_json::to_string(&committed)?;
        line.push('\n');
        append_line(&path, line.as_bytes())?;

        // Only advance once the line is on disk.
        state.last_txid = committed.txid;
        if let Some(keys) = state.keys.get_mut(session_id) {
            keys.insert(committed.key.clone());
        }

        Ok(committed)
    }

    fn read(&self, session_id: &SessionId, after: Option<Txid>) -> StreamResult<Vec<Event>> {
        let path = self.stream_path(session_id)?;
        let _guard = self.state();
        let events = load_events(&path)?;
        Ok(events
            .into_iter()
            .filter(|e| after.map_or(true, |offset| e.txid > offset))
            .collect())
    }
}

/// Session ids become file names, so reject anything that is not a single
/// normal path component.
fn validate_path_component(component: &str) -> StreamResult<()> {
    if component.is_empty() {
        return Err(StreamError::InvalidSession("empty session id".to_string()));
    }

    let mut components = Path::new(component).components();
    match components.next() {
        Some(Component::Normal(_)) if components.next().is_none() => Ok(()),
        _ => Err(StreamError::InvalidSession(component.to_string())),
    }
}

fn read_file(path: &Path) -> StreamResult<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Parse every readable line. Unreadable lines are logged and skipped.
fn load_events(path: &Path) -> StreamResult<Vec<Event>> {
    let bytes = read_file(path)?;
    let mut events = Vec::new();
    for (index, line) in bytes.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<Event>(line) {
            Ok(event) => events.push(event),
            Err(err) => log::warn!(
                "Skipping unreadable line {} in {}: {}",
                index + 1,
                path.display(),
                err
            ),
        }
    }
    Ok(events)
}

/// Cut off bytes after the last newline, left behind by an interrupted write.
fn truncate_torn_tail(path: &Path) -> StreamResult<()> {
    let bytes = read_file(path)?;
    if bytes.is_empty() || bytes.ends_with(b"\n") {
        return Ok(());
    }
    let keep = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |newline| newline + 1);
    log::warn!(
        "Truncating {} torn bytes at the end of {}",
        bytes.len() - keep,
        path.display()
    );
    OpenOptions::new()
        .write(true)
        .open(path)?
        .set_len(keep as u64)?;
    Ok(())
}

/// Append `line`, restoring the previous length if the write fails part way.
fn append_line(path: &Path, line: &[u8]) -> StreamResult<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let len = file.metadata()?.len();
    if let Err(err) = file.write_all(line).and_then(|()| file.flush()) {
        if let Err(rollback) = file.set_len(len) {
            log::error!("Failed to roll back {}: {}", path.display(), rollback);
        }
        return Err(err.into());
    }
    Ok(())
}

#[async_trait::async_trait]
impl StreamStore for JsonlStreamStore {
    async fn ensure_stream(&self, session_id: &SessionId) -> StreamResult<()> {
        let session_id = session_id.clone();
        self.blocking(move |inner| inner.ensure_stream(&session_id))
            .await
    }

    async fn append(&self, session_id: &SessionId, event: NewEvent) -> StreamResult<Event> {
        let session_id = session_id.clone();
        self.blocking(move |inner| inner.append(&session_id, event))
            .await
    }

    async fn read(&self, session_id: &SessionId, after: Option<Txid>) -> StreamResult<Vec<Event>> {
        let session_id = session_id.clone();
        self.blocking(move |inner| inner.read(&session_id, after))
            .await
    }
}
