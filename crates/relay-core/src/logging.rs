//! Per-session trace files.
//!
//! Every outbound forward and its outcome is appended to
//! `{trace_dir}/{session_id}.log` as `[timestamp] DIRECTION: data`. Tracing is
//! optional; without a directory all writes are no-ops. Files are opened per
//! line, so nothing stays open for sessions that have gone quiet.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chrono::{SecondsFormat, Utc};

use crate::session::SessionId;

/// Thread-safe handle to an append-only log file.
pub type LogHandle = Arc<Mutex<Option<File>>>;

/// Current UTC time as RFC 3339 with milliseconds (e.g. 2026-02-04T10:15:30.123Z).
fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Write a timestamped line to the log file (if present).
pub fn log_line(handle: &LogHandle, direction: &str, data: &str) {
    if let Ok(mut guard) = handle.lock() {
        if let Some(ref mut file) = *guard {
            let _ = writeln!(file, "[{}] {}: {}", utc_timestamp(), direction, data);
            let _ = file.flush();
        }
    }
}

/// Open (or create) `{log_dir}/{log_id}.log` and return a shared handle.
pub fn open_log_file(log_dir: Option<&Path>, log_id: &str) -> LogHandle {
    let file = log_dir.and_then(|dir| {
        std::fs::create_dir_all(dir).ok()?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{}.log", log_id)))
            .ok()
    });
    Arc::new(Mutex::new(file))
}

/// Trace files, one per session.
#[derive(Default)]
pub struct TraceLog {
    dir: Option<PathBuf>,
    /// Serializes writers so lines never interleave.
    write_lock: Mutex<()>,
}

impl TraceLog {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            write_lock: Mutex::new(()),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    pub fn line(&self, session_id: &SessionId, direction: &str, data: &str) {
        let Some(dir) = self.dir.as_deref() else {
            return;
        };
        // Session ids become file names.
        if session_id.as_str().contains(['/', '\\']) || session_id.as_str().starts_with('.') {
            return;
        }

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        log_line(&open_log_file(Some(dir), session_id.as_str()), direction, data);
    }
}
