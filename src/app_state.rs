//! Process-wide Tauri-managed state: the resolved engine configuration, the
//! integrity verdict computed once at startup, the currently selected base
//! folder, and the slots `export-diagnostics` reads from (spec §6 "Persisted
//! state", §4.2, §4.10).

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::Value;

use crate::core::executor::CancelToken;
use crate::core::integrity::IntegrityState;
use crate::core::logger::{JsonlLogger, Logger};
use crate::core::settings::EngineSettings;
use crate::core::domain::Preset;

/// Caps the in-memory tail kept for `export-diagnostics`; the bundle itself
/// re-caps to 200 on export (spec §6 "Persisted state").
const EVENT_RING_CAPACITY: usize = 256;

/// Decorates a [`JsonlLogger`] with an in-memory ring buffer so
/// `export-diagnostics` can read the recent event tail without re-parsing
/// the JSONL file off disk.
pub struct EventLogger {
    inner: JsonlLogger,
    ring: Mutex<VecDeque<Value>>,
}

impl EventLogger {
    pub fn new(inner: JsonlLogger) -> Self {
        Self {
            inner,
            ring: Mutex::new(VecDeque::with_capacity(EVENT_RING_CAPACITY)),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        self.inner.path()
    }

    /// Snapshot of the buffered events, oldest first.
    pub fn tail_snapshot(&self) -> Vec<Value> {
        self.ring.lock().unwrap_or_else(|p| p.into_inner()).iter().cloned().collect()
    }
}

impl Logger for EventLogger {
    fn log(&self, event: &str, fields: Value) {
        let mut merged = serde_json::Map::new();
        merged.insert("event".into(), Value::String(event.to_string()));
        if let Value::Object(map) = fields.clone() {
            for (k, v) in map {
                merged.insert(k, v);
            }
        }
        let mut ring = self.ring.lock().unwrap_or_else(|p| p.into_inner());
        if ring.len() >= EVENT_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(Value::Object(merged));
        drop(ring);
        self.inner.log(event, fields);
    }
}

/// Everything a command handler needs in order to talk to the render engine,
/// managed once via `tauri::Builder::manage` at startup.
pub struct AppState {
    pub settings: EngineSettings,
    pub integrity: IntegrityState,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: Option<PathBuf>,
    pub presets: Vec<Preset>,
    pub selected_base: Mutex<Option<PathBuf>>,
    pub cancel: Mutex<CancelToken>,
    pub logger: std::sync::Arc<EventLogger>,
    pub app_log_dir: PathBuf,
    pub ledgers_dir: PathBuf,
    pub last_render_report: Mutex<Option<Value>>,
    pub progress_status_tail: Mutex<Value>,
    pub startup_partial_scan: Mutex<Value>,
    pub startup_job_recovery: Mutex<Value>,
    pub finalize_summary: Mutex<Value>,
    pub pid: u32,
    pub app_version: String,
}

impl AppState {
    /// Replaces the active job's cancellation token with a fresh one and
    /// returns a clone for the orchestrator to poll (a `CancelToken` latches
    /// its first cancel reason permanently, so every job needs its own).
    pub fn fresh_cancel_token(&self) -> CancelToken {
        let token = CancelToken::new();
        *self.cancel.lock().unwrap_or_else(|p| p.into_inner()) = token.clone();
        token
    }

    pub fn record_status(&self, phase: &str) {
        let mut guard = self.progress_status_tail.lock().unwrap_or_else(|p| p.into_inner());
        *guard = serde_json::json!({ "status": phase });
    }

    pub fn record_progress(&self, snapshot: &crate::core::progress::ProgressSnapshot) {
        let mut guard = self.progress_status_tail.lock().unwrap_or_else(|p| p.into_inner());
        let mut value = serde_json::to_value(snapshot).unwrap_or(Value::Null);
        if let Value::Object(map) = &mut value {
            if let Value::Object(prev) = &*guard {
                if let Some(status) = prev.get("status").cloned() {
                    map.insert("status".to_string(), status);
                }
            }
        }
        *guard = value;
    }
}
