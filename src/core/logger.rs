//! Structured JSON-Lines event logger (spec §6, §9 "Logger").
//!
//! The teacher codebase writes its own crash-recovery sidecar with
//! `serde_json::to_writer` + atomic rename (`engine::state_persist`) rather
//! than reaching for a logging crate; the mandatory structured event stream
//! here follows that same direct idiom, because the JSONL schema is a
//! first-class, closed-name-set feature rather than generic ambient logging.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;

/// Consumed by every component instead of a concrete writer, so unit tests
/// can swap in `NullLogger` without touching the filesystem.
pub trait Logger: Send + Sync {
    fn log(&self, event: &str, fields: Value);
}

/// Discards everything. Used in tests that don't assert on log output.
pub struct NullLogger;

impl Logger for NullLogger {
    fn log(&self, _event: &str, _fields: Value) {}
}

/// One physical writer per process: buffered, line-delimited JSON, flushed
/// after every write (render jobs are not a high-frequency logging path).
pub struct JsonlLogger {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlLogger {
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Logger for JsonlLogger {
    fn log(&self, event: &str, fields: Value) {
        let mut record = serde_json::Map::new();
        record.insert("event".into(), Value::String(event.to_string()));
        record.insert(
            "ts".into(),
            Value::String(chrono::Local::now().to_rfc3339()),
        );
        if let Value::Object(map) = fields {
            for (k, v) in map {
                record.insert(k, v);
            }
        }
        let line = match serde_json::to_string(&Value::Object(record)) {
            Ok(line) => line,
            Err(err) => {
                eprintln!("logger: failed to serialize event {event}: {err:#}");
                return;
            }
        };
        let mut guard = match self.file.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = writeln!(guard, "{line}") {
            eprintln!("logger: failed to write event {event}: {err:#}");
            return;
        }
        let _ = guard.flush();
    }
}

/// Session log file name: `session-<unix_ts>-<pid>.jsonl`.
pub fn session_log_path(dir: &Path, unix_ts: u64, pid: u32) -> PathBuf {
    dir.join(format!("session-{unix_ts}-{pid}.jsonl"))
}

/// Keep-latest rotation: retain `keep` newest session files, ordered by
/// `(mtime desc, name asc)` so repeated runs with identical mtimes (e.g. a
/// test harness that creates several files within the same clock tick) keep
/// a deterministic set (spec §8 invariant 8).
pub fn rotate_session_logs(dir: &Path, keep: usize) -> anyhow::Result<()> {
    let mut entries: Vec<(std::time::SystemTime, String, PathBuf)> = Vec::new();
    let read_dir = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for entry in read_dir {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with("session-") || !name.ends_with(".jsonl") {
            continue;
        }
        let mtime = entry.metadata()?.modified()?;
        entries.push((mtime, name, path));
    }
    entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    for (_, _, path) in entries.into_iter().skip(keep) {
        let _ = fs::remove_file(path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    #[test]
    fn jsonl_logger_appends_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session-1-1.jsonl");
        let logger = JsonlLogger::open(&path).unwrap();
        logger.log("app.ready", serde_json::json!({"version": "0.1.0"}));
        logger.log("engine.state", serde_json::json!({"to": "IDLE"}));
        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "app.ready");
    }

    #[test]
    fn rotation_keeps_newest_with_deterministic_tiebreak() {
        let dir = tempfile::tempdir().unwrap();
        let base = SystemTime::now();
        let names = ["session-1-100.jsonl", "session-2-100.jsonl", "session-3-100.jsonl"];
        for (i, name) in names.iter().enumerate() {
            let path = dir.path().join(name);
            fs::write(&path, "{}\n").unwrap();
            let mtime = base + Duration::from_secs(i as u64);
            let file = File::open(&path).unwrap();
            file.set_modified(mtime).unwrap();
        }
        // Force an equal-mtime tie between two files to exercise the name tiebreak.
        let tie_time = base + Duration::from_secs(10);
        for name in ["session-1-100.jsonl", "session-2-100.jsonl"] {
            let file = File::open(dir.path().join(name)).unwrap();
            file.set_modified(tie_time).unwrap();
        }

        rotate_session_logs(dir.path(), 2).unwrap();

        let mut remaining: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        remaining.sort();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&"session-3-100.jsonl".to_string()));
        assert!(remaining.contains(&"session-2-100.jsonl".to_string()));
    }
}
