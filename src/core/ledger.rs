//! C10: the job ledger brackets a render job across process restarts (spec
//! §4.10). Writes are atomic-replace (write to `<path>.tmp-<pid>-<ts>` then
//! rename, falling back to copy+unlink across devices); `recover_in_progress`
//! runs at startup and cleans up anything an earlier process left mid-job.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::core::domain::{JobLedgerRecord, LedgerState};
use crate::core::logger::Logger;
use crate::core::path_safety::is_within_base;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("failed to serialize job ledger: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("{0}")]
    Io(#[from] io::Error),
}

fn atomic_write(path: &Path, bytes: &[u8], pid: u32, now_unix_ms: u64) -> io::Result<()> {
    let tmp_path = path.with_file_name(format!(
        "{}.tmp-{pid}-{now_unix_ms}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("ledger")
    ));
    fs::write(&tmp_path, bytes)?;
    match fs::rename(&tmp_path, path) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(&tmp_path, path)?;
            fs::remove_file(&tmp_path)?;
            Ok(())
        }
    }
}

pub fn ledger_path(ledgers_dir: &Path, job_id: &str) -> PathBuf {
    ledgers_dir.join(format!("job-ledger-{job_id}.json"))
}

/// Writes a freshly created, `IN_PROGRESS` ledger record (spec §4.10 "Write path").
pub fn create_ledger(
    ledgers_dir: &Path,
    record: &JobLedgerRecord,
    pid: u32,
    now_unix_ms: u64,
) -> Result<PathBuf, LedgerError> {
    fs::create_dir_all(ledgers_dir)?;
    let path = ledger_path(ledgers_dir, &record.job_id);
    let bytes = serde_json::to_vec_pretty(record)?;
    atomic_write(&path, &bytes, pid, now_unix_ms)?;
    Ok(path)
}

/// Rewrites an existing ledger with a terminal state and `cleanup_complete =
/// true` (spec §4.10 "Complete path"). The orchestrator unlinks the ledger
/// after this call succeeds.
pub fn complete_ledger(
    path: &Path,
    terminal_state: LedgerState,
    reason_code: Option<&str>,
    completed_at: &str,
    pid: u32,
    now_unix_ms: u64,
) -> Result<(), LedgerError> {
    let existing = fs::read_to_string(path)?;
    let mut record: JobLedgerRecord = serde_json::from_str(&existing)?;
    record.state = terminal_state;
    record.cleanup_complete = true;
    record.completed_at = Some(completed_at.to_string());
    record.reason_code = reason_code.map(str::to_string);
    let bytes = serde_json::to_vec_pretty(&record)?;
    atomic_write(path, &bytes, pid, now_unix_ms)?;
    Ok(())
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RecoverySummary {
    pub scanned_ledgers: u64,
    pub in_progress_detected: u64,
    pub cleaned_ledgers: u64,
    pub invalid_ledgers: u64,
    pub deleted_tmp_count: u64,
    pub blocked_outside_base_count: u64,
}

fn is_candidate_suffix(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    name.ends_with(".partial") || name.contains(".tmp")
}

fn safe_rmdir_if_empty(dir: &Path) {
    if let Ok(mut entries) = fs::read_dir(dir) {
        if entries.next().is_none() {
            let _ = fs::remove_dir(dir);
        }
    }
}

/// Runs at startup: enumerates ledger files (capped at `max_ledgers`), skips
/// anything not `IN_PROGRESS`, and for every valid in-progress ledger
/// unlinks its tracked/derived temp artifacts within the ledger's own
/// export folder before removing the ledger itself (spec §4.10 "Recovery
/// path").
pub fn recover_in_progress(ledgers_dir: &Path, max_ledgers: usize, logger: &dyn Logger) -> RecoverySummary {
    let mut summary = RecoverySummary::default();

    let entries = match fs::read_dir(ledgers_dir) {
        Ok(entries) => entries,
        Err(_) => return summary,
    };

    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    files.sort();
    files.truncate(max_ledgers);

    for path in files {
        summary.scanned_ledgers += 1;
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => {
                summary.invalid_ledgers += 1;
                continue;
            }
        };
        let record: JobLedgerRecord = match serde_json::from_str(&contents) {
            Ok(r) => r,
            Err(_) => {
                logger.log("job.recovery.detected", serde_json::json!({ "valid": false }));
                summary.invalid_ledgers += 1;
                continue;
            }
        };

        if record.schema_family != JobLedgerRecord::SCHEMA_FAMILY {
            logger.log("schema.unsupported", serde_json::json!({ "family": record.schema_family }));
            summary.invalid_ledgers += 1;
            continue;
        }
        if record.schema_version != JobLedgerRecord::SCHEMA_VERSION {
            logger.log("schema.unsupported", serde_json::json!({ "version": record.schema_version }));
            summary.invalid_ledgers += 1;
            continue;
        }

        if record.state != LedgerState::InProgress {
            let _ = fs::remove_file(&path);
            continue;
        }

        summary.in_progress_detected += 1;
        logger.log("job.recovery.detected", serde_json::json!({ "valid": true, "jobId": record.job_id }));

        let mut candidates: Vec<PathBuf> = record.tmp_paths.clone();
        for final_path in &record.output_final_paths {
            let mut partial = final_path.clone().into_os_string();
            partial.push(".partial");
            let partial = PathBuf::from(partial);
            if !candidates.contains(&partial) {
                candidates.push(partial);
            }
        }

        let mut deleted = 0u64;
        let mut blocked = 0u64;
        let mut touched_parents: Vec<PathBuf> = Vec::new();
        for candidate in candidates {
            if !is_candidate_suffix(&candidate) {
                continue;
            }
            if !is_within_base(&record.export_folder, &candidate) {
                blocked += 1;
                continue;
            }
            if let Ok(meta) = fs::metadata(&candidate) {
                if meta.is_file() && fs::remove_file(&candidate).is_ok() {
                    deleted += 1;
                    if let Some(parent) = candidate.parent() {
                        touched_parents.push(parent.to_path_buf());
                    }
                }
            }
        }

        touched_parents.sort();
        touched_parents.dedup();
        for parent in &touched_parents {
            if parent != &record.export_folder {
                safe_rmdir_if_empty(parent);
            }
        }
        safe_rmdir_if_empty(&record.export_folder);

        summary.deleted_tmp_count += deleted;
        summary.blocked_outside_base_count += blocked;
        summary.cleaned_ledgers += 1;
        logger.log(
            "job.recovery.cleaned",
            serde_json::json!({ "jobId": record.job_id, "deleted": deleted, "blocked": blocked }),
        );
        let _ = fs::remove_file(&path);
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::logger::NullLogger;

    fn sample_record(export_folder: &Path) -> JobLedgerRecord {
        JobLedgerRecord {
            schema_family: JobLedgerRecord::SCHEMA_FAMILY.to_string(),
            schema_version: JobLedgerRecord::SCHEMA_VERSION,
            job_id: "job-1".into(),
            created_at: "2026-01-01T00:00:00Z".into(),
            export_folder: export_folder.to_path_buf(),
            tmp_paths: vec![],
            output_final_paths: vec![export_folder.join("Track 1.mp4")],
            log_path: None,
            state: LedgerState::InProgress,
            cleanup_complete: false,
            completed_at: None,
            reason_code: None,
        }
    }

    #[test]
    fn create_then_complete_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let ledgers_dir = dir.path().join("job-ledgers");
        let record = sample_record(dir.path());
        let path = create_ledger(&ledgers_dir, &record, 1234, 1).unwrap();
        assert!(path.exists());

        complete_ledger(&path, LedgerState::Done, None, "2026-01-01T00:01:00Z", 1234, 2).unwrap();
        let saved: JobLedgerRecord = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved.state, LedgerState::Done);
        assert!(saved.cleanup_complete);
    }

    #[test]
    fn recovery_deletes_derived_partial_and_removes_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let ledgers_dir = dir.path().join("job-ledgers");
        fs::create_dir_all(&ledgers_dir).unwrap();
        let export_folder = dir.path().join("album");
        fs::create_dir_all(&export_folder).unwrap();
        fs::write(export_folder.join("Track 1.mp4.partial"), b"x").unwrap();

        let record = sample_record(&export_folder);
        let ledger_file = ledger_path(&ledgers_dir, &record.job_id);
        fs::write(&ledger_file, serde_json::to_vec(&record).unwrap()).unwrap();

        let summary = recover_in_progress(&ledgers_dir, 256, &NullLogger);
        assert_eq!(summary.in_progress_detected, 1);
        assert_eq!(summary.cleaned_ledgers, 1);
        assert_eq!(summary.deleted_tmp_count, 1);
        assert!(!ledger_file.exists());
        assert!(!export_folder.join("Track 1.mp4.partial").exists());
    }

    #[test]
    fn recovery_preserves_outside_base_partial_and_cleans_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let ledgers_dir = dir.path().join("job-ledgers");
        fs::create_dir_all(&ledgers_dir).unwrap();
        let export_folder = dir.path().join("export").join("album");
        fs::create_dir_all(&export_folder).unwrap();
        fs::write(export_folder.join("01.mp4.partial"), b"x").unwrap();
        fs::write(export_folder.join("scratch.tmp"), b"x").unwrap();

        let outside_base = dir.path().join("elsewhere");
        fs::create_dir_all(&outside_base).unwrap();
        let stray_outside_partial = outside_base.join("stray.mp4.partial");
        fs::write(&stray_outside_partial, b"x").unwrap();

        let mut record = sample_record(&export_folder);
        record.output_final_paths = vec![export_folder.join("01.mp4"), outside_base.join("stray.mp4")];
        record.tmp_paths = vec![export_folder.join("scratch.tmp")];
        let ledger_file = ledger_path(&ledgers_dir, &record.job_id);
        fs::write(&ledger_file, serde_json::to_vec(&record).unwrap()).unwrap();

        let summary = recover_in_progress(&ledgers_dir, 256, &NullLogger);
        assert!(!export_folder.join("01.mp4.partial").exists());
        assert!(!export_folder.join("scratch.tmp").exists());
        assert!(stray_outside_partial.exists(), "outside-base partial must be preserved, not deleted");
        assert!(summary.blocked_outside_base_count >= 1);
        assert!(!ledger_file.exists());
    }

    #[test]
    fn recovery_counts_corrupt_ledger_as_invalid_without_deleting() {
        let dir = tempfile::tempdir().unwrap();
        let ledgers_dir = dir.path().join("job-ledgers");
        fs::create_dir_all(&ledgers_dir).unwrap();
        let bad_path = ledgers_dir.join("job-ledger-bad.json");
        fs::write(&bad_path, b"{not json").unwrap();

        let summary = recover_in_progress(&ledgers_dir, 256, &NullLogger);
        assert_eq!(summary.invalid_ledgers, 1);
        assert!(bad_path.exists());
    }
}
