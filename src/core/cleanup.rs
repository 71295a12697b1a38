//! C9: best-effort, never-rejecting cleanup run on any non-success terminal
//! transition (spec §4.9). A single in-flight cleanup is shared by every
//! caller via a `tokio::sync::OnceCell`, mirroring the "one-shot
//! future/promise" contract in the spec rather than re-running the sweep
//! per caller.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::OnceCell;

use crate::core::domain::CleanupStats;
use crate::core::error::ReasonCode;
use crate::core::kill_tree::{kill_tree, WaitOutcome};
use crate::core::logger::Logger;
use crate::core::path_safety::is_within_base;

fn wait_outcome_name(outcome: WaitOutcome) -> &'static str {
    match outcome {
        WaitOutcome::AlreadyExited => "already-exited",
        WaitOutcome::Exit => "exit",
        WaitOutcome::Close => "close",
        WaitOutcome::Timeout => "timeout",
    }
}

pub struct CleanupContext {
    pub job_id: String,
    pub export_folder: PathBuf,
    pub base_export_root: PathBuf,
    pub reason: ReasonCode,
    pub tmp_candidates: Vec<PathBuf>,
    pub partial_candidates: Vec<PathBuf>,
    pub planned_final_outputs: Vec<PathBuf>,
    pub completed_final_outputs: Vec<PathBuf>,
    pub render_report_path: Option<PathBuf>,
    pub created_folder: bool,
    pub had_preexisting_content: bool,
    pub kill_wait: Duration,
}

/// Reason the folder-removal boundary guard refused to remove a directory
/// (spec §4.9 "Boundary guards").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockedReason {
    PreexistingUserContent,
    OutputEqualsBaseExport,
    OutsideBaseAndMissingMarker,
    PathTooShallow,
    FilesystemRoot,
    HomeDirectory,
    DesktopDirectory,
    NotAbsolute,
}

impl BlockedReason {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockedReason::PreexistingUserContent => "preexisting_user_content",
            BlockedReason::OutputEqualsBaseExport => "output_equals_base_export",
            BlockedReason::OutsideBaseAndMissingMarker => "outside_base_and_missing_marker",
            BlockedReason::PathTooShallow => "path_too_shallow",
            BlockedReason::FilesystemRoot => "filesystem_root",
            BlockedReason::HomeDirectory => "home_directory",
            BlockedReason::DesktopDirectory => "desktop_directory",
            BlockedReason::NotAbsolute => "not_absolute",
        }
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

fn path_depth_below_root(path: &Path) -> usize {
    path.components()
        .filter(|c| !matches!(c, std::path::Component::RootDir | std::path::Component::Prefix(_)))
        .count()
}

/// Refuses removal of the filesystem root, the user's home or Desktop, a
/// path fewer than two segments below root, the base export root itself, or
/// anything outside the base that lacks a `Logs` marker directory (spec
/// §4.9 "Boundary guards").
pub fn can_remove_output_folder(
    target: &Path,
    base_export_root: &Path,
    had_preexisting_content: bool,
) -> Result<(), BlockedReason> {
    if had_preexisting_content {
        return Err(BlockedReason::PreexistingUserContent);
    }
    if !target.is_absolute() {
        return Err(BlockedReason::NotAbsolute);
    }
    if target.parent().is_none() {
        return Err(BlockedReason::FilesystemRoot);
    }
    if let Some(home) = home_dir() {
        if target == home {
            return Err(BlockedReason::HomeDirectory);
        }
        if target == home.join("Desktop") {
            return Err(BlockedReason::DesktopDirectory);
        }
    }
    if path_depth_below_root(target) < 2 {
        return Err(BlockedReason::PathTooShallow);
    }
    if target == base_export_root {
        return Err(BlockedReason::OutputEqualsBaseExport);
    }
    if !is_within_base(base_export_root, target) && !target.join("Logs").is_dir() {
        return Err(BlockedReason::OutsideBaseAndMissingMarker);
    }
    Ok(())
}

fn is_tmp_like(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    name.ends_with(".partial") || name.contains(".tmp")
}

fn remove_dir_if_empty(dir: &Path) -> bool {
    match fs::read_dir(dir) {
        Ok(mut entries) => {
            if entries.next().is_none() {
                fs::remove_dir(dir).is_ok()
            } else {
                false
            }
        }
        Err(_) => false,
    }
}

pub struct CleanupEngine {
    child: Mutex<Option<Child>>,
    once: OnceCell<CleanupStats>,
}

impl CleanupEngine {
    pub fn new(child: Option<Child>) -> Self {
        Self {
            child: Mutex::new(child),
            once: OnceCell::new(),
        }
    }

    pub fn with_no_child() -> Self {
        Self::new(None)
    }

    /// Runs the sweep exactly once no matter how many callers invoke it
    /// concurrently; later callers get the same result (spec §4.9).
    pub async fn run(&self, ctx: CleanupContext, logger: &dyn Logger) -> CleanupStats {
        self.once
            .get_or_init(|| async { self.run_inner(ctx, logger).await })
            .await
            .clone()
    }

    async fn run_inner(&self, ctx: CleanupContext, logger: &dyn Logger) -> CleanupStats {
        logger.log("cleanup.start", serde_json::json!({ "jobId": ctx.job_id, "reason": ctx.reason }));

        let wait_outcome = {
            let mut guard = self.child.lock().unwrap_or_else(|p| p.into_inner());
            match guard.as_mut() {
                Some(child) => {
                    let outcome = kill_tree(child, ctx.kill_wait).await;
                    logger.log("cleanup.ffmpeg_killed", serde_json::json!({}));
                    logger.log(
                        "cleanup.ffmpeg_wait",
                        serde_json::json!({ "outcome": wait_outcome_name(outcome) }),
                    );
                    outcome
                }
                None => WaitOutcome::AlreadyExited,
            }
        };

        let mut stats = CleanupStats {
            wait_outcome: wait_outcome_name(wait_outcome).to_string(),
            ..Default::default()
        };

        let mut candidates: Vec<(PathBuf, bool)> = Vec::new();
        for p in &ctx.tmp_candidates {
            candidates.push((p.clone(), false));
        }
        for p in &ctx.partial_candidates {
            candidates.push((p.clone(), false));
        }
        if let Ok(read) = fs::read_dir(&ctx.export_folder) {
            for entry in read.flatten() {
                let path = entry.path();
                if is_tmp_like(&path) && !candidates.iter().any(|(c, _)| c == &path) {
                    candidates.push((path, false));
                }
            }
        }
        if ctx.reason == ReasonCode::Cancelled {
            for p in &ctx.planned_final_outputs {
                candidates.push((p.clone(), true));
            }
            for p in &ctx.completed_final_outputs {
                candidates.push((p.clone(), true));
            }
            if let Some(report_path) = &ctx.render_report_path {
                candidates.push((report_path.clone(), true));
            }
        }

        for (path, is_final) in &candidates {
            if !path.exists() {
                continue;
            }
            match fs::remove_file(path) {
                Ok(()) => {
                    if *is_final {
                        stats.deleted_final_count += 1;
                    } else {
                        stats.deleted_tmp_count += 1;
                    }
                }
                Err(err) => {
                    stats.delete_failed_count += 1;
                    if stats.delete_failed_examples.len() < 3 {
                        stats
                            .delete_failed_examples
                            .push(format!("{}: {err}", path.display()));
                    }
                    logger.log(
                        "cleanup.delete_failed",
                        serde_json::json!({ "path": path.display().to_string(), "error": err.to_string() }),
                    );
                }
            }
        }

        if ctx.created_folder {
            let logs_dir = ctx.export_folder.join("Logs");
            if logs_dir.is_dir() {
                remove_dir_if_empty(&logs_dir);
            }
            match can_remove_output_folder(&ctx.export_folder, &ctx.base_export_root, ctx.had_preexisting_content) {
                Ok(()) => {
                    stats.removed_empty_folder = remove_dir_if_empty(&ctx.export_folder);
                }
                Err(reason) => {
                    logger.log(
                        "cleanup.remove_folder_blocked",
                        serde_json::json!({ "reason": reason.as_str() }),
                    );
                }
            }
        } else {
            logger.log("cleanup.skipped_no_outputFolder", serde_json::json!({}));
        }

        logger.log("cleanup.end", serde_json::json!({ "stats": &stats }));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::logger::NullLogger;

    #[test]
    fn boundary_guard_rejects_home_and_shallow_paths() {
        let home = home_dir().unwrap_or_else(|| PathBuf::from("/home/tester"));
        assert_eq!(
            can_remove_output_folder(&home, Path::new("/export"), false),
            Err(BlockedReason::HomeDirectory)
        );
        assert_eq!(
            can_remove_output_folder(Path::new("/a"), Path::new("/export"), false),
            Err(BlockedReason::PathTooShallow)
        );
        assert_eq!(
            can_remove_output_folder(Path::new("relative/path"), Path::new("/export"), false),
            Err(BlockedReason::NotAbsolute)
        );
    }

    #[test]
    fn boundary_guard_allows_folder_within_base() {
        assert_eq!(
            can_remove_output_folder(Path::new("/export/album"), Path::new("/export"), false),
            Ok(())
        );
    }

    #[tokio::test]
    async fn cleanup_removes_tmp_and_partial_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("a.mp4.tmp");
        let partial = dir.path().join("b.mp4.partial");
        fs::write(&tmp, b"x").unwrap();
        fs::write(&partial, b"x").unwrap();

        let engine = CleanupEngine::with_no_child();
        let ctx = CleanupContext {
            job_id: "job-1".into(),
            export_folder: dir.path().to_path_buf(),
            base_export_root: dir.path().to_path_buf(),
            reason: ReasonCode::FfmpegExitNonzero,
            tmp_candidates: vec![tmp.clone()],
            partial_candidates: vec![partial.clone()],
            planned_final_outputs: vec![],
            completed_final_outputs: vec![],
            render_report_path: None,
            created_folder: false,
            had_preexisting_content: false,
            kill_wait: Duration::from_millis(100),
        };
        let stats = engine.run(ctx, &NullLogger).await;
        assert_eq!(stats.deleted_tmp_count, 2);
        assert!(!tmp.exists());
        assert!(!partial.exists());
    }

    #[tokio::test]
    async fn cancelled_reason_also_removes_final_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let final_out = dir.path().join("Track 1.mp4");
        fs::write(&final_out, b"x").unwrap();

        let engine = CleanupEngine::with_no_child();
        let ctx = CleanupContext {
            job_id: "job-1".into(),
            export_folder: dir.path().to_path_buf(),
            base_export_root: dir.path().to_path_buf(),
            reason: ReasonCode::Cancelled,
            tmp_candidates: vec![],
            partial_candidates: vec![],
            planned_final_outputs: vec![],
            completed_final_outputs: vec![final_out.clone()],
            render_report_path: None,
            created_folder: false,
            had_preexisting_content: false,
            kill_wait: Duration::from_millis(100),
        };
        let stats = engine.run(ctx, &NullLogger).await;
        assert_eq!(stats.deleted_final_count, 1);
        assert!(!final_out.exists());
    }
}
