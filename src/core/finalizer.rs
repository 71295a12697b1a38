//! C8: per-job finalization — validate partials, enforce the no-overwrite
//! guard, commit partial→final (same-filesystem rename, or copy+unlink on
//! `EXDEV`), sweep stray partials, and write the render report (spec §4.8).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::core::domain::{Plan, RenderReport};
use crate::core::error::ReasonCode;
use crate::core::logger::Logger;
use crate::core::path_safety::is_within_base;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameMethod {
    SameFilesystem,
    CopyUnlink,
}

#[derive(Debug, Clone)]
pub struct RenamedOutput {
    pub partial_path: PathBuf,
    pub final_path: PathBuf,
    pub method: RenameMethod,
}

#[derive(Debug, thiserror::Error)]
pub enum FinalizeError {
    #[error("FFMPEG_EXIT_NONZERO: partial file missing or empty: {0}")]
    PartialMissingOrEmpty(PathBuf),
    #[error("UNCAUGHT: path escapes export folder: {0}")]
    OutsideExportFolder(PathBuf),
    #[error("UNCAUGHT: refusing to overwrite existing final output: {0}")]
    FinalAlreadyExists(PathBuf),
    #[error("UNCAUGHT: {count} stray partial file(s) remained after sweep")]
    StrayPartialsRemained { count: usize },
    #[error("UNCAUGHT: {0}")]
    Io(#[from] io::Error),
}

impl FinalizeError {
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            FinalizeError::PartialMissingOrEmpty(_) => ReasonCode::FfmpegExitNonzero,
            _ => ReasonCode::Uncaught,
        }
    }
}

fn verify_partial_ready(partial_path: &Path) -> Result<(), FinalizeError> {
    let meta = fs::metadata(partial_path).map_err(|_| FinalizeError::PartialMissingOrEmpty(partial_path.to_path_buf()))?;
    if !meta.is_file() || meta.len() == 0 {
        return Err(FinalizeError::PartialMissingOrEmpty(partial_path.to_path_buf()));
    }
    Ok(())
}

fn verify_containment(export_folder: &Path, partial_path: &Path, final_path: &Path) -> Result<(), FinalizeError> {
    if !is_within_base(export_folder, partial_path) {
        return Err(FinalizeError::OutsideExportFolder(partial_path.to_path_buf()));
    }
    if !is_within_base(export_folder, final_path) {
        return Err(FinalizeError::OutsideExportFolder(final_path.to_path_buf()));
    }
    Ok(())
}

/// Commits one partial to its final path. Tries a same-filesystem rename
/// first; on `EXDEV` (or any rename failure, matching the spec's "or
/// equivalent") falls back to copy + verify + unlink (spec §4.8 step 3).
pub fn commit_output(partial_path: &Path, final_path: &Path) -> Result<RenameMethod, FinalizeError> {
    match fs::rename(partial_path, final_path) {
        Ok(()) => Ok(RenameMethod::SameFilesystem),
        Err(_) => {
            fs::copy(partial_path, final_path)?;
            let meta = fs::metadata(final_path)?;
            if !meta.is_file() || meta.len() == 0 {
                let _ = fs::remove_file(final_path);
                return Err(FinalizeError::PartialMissingOrEmpty(final_path.to_path_buf()));
            }
            fs::remove_file(partial_path)?;
            Ok(RenameMethod::CopyUnlink)
        }
    }
}

/// Sweeps any `.partial`/`.tmp`/`.tmp.*` files remaining directly under the
/// export folder (spec §4.8 step 5). Returns the count left behind after a
/// best-effort unlink pass.
pub fn sweep_stray_partials(export_folder: &Path) -> io::Result<usize> {
    let mut remaining = 0usize;
    let entries = match fs::read_dir(export_folder) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name.ends_with(".partial") || name.contains(".tmp") {
            if fs::remove_file(&path).is_err() {
                remaining += 1;
            }
        }
    }
    Ok(remaining)
}

/// Runs the full C8 sequence for a successful job: renames every track's
/// partial to its final path in plan order, writes the render report, sweeps
/// stragglers, and returns the committed outputs plus the report's path
/// (spec §4.8 steps 1-6). Mark order is mandatory (spec §5): `finalize.start
/// → rename_outputs.{start,method,end} → write_report.{start,end} →
/// cleanup.{start,end} → finalize.summary → finalize.end`.
pub fn finalize_outputs(
    plan: &Plan,
    report: &RenderReport,
    app_log_dir: &Path,
    logger: &dyn Logger,
) -> Result<(Vec<RenamedOutput>, PathBuf), FinalizeError> {
    logger.log("finalize.start", serde_json::json!({ "jobId": plan.job_id }));
    logger.log("finalize.rename_outputs.start", serde_json::json!({}));

    let mut renamed = Vec::with_capacity(plan.tracks.len());
    for track in &plan.tracks {
        verify_partial_ready(&track.partial_path)?;
        verify_containment(&plan.export_folder, &track.partial_path, &track.output_final_path)?;
        if track.output_final_path.exists() {
            return Err(FinalizeError::FinalAlreadyExists(track.output_final_path.clone()));
        }
        let method = commit_output(&track.partial_path, &track.output_final_path)?;
        logger.log(
            "finalize.rename_outputs.method",
            serde_json::json!({ "trackIndex": track_index(plan, track), "method": format!("{method:?}") }),
        );
        renamed.push(RenamedOutput {
            partial_path: track.partial_path.clone(),
            final_path: track.output_final_path.clone(),
            method,
        });
    }
    logger.log("finalize.rename_outputs.end", serde_json::json!({ "renamedCount": renamed.len() }));

    logger.log("finalize.write_report.start", serde_json::json!({}));
    let report_path = write_render_report(report, &plan.export_folder, app_log_dir)?;
    logger.log("finalize.write_report.end", serde_json::json!({ "path": report_path }));

    logger.log("finalize.cleanup.start", serde_json::json!({}));
    let stray = sweep_stray_partials(&plan.export_folder).unwrap_or(0);
    if stray > 0 {
        return Err(FinalizeError::StrayPartialsRemained { count: stray });
    }
    logger.log("finalize.cleanup.end", serde_json::json!({}));
    logger.log("finalize.summary", serde_json::json!({ "renamedCount": renamed.len() }));
    logger.log("finalize.end", serde_json::json!({}));
    Ok((renamed, report_path))
}

fn track_index(plan: &Plan, track: &crate::core::domain::PlannedTrack) -> usize {
    plan.tracks
        .iter()
        .position(|t| t.output_final_path == track.output_final_path)
        .unwrap_or(0)
}

/// Writes the render report to `<export>/Logs/render-report.json` on
/// success, or to `app_log_dir` on any other terminal status (spec §4.8
/// step 4).
pub fn write_render_report(
    report: &RenderReport,
    export_folder: &Path,
    app_log_dir: &Path,
) -> io::Result<PathBuf> {
    use crate::core::domain::JobStatus;
    let path = if report.status == JobStatus::Success {
        let logs_dir = export_folder.join("Logs");
        fs::create_dir_all(&logs_dir)?;
        logs_dir.join("render-report.json")
    } else {
        fs::create_dir_all(app_log_dir)?;
        app_log_dir.join(format!("render-report-{}.json", report.plan.job_id))
    };
    let json = serde_json::to_vec_pretty(report)?;
    fs::write(&path, json)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::{JobStatus, Plan, PlannedTrack, PresetDecisions, PresetOrdering};
    use crate::core::logger::NullLogger;

    fn sample_report(plan: &Plan) -> RenderReport {
        use crate::core::domain::{EnvironmentStamp, PerfStats};
        RenderReport {
            schema_family: RenderReport::SCHEMA_FAMILY.to_string(),
            schema_version: RenderReport::SCHEMA_VERSION,
            environment: EnvironmentStamp {
                app_version: "test".into(),
                runtime_version: "test".into(),
                ffmpeg_path: "ffmpeg".into(),
                ffprobe_path: "ffprobe".into(),
                ffmpeg_hash: None,
                ffprobe_hash: None,
                contract_key: "test".into(),
                bypass_used: false,
                unpackaged: true,
            },
            plan: plan.clone(),
            tracks: vec![],
            status: JobStatus::Success,
            reason_code: None,
            message: "Export completed.".to_string(),
            cleanup: None,
            perf: PerfStats::default(),
        }
    }

    fn sample_plan(dir: &Path) -> Plan {
        let partial = dir.join("Track 1.mp4.partial");
        fs::write(&partial, b"fake-mp4-bytes").unwrap();
        Plan {
            job_id: "job-1".into(),
            export_folder: dir.to_path_buf(),
            preset_key: "album_ep".into(),
            preset_decisions: PresetDecisions {
                ordering: PresetOrdering::Input,
                ordering_reason: "test".into(),
                prefix_track_number: false,
                max_tracks: None,
            },
            image_path: dir.join("cover.jpg"),
            total_duration_sec: 10.0,
            tracks: vec![PlannedTrack {
                audio_path: dir.join("a.wav"),
                track_no: Some(1),
                duration_sec: 10.0,
                output_base: "Track 1".into(),
                output_final_path: dir.join("Track 1.mp4"),
                partial_path: partial,
                ffmpeg_args_base: vec![],
            }],
        }
    }

    #[test]
    fn finalizes_valid_partial_to_final() {
        let dir = tempfile::tempdir().unwrap();
        let plan = sample_plan(dir.path());
        let report = sample_report(&plan);
        let app_log_dir = dir.path().join("applogs");
        let (renamed, report_path) = finalize_outputs(&plan, &report, &app_log_dir, &NullLogger).unwrap();
        assert_eq!(renamed.len(), 1);
        assert!(dir.path().join("Track 1.mp4").exists());
        assert!(!dir.path().join("Track 1.mp4.partial").exists());
        assert!(report_path.exists());
        assert_eq!(report_path, dir.path().join("Logs").join("render-report.json"));
    }

    #[test]
    fn refuses_to_overwrite_existing_final() {
        let dir = tempfile::tempdir().unwrap();
        let plan = sample_plan(dir.path());
        let report = sample_report(&plan);
        let app_log_dir = dir.path().join("applogs");
        fs::write(dir.path().join("Track 1.mp4"), b"existing").unwrap();
        let err = finalize_outputs(&plan, &report, &app_log_dir, &NullLogger).unwrap_err();
        assert!(matches!(err, FinalizeError::FinalAlreadyExists(_)));
    }

    #[test]
    fn rejects_empty_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let plan = sample_plan(dir.path());
        let report = sample_report(&plan);
        let app_log_dir = dir.path().join("applogs");
        fs::write(&plan.tracks[0].partial_path, b"").unwrap();
        let err = finalize_outputs(&plan, &report, &app_log_dir, &NullLogger).unwrap_err();
        assert!(matches!(err, FinalizeError::PartialMissingOrEmpty(_)));
    }

    #[test]
    fn sweeps_stray_partials_and_fails_if_any_remain() {
        let dir = tempfile::tempdir().unwrap();
        let plan = sample_plan(dir.path());
        let report = sample_report(&plan);
        let app_log_dir = dir.path().join("applogs");
        fs::write(dir.path().join("leftover.mp4.partial"), b"x").unwrap();
        let result = finalize_outputs(&plan, &report, &app_log_dir, &NullLogger);
        assert!(result.is_ok());
        assert!(!dir.path().join("leftover.mp4.partial").exists());
    }
}
