//! C11: drives one render job end to end — plan, warm up, create the
//! ledger, run each track through the executor with the audio-copy→AAC
//! retry, finalize, and on any non-success path hand off to cleanup (spec
//! §4.11).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::core::cleanup::{CleanupContext, CleanupEngine};
use crate::core::domain::{
    AudioMode, CleanupStats, EnvironmentStamp, JobStatus, LedgerState, Plan, RenderReport, TrackReport,
};
use crate::core::error::ReasonCode;
use crate::core::executor::{
    self, CancelReason, CancelToken, TrackExecutionInputs, TrackOutcome, Transcoder,
};
use crate::core::finalizer::{self, FinalizeError};
use crate::core::fsm::{EngineFsm, EngineState};
use crate::core::integrity::IntegrityState;
use crate::core::ledger;
use crate::core::logger::Logger;
use crate::core::planner::{self, PlanError, PlanInputs};
use crate::core::progress::ProgressSnapshot;
use crate::core::settings::EngineSettings;

pub struct RenderAlbumInputs<'a> {
    pub job_id: String,
    pub plan_inputs: PlanInputs<'a>,
    pub ffprobe_path: Option<&'a Path>,
    pub ffmpeg_path: &'a Path,
    pub settings: &'a EngineSettings,
    pub integrity: &'a IntegrityState,
    pub environment: EnvironmentStamp,
    pub ledgers_dir: &'a Path,
    pub app_log_dir: &'a Path,
    pub pid: u32,
    pub now_unix_ms: u64,
}

pub struct RenderAlbumOutcome {
    pub report: RenderReport,
    pub report_path: Option<PathBuf>,
    pub cleanup: Option<CleanupStats>,
}

/// One-shot null-source transcode used to warm up the ffmpeg process/codec
/// cache before the first real track (spec §4.11 step 3). Always returns an
/// elapsed time, even on failure or timeout, since the caller records it
/// regardless of outcome.
async fn run_warmup(ffmpeg_path: &Path, cap: Duration) -> (bool, u64) {
    let started = tokio::time::Instant::now();
    let mut cmd = Command::new(ffmpeg_path);
    cmd.args([
        "-hide_banner",
        "-loglevel",
        "error",
        "-f",
        "lavfi",
        "-i",
        "anullsrc",
        "-t",
        "0.1",
        "-f",
        "null",
        "-",
    ]);
    cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
    let ok = match tokio::time::timeout(cap, cmd.status()).await {
        Ok(Ok(status)) => status.success(),
        _ => false,
    };
    (ok, started.elapsed().as_millis() as u64)
}

fn terminal_state_for(status: JobStatus) -> LedgerState {
    match status {
        JobStatus::Success => LedgerState::Done,
        JobStatus::Failed => LedgerState::Failed,
        JobStatus::Cancelled => LedgerState::Cancelled,
        JobStatus::Timeout => LedgerState::Failed,
    }
}

/// Canonical `SCREAMING_SNAKE_CASE` string for a reason code (spec §7), used
/// wherever the code crosses the RPC/report/ledger boundary as a string.
fn reason_code_str(reason: ReasonCode) -> String {
    serde_json::to_value(reason)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "UNCAUGHT".to_string())
}

/// Creates the export folder if it doesn't already exist and reports
/// whether this job created it and whether it already held entries, for
/// C9's folder-removal boundary guards (spec §4.9).
fn ensure_export_folder(export_folder: &Path) -> (bool, bool) {
    match std::fs::read_dir(export_folder) {
        Ok(entries) => (false, entries.flatten().next().is_some()),
        Err(_) => {
            let _ = std::fs::create_dir_all(export_folder);
            (true, false)
        }
    }
}

fn now_iso(now_unix_ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(now_unix_ms as i64)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// Runs the full sequence described in spec §4.11 for one job. `cancel` is
/// shared with the caller so an external `cancel-render` call can be
/// observed between tracks and inside the executor's own select loop.
pub async fn render_album(
    transcoder: &dyn Transcoder,
    inputs: RenderAlbumInputs<'_>,
    cancel: &CancelToken,
    logger: &dyn Logger,
    on_status: &(dyn Fn(&str) + Send + Sync),
    on_progress: &(dyn Fn(ProgressSnapshot) + Send + Sync),
) -> RenderAlbumOutcome {
    on_status("planning");
    logger.log("render.start", serde_json::json!({ "jobId": inputs.job_id }));

    if !inputs.integrity.rendering_allowed {
        let report = build_early_failure_report(
            &inputs,
            ReasonCode::BinIntegrityBypass,
            ReasonCode::BinIntegrityBypass.user_message().to_string(),
        );
        let report_path = finalizer::write_render_report(&report, Path::new("."), inputs.app_log_dir).ok();
        return RenderAlbumOutcome { report, report_path, cleanup: None };
    }

    let plan = match planner::plan(
        inputs.plan_inputs,
        inputs.ffprobe_path,
        inputs.ffmpeg_path,
        Duration::from_millis(inputs.settings.probe_timeout_ms),
        inputs.job_id.clone(),
        inputs.now_unix_ms,
    )
    .await
    {
        Ok(plan) => plan,
        Err(err) => {
            let reason = match &err {
                PlanError::ProbeFailed { .. } => ReasonCode::ProbeFailed,
                _ => ReasonCode::Uncaught,
            };
            let report = build_early_failure_report(&inputs, reason, err.to_string());
            let report_path = finalizer::write_render_report(&report, Path::new("."), inputs.app_log_dir).ok();
            return RenderAlbumOutcome { report, report_path, cleanup: None };
        }
    };

    let (created_folder, had_preexisting_content) = ensure_export_folder(&plan.export_folder);

    let mut fsm = EngineFsm::new(inputs.job_id.clone());
    let _ = fsm.transition(EngineState::WarmingUp, serde_json::json!({}));

    let (warmup_ok, warmup_ms) =
        run_warmup(inputs.ffmpeg_path, Duration::from_millis(inputs.settings.warmup_timeout_ms)).await;
    logger.log(
        if warmup_ok { "ffmpeg.warmup.done" } else { "ffmpeg.warmup.failed" },
        serde_json::json!({ "warmupMs": warmup_ms }),
    );

    let _ = fsm.transition(EngineState::Starting, serde_json::json!({}));
    let _ = fsm.transition(EngineState::Encoding, serde_json::json!({}));
    on_status("rendering");

    let record = build_ledger_record(&plan, inputs.now_unix_ms);
    let ledger_path = match ledger::create_ledger(inputs.ledgers_dir, &record, inputs.pid, inputs.now_unix_ms) {
        Ok(path) => Some(path),
        Err(_) => None,
    };

    let mut track_reports: Vec<TrackReport> = Vec::with_capacity(plan.tracks.len());
    let mut job_failure: Option<ReasonCode> = None;

    'tracks: for (index, track) in plan.tracks.iter().enumerate() {
        if cancel.is_cancelled() {
            job_failure = Some(ReasonCode::Cancelled);
            break 'tracks;
        }

        let _ = std::fs::remove_file(&track.partial_path);

        let exec_inputs = |audio_mode: AudioMode| TrackExecutionInputs {
            job_id: inputs.job_id.as_str(),
            index,
            partial_path: &track.partial_path,
            planned_duration_sec: track.duration_sec,
            audio_mode,
            planned_job_total_ms: (track.duration_sec * 1000.0) as u64,
            audio_input_bytes: std::fs::metadata(&track.audio_path).ok().map(|m| m.len()),
            watchdog_no_progress_ms: inputs.settings.watchdog_no_progress_ms,
            wall_timeout: Duration::from_millis(inputs.settings.effective_track_wall_timeout_ms()),
            poll_interval: Duration::from_millis(inputs.settings.poll_interval_ms),
            progress_ewma_alpha: inputs.settings.progress_ewma_alpha,
            is_last_track: index + 1 == plan.tracks.len(),
        };

        let outcome = executor::execute_track(
            transcoder,
            &track.ffmpeg_args_base,
            &["-c:a".to_string(), "copy".to_string()],
            exec_inputs(AudioMode::Copy),
            cancel,
            logger,
            on_progress,
        )
        .await;

        let outcome = match outcome {
            Ok(TrackOutcome::Failed { reason, retry_as_aac, report }) if retry_as_aac => {
                logger.log(
                    "render.audio_copy_fallback",
                    serde_json::json!({ "trackIndex": index, "reason": report.fallback_reason }),
                );
                let _ = reason;
                let _ = std::fs::remove_file(&track.partial_path);
                executor::execute_track(
                    transcoder,
                    &track.ffmpeg_args_base,
                    &["-c:a".to_string(), "aac".to_string(), "-b:a".to_string(), "320k".to_string()],
                    exec_inputs(AudioMode::AacFallback),
                    cancel,
                    logger,
                    on_progress,
                )
                .await
            }
            other => other,
        };

        match outcome {
            Ok(TrackOutcome::Success(report)) => {
                track_reports.push(report);
            }
            Ok(TrackOutcome::Failed { report, reason, .. }) => {
                track_reports.push(report);
                job_failure = Some(if cancel.is_cancelled() {
                    match cancel.reason() {
                        Some(CancelReason::Timeout) => ReasonCode::Timeout,
                        _ => ReasonCode::Cancelled,
                    }
                } else {
                    reason
                });
                break 'tracks;
            }
            Err(_) => {
                job_failure = Some(ReasonCode::Uncaught);
                break 'tracks;
            }
        }
    }

    let perf = crate::core::domain::PerfStats::from_samples(
        &track_reports.iter().map(|t| t.encode_ms).collect::<Vec<_>>(),
    );

    if let Some(reason) = job_failure {
        let status = match reason {
            ReasonCode::Cancelled => JobStatus::Cancelled,
            ReasonCode::Timeout | ReasonCode::WatchdogTimeout => JobStatus::Timeout,
            _ => JobStatus::Failed,
        };
        let _ = fsm.transition(
            if status == JobStatus::Cancelled { EngineState::Cancelled } else { EngineState::Failed },
            serde_json::json!({ "reason": reason }),
        );

        let report = RenderReport {
            schema_family: RenderReport::SCHEMA_FAMILY.to_string(),
            schema_version: RenderReport::SCHEMA_VERSION,
            environment: inputs.environment.clone(),
            plan: plan.clone(),
            tracks: track_reports,
            status,
            reason_code: Some(reason_code_str(reason)),
            message: reason.user_message().to_string(),
            cleanup: None,
            perf,
        };
        let report_path = finalizer::write_render_report(&report, &plan.export_folder, inputs.app_log_dir).ok();

        let cleanup_engine = CleanupEngine::with_no_child();
        let cleanup_ctx = CleanupContext {
            job_id: plan.job_id.clone(),
            export_folder: plan.export_folder.clone(),
            base_export_root: plan.export_folder.clone(),
            reason,
            tmp_candidates: vec![],
            partial_candidates: plan.tracks.iter().map(|t| t.partial_path.clone()).collect(),
            planned_final_outputs: plan.tracks.iter().map(|t| t.output_final_path.clone()).collect(),
            completed_final_outputs: vec![],
            render_report_path: report_path.clone(),
            created_folder,
            had_preexisting_content,
            kill_wait: Duration::from_millis(inputs.settings.cleanup_kill_wait_ms),
        };
        let cleanup_stats = cleanup_engine.run(cleanup_ctx, logger).await;

        if let Some(path) = &ledger_path {
            let _ = ledger::complete_ledger(
                path,
                terminal_state_for(status),
                Some(report.reason_code.as_deref().unwrap_or("UNCAUGHT")),
                &now_iso(inputs.now_unix_ms),
                inputs.pid,
                inputs.now_unix_ms,
            );
            let _ = std::fs::remove_file(path);
        }

        let mut report = report;
        report.cleanup = Some(cleanup_stats.clone());
        return RenderAlbumOutcome { report, report_path, cleanup: Some(cleanup_stats) };
    }

    let _ = fsm.transition(EngineState::Finalizing, serde_json::json!({}));
    on_status("finalizing");

    let success_report = RenderReport {
        schema_family: RenderReport::SCHEMA_FAMILY.to_string(),
        schema_version: RenderReport::SCHEMA_VERSION,
        environment: inputs.environment.clone(),
        plan: plan.clone(),
        tracks: track_reports.clone(),
        status: JobStatus::Success,
        reason_code: None,
        message: "Export completed.".to_string(),
        cleanup: None,
        perf,
    };
    let finalize_result = finalizer::finalize_outputs(&plan, &success_report, inputs.app_log_dir, logger);

    match finalize_result {
        Ok((_renamed, report_path)) => {
            let _ = fsm.transition(EngineState::Done, serde_json::json!({}));
            on_status("success");

            let report = success_report;
            let report_path = Some(report_path);
            logger.log("render.success", serde_json::json!({ "jobId": plan.job_id }));

            if let Some(path) = &ledger_path {
                let _ = ledger::complete_ledger(
                    path,
                    LedgerState::Done,
                    None,
                    &now_iso(inputs.now_unix_ms),
                    inputs.pid,
                    inputs.now_unix_ms,
                );
                let _ = std::fs::remove_file(path);
            }

            RenderAlbumOutcome { report, report_path, cleanup: None }
        }
        Err(finalize_err) => {
            let reason = finalize_err.reason_code();
            let _ = fsm.transition(EngineState::Failed, serde_json::json!({ "reason": reason }));

            let report = RenderReport {
                schema_family: RenderReport::SCHEMA_FAMILY.to_string(),
                schema_version: RenderReport::SCHEMA_VERSION,
                environment: inputs.environment.clone(),
                plan: plan.clone(),
                tracks: track_reports,
                status: JobStatus::Failed,
                reason_code: Some(reason_code_str(reason)),
                message: match &finalize_err {
                    FinalizeError::PartialMissingOrEmpty(_) => reason.user_message().to_string(),
                    _ => reason.user_message().to_string(),
                },
                cleanup: None,
                perf,
            };
            logger.log("render.failed", serde_json::json!({ "error": finalize_err.to_string() }));
            let report_path = finalizer::write_render_report(&report, &plan.export_folder, inputs.app_log_dir).ok();

            let cleanup_engine = CleanupEngine::with_no_child();
            let cleanup_ctx = CleanupContext {
                job_id: plan.job_id.clone(),
                export_folder: plan.export_folder.clone(),
                base_export_root: plan.export_folder.clone(),
                reason,
                tmp_candidates: vec![],
                partial_candidates: plan.tracks.iter().map(|t| t.partial_path.clone()).collect(),
                planned_final_outputs: vec![],
                completed_final_outputs: vec![],
                render_report_path: report_path.clone(),
                created_folder,
                had_preexisting_content,
                kill_wait: Duration::from_millis(inputs.settings.cleanup_kill_wait_ms),
            };
            let cleanup_stats = cleanup_engine.run(cleanup_ctx, logger).await;

            if let Some(path) = &ledger_path {
                let _ = ledger::complete_ledger(
                    path,
                    LedgerState::Failed,
                    Some(report.reason_code.as_deref().unwrap_or("UNCAUGHT")),
                    &now_iso(inputs.now_unix_ms),
                    inputs.pid,
                    inputs.now_unix_ms,
                );
                let _ = std::fs::remove_file(path);
            }

            let mut report = report;
            report.cleanup = Some(cleanup_stats.clone());
            RenderAlbumOutcome { report, report_path, cleanup: Some(cleanup_stats) }
        }
    }
}

fn build_ledger_record(plan: &Plan, now_unix_ms: u64) -> crate::core::domain::JobLedgerRecord {
    crate::core::domain::JobLedgerRecord {
        schema_family: crate::core::domain::JobLedgerRecord::SCHEMA_FAMILY.to_string(),
        schema_version: crate::core::domain::JobLedgerRecord::SCHEMA_VERSION,
        job_id: plan.job_id.clone(),
        created_at: now_iso(now_unix_ms),
        export_folder: plan.export_folder.clone(),
        tmp_paths: plan.tracks.iter().map(|t| t.partial_path.clone()).collect(),
        output_final_paths: plan.tracks.iter().map(|t| t.output_final_path.clone()).collect(),
        log_path: None,
        state: LedgerState::InProgress,
        cleanup_complete: false,
        completed_at: None,
        reason_code: None,
    }
}

fn build_early_failure_report(inputs: &RenderAlbumInputs<'_>, reason: ReasonCode, message: String) -> RenderReport {
    RenderReport {
        schema_family: RenderReport::SCHEMA_FAMILY.to_string(),
        schema_version: RenderReport::SCHEMA_VERSION,
        environment: inputs.environment.clone(),
        plan: Plan {
            job_id: inputs.job_id.clone(),
            export_folder: PathBuf::new(),
            preset_key: String::new(),
            preset_decisions: crate::core::domain::PresetDecisions {
                ordering: crate::core::domain::PresetOrdering::Input,
                ordering_reason: String::new(),
                prefix_track_number: false,
                max_tracks: None,
            },
            image_path: PathBuf::new(),
            total_duration_sec: 0.0,
            tracks: vec![],
        },
        tracks: vec![],
        status: JobStatus::Failed,
        reason_code: Some(reason_code_str(reason)),
        message,
        cleanup: None,
        perf: crate::core::domain::PerfStats::default(),
    }
}
