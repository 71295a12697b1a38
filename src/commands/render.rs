//! `render-album` and `cancel-render` (spec §6): drives one end-to-end
//! render job and streams its progress back as `render-status`/
//! `render-progress` events.

use serde::{Deserialize, Serialize};
use tauri::{AppHandle, Emitter, Manager, State};

use crate::app_state::AppState;
use crate::core::domain::{EnvironmentStamp, JobStatus, TrackInput};
use crate::core::executor::{CancelReason, RealTranscoder};
use crate::core::orchestrator::{self, RenderAlbumInputs};
use crate::core::planner::PlanInputs;
use crate::core::progress::ProgressSnapshot;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderAlbumPayload {
    pub tracks: Vec<TrackInput>,
    pub image_path: String,
    pub export_folder: String,
    pub preset_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderAlbumResponse {
    pub ok: bool,
    pub export_folder: String,
    pub rendered: Vec<String>,
    pub report_path: Option<String>,
    pub debug_log_path: Option<String>,
    pub error: Option<RenderErrorPayload>,
}

fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn environment_stamp(state: &AppState, app_version: &str) -> EnvironmentStamp {
    let ffmpeg_hash = state
        .integrity
        .binaries
        .iter()
        .find(|b| b.kind_name == "ffmpeg")
        .and_then(|b| b.hash.clone());
    let ffprobe_hash = state
        .integrity
        .binaries
        .iter()
        .find(|b| b.kind_name == "ffprobe")
        .and_then(|b| b.hash.clone());

    EnvironmentStamp {
        app_version: app_version.to_string(),
        runtime_version: std::env::consts::OS.to_string(),
        ffmpeg_path: state.ffmpeg_path.display().to_string(),
        ffprobe_path: state.ffprobe_path.as_ref().map(|p| p.display().to_string()).unwrap_or_default(),
        ffmpeg_hash,
        ffprobe_hash,
        contract_key: state.integrity.contract_key.clone(),
        bypass_used: state.integrity.bypass_used,
        unpackaged: state.integrity.unpackaged,
    }
}

#[tauri::command]
pub async fn render_album(
    app: AppHandle,
    state: State<'_, AppState>,
    payload: RenderAlbumPayload,
) -> Result<RenderAlbumResponse, String> {
    let preset = state
        .presets
        .iter()
        .find(|p| p.key == payload.preset_key)
        .ok_or_else(|| format!("unknown preset \"{}\"", payload.preset_key))?;

    let plan_inputs = PlanInputs {
        tracks: &payload.tracks,
        image_path: &payload.image_path,
        export_folder: &payload.export_folder,
        preset,
    };

    let cancel = state.fresh_cancel_token();
    let job_id = uuid::Uuid::new_v4().to_string();
    let environment = environment_stamp(&state, &state.app_version);

    let inputs = RenderAlbumInputs {
        job_id,
        plan_inputs,
        ffprobe_path: state.ffprobe_path.as_deref(),
        ffmpeg_path: &state.ffmpeg_path,
        settings: &state.settings,
        integrity: &state.integrity,
        environment,
        ledgers_dir: &state.ledgers_dir,
        app_log_dir: &state.app_log_dir,
        pid: state.pid,
        now_unix_ms: now_unix_ms(),
    };

    let transcoder = RealTranscoder { ffmpeg_path: state.ffmpeg_path.clone() };

    let app_for_status = app.clone();
    let on_status = move |phase: &str| {
        if let Some(state) = app_for_status.try_state::<AppState>() {
            state.record_status(phase);
        }
        let _ = app_for_status.emit("render-status", serde_json::json!({ "phase": phase }));
    };

    let app_for_progress = app.clone();
    let on_progress = move |snapshot: ProgressSnapshot| {
        if let Some(state) = app_for_progress.try_state::<AppState>() {
            state.record_progress(&snapshot);
        }
        let _ = app_for_progress.emit("render-progress", &snapshot);
    };

    let outcome = orchestrator::render_album(
        &transcoder,
        inputs,
        &cancel,
        state.logger.as_ref(),
        &on_status,
        &on_progress,
    )
    .await;

    *state.last_render_report.lock().unwrap_or_else(|p| p.into_inner()) =
        Some(serde_json::to_value(&outcome.report).unwrap_or(serde_json::Value::Null));

    let ok = outcome.report.status == JobStatus::Success;
    let export_folder = outcome.report.plan.export_folder.display().to_string();
    let report_path = outcome.report_path.map(|p| p.display().to_string());
    let debug_log_path = Some(state.logger.path().display().to_string());

    let rendered = if ok {
        outcome
            .report
            .plan
            .tracks
            .iter()
            .map(|t| t.output_final_path.display().to_string())
            .collect()
    } else {
        Vec::new()
    };

    let error = if ok {
        None
    } else {
        Some(RenderErrorPayload {
            code: outcome.report.reason_code.clone().unwrap_or_else(|| "UNCAUGHT".to_string()),
            message: outcome.report.message.clone(),
        })
    };

    Ok(RenderAlbumResponse { ok, export_folder, rendered, report_path, debug_log_path, error })
}

/// Cancels the currently active render job, if any (spec §6 "cancel-render").
#[tauri::command]
pub fn cancel_render(state: State<'_, AppState>) -> Result<bool, String> {
    state.cancel.lock().unwrap_or_else(|p| p.into_inner()).cancel(CancelReason::Cancelled);
    Ok(true)
}
