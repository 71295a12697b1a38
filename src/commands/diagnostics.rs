//! `export-diagnostics` (spec §6): writes a redacted diagnostics bundle next
//! to the session logs (or into a caller-supplied folder).

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tauri::State;

use crate::app_state::AppState;
use crate::core::diagnostics::{self, DiagnosticsInputs};
use crate::core::logger::Logger;

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExportDiagnosticsPayload {
    pub export_folder: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDiagnosticsResponse {
    pub ok: bool,
    pub diagnostics_path: String,
}

#[tauri::command]
pub fn export_diagnostics(
    state: State<'_, AppState>,
    payload: ExportDiagnosticsPayload,
) -> Result<ExportDiagnosticsResponse, String> {
    let dest_dir = match payload.export_folder {
        Some(p) => PathBuf::from(p),
        None => state.app_log_dir.clone(),
    };
    fs::create_dir_all(&dest_dir).map_err(|e| e.to_string())?;

    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let path = dest_dir.join(format!("diagnostics-{ts}.json"));

    let engine = serde_json::to_value(&state.integrity).unwrap_or(serde_json::Value::Null);

    let inputs = DiagnosticsInputs {
        app_version: state.app_version.clone(),
        engine,
        raw_log_events: state.logger.tail_snapshot(),
        progress_status_tail: state.progress_status_tail.lock().unwrap_or_else(|p| p.into_inner()).clone(),
        startup_partial_scan: state.startup_partial_scan.lock().unwrap_or_else(|p| p.into_inner()).clone(),
        startup_job_recovery: state.startup_job_recovery.lock().unwrap_or_else(|p| p.into_inner()).clone(),
        finalize_summary: state.finalize_summary.lock().unwrap_or_else(|p| p.into_inner()).clone(),
        render_report: state.last_render_report.lock().unwrap_or_else(|p| p.into_inner()).clone(),
    };

    let bundle = diagnostics::build_bundle(inputs);
    let json = serde_json::to_vec_pretty(&bundle).map_err(|e| e.to_string())?;
    fs::write(&path, json).map_err(|e| e.to_string())?;

    state.logger.log("diagnostics.exported", serde_json::json!({ "path": path.display().to_string() }));

    Ok(ExportDiagnosticsResponse { ok: true, diagnostics_path: path.display().to_string() })
}
