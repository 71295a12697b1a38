mod app_state;
mod commands;
mod core;
mod sync_ext;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tauri::Manager;

use crate::app_state::{AppState, EventLogger};
use crate::core::integrity::{self, BinaryContract, BinaryContractEntry, BinaryKind};
use crate::core::ledger;
use crate::core::logger::{self, JsonlLogger, Logger};
use crate::core::planner;
use crate::core::settings::EngineSettings;

const SESSION_LOG_KEEP: usize = 10;

fn platform_rel_path(name: &str) -> String {
    if cfg!(windows) {
        format!("bin/{name}.exe")
    } else {
        format!("bin/{name}")
    }
}

fn build_binary_contract() -> BinaryContract {
    let mut entries = HashMap::new();
    entries.insert(
        BinaryKind::Ffmpeg,
        BinaryContractEntry {
            rel_path: platform_rel_path("ffmpeg"),
            sha256: String::new(),
            runtime_sha256: None,
            required: true,
        },
    );
    entries.insert(
        BinaryKind::Ffprobe,
        BinaryContractEntry {
            rel_path: platform_rel_path("ffprobe"),
            sha256: String::new(),
            runtime_sha256: None,
            required: false,
        },
    );
    BinaryContract {
        key: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        entries,
    }
}

fn locate_system_binary(name: &str) -> Option<PathBuf> {
    let exe_name = if cfg!(windows) { format!("{name}.exe") } else { name.to_string() };
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).map(|dir| dir.join(&exe_name)).find(|p| p.is_file())
}

fn resolve_binaries(resources_root: Option<&Path>, contract: &BinaryContract) -> HashMap<BinaryKind, PathBuf> {
    let mut resolved = HashMap::new();
    for (kind, entry) in &contract.entries {
        let fallback = locate_system_binary(kind.name());
        if let Some(path) = integrity::resolve_binary_path(resources_root, &entry.rel_path, fallback.as_deref()) {
            resolved.insert(*kind, path);
        }
    }
    resolved
}

/// Scans the seeded export base (if any) for stray `.partial`/`.tmp` files
/// left over from a crash and removes what it can, mirroring the per-job
/// sweep `ledger::recover_in_progress` does for tracked jobs (spec §4.10,
/// §6 "startup.partial_scan").
fn startup_partial_scan(export_base: Option<&Path>) -> serde_json::Value {
    let Some(base) = export_base else {
        return serde_json::json!({ "scanned": false });
    };

    let mut found = 0u64;
    let mut removed = 0u64;
    if let Ok(entries) = std::fs::read_dir(base) {
        for entry in entries.flatten() {
            let path = entry.path();
            let is_stray = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.ends_with(".partial") || name.contains(".tmp"));
            if is_stray {
                found += 1;
                if std::fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
    }

    serde_json::json!({ "scanned": true, "found": found, "removed": removed })
}

#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    tauri::Builder::default()
        .plugin(tauri_plugin_opener::init())
        .plugin(tauri_plugin_dialog::init())
        .invoke_handler(tauri::generate_handler![
            commands::dialogs::select_audios,
            commands::dialogs::select_image,
            commands::dialogs::select_folder,
            commands::presets::list_presets,
            commands::metadata::read_metadata,
            commands::metadata::probe_audio,
            commands::fs_ops::ensure_dir,
            commands::fs_ops::open_folder,
            commands::render::render_album,
            commands::render::cancel_render,
            commands::diagnostics::export_diagnostics,
        ])
        .setup(|app| {
            let settings = EngineSettings::from_env();

            let app_log_dir = app
                .path()
                .app_log_dir()
                .unwrap_or_else(|_| std::env::temp_dir().join("Album-to-Video"));
            let ledgers_dir = app_log_dir.join("job-ledgers");
            std::fs::create_dir_all(&app_log_dir)?;
            std::fs::create_dir_all(&ledgers_dir)?;

            let pid = std::process::id();
            let now_unix_ts = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let session_log_path = logger::session_log_path(&app_log_dir, now_unix_ts, pid);
            let jsonl = JsonlLogger::open(&session_log_path)?;
            let event_logger = std::sync::Arc::new(EventLogger::new(jsonl));
            let _ = logger::rotate_session_logs(&app_log_dir, SESSION_LOG_KEEP);

            let contract = build_binary_contract();
            let resources_root = app.path().resource_dir().ok();
            let resolved = resolve_binaries(resources_root.as_deref(), &contract);
            let packaged = !cfg!(debug_assertions);
            let integrity_state =
                integrity::verify_contract(&contract, &resolved, packaged, settings.allow_bin_mismatch, event_logger.as_ref());

            let ffmpeg_path = resolved
                .get(&BinaryKind::Ffmpeg)
                .cloned()
                .unwrap_or_else(|| PathBuf::from(if cfg!(windows) { "ffmpeg.exe" } else { "ffmpeg" }));
            let ffprobe_path = resolved.get(&BinaryKind::Ffprobe).cloned();

            let recovery = ledger::recover_in_progress(&ledgers_dir, settings.max_ledgers, event_logger.as_ref());
            let startup_job_recovery = serde_json::to_value(&recovery).unwrap_or(serde_json::Value::Null);

            let partial_scan = startup_partial_scan(settings.export_base.as_deref().map(Path::new));
            event_logger.log("startup.partial_scan", partial_scan.clone());

            let selected_base = settings.export_base.as_ref().map(PathBuf::from);

            let state = AppState {
                settings,
                integrity: integrity_state,
                ffmpeg_path,
                ffprobe_path,
                presets: planner::builtin_presets(),
                selected_base: std::sync::Mutex::new(selected_base),
                cancel: std::sync::Mutex::new(crate::core::executor::CancelToken::new()),
                logger: event_logger,
                app_log_dir,
                ledgers_dir,
                last_render_report: std::sync::Mutex::new(None),
                progress_status_tail: std::sync::Mutex::new(serde_json::json!({})),
                startup_partial_scan: std::sync::Mutex::new(partial_scan),
                startup_job_recovery: std::sync::Mutex::new(startup_job_recovery),
                finalize_summary: std::sync::Mutex::new(serde_json::json!({})),
                pid,
                app_version: app.package_info().version.to_string(),
            };

            app.manage(state);
            Ok(())
        })
        .run(tauri::generate_context!())
        .expect("error while running tauri application");
}
