//! `ensure-dir` and `open-folder` (spec §6): filesystem operations scoped to
//! the session's selected base folder.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tauri::State;

use crate::app_state::AppState;
use crate::commands::reveal;
use crate::core::path_safety;
use crate::core::planner;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsureDirPayload {
    pub album_folder_name: String,
}

/// Creates `<selectedBase>/<sanitized album folder name>`, refusing if it
/// would land outside the selected base (spec §4.1 containment, §4.4 step 3
/// for the sanitation rules reused from the planner).
#[tauri::command]
pub fn ensure_dir(state: State<'_, AppState>, payload: EnsureDirPayload) -> Result<String, String> {
    let base = state
        .selected_base
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .clone()
        .ok_or_else(|| "no base folder has been selected yet".to_string())?;

    let sanitized = planner::sanitize_output_base(&payload.album_folder_name);
    let target = base.join(&sanitized);
    fs::create_dir_all(&target).map_err(|e| e.to_string())?;

    let safe = path_safety::ensure_existing_dir(&target, "album folder").map_err(|e| e.to_string())?;
    if !path_safety::is_within_base(&base, safe.as_path()) {
        return Err("album folder escapes the selected base folder".to_string());
    }

    Ok(safe.as_path().display().to_string())
}

fn has_stray_partial(dir: &Path) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    entries.flatten().any(|entry| {
        entry
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| name.ends_with(".partial"))
    })
}

/// Reveals `path` in the platform file manager, refusing while the folder
/// still holds a stray `.partial` file from an in-progress or interrupted
/// render (spec §6 "open-folder").
#[tauri::command]
pub fn open_folder(path: String) -> Result<bool, String> {
    let target = PathBuf::from(&path);
    let scan_dir: &Path = if target.is_dir() { &target } else { target.parent().unwrap_or(&target) };

    if has_stray_partial(scan_dir) {
        return Err("this folder still has an in-progress export; try again once it finishes".to_string());
    }

    reveal::reveal_path_in_folder(&path)?;
    Ok(true)
}
