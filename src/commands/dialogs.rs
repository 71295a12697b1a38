//! Thin wrappers around `tauri-plugin-dialog`'s blocking picker API (spec
//! §6). These are the only commands that touch a GUI toolkit directly;
//! everything downstream works with the plain path strings they return.

use tauri::{AppHandle, State};
use tauri_plugin_dialog::DialogExt;

use crate::app_state::AppState;

const AUDIO_EXTENSIONS: &[&str] = &["wav", "mp3", "m4a", "flac", "aac", "ogg"];
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

#[tauri::command]
pub fn select_audios(app: AppHandle) -> Result<Vec<String>, String> {
    let files = app
        .dialog()
        .file()
        .add_filter("Audio", AUDIO_EXTENSIONS)
        .blocking_pick_files();

    Ok(files
        .unwrap_or_default()
        .into_iter()
        .filter_map(|f| f.into_path().ok())
        .map(|p| p.display().to_string())
        .collect())
}

#[tauri::command]
pub fn select_image(app: AppHandle) -> Result<Option<String>, String> {
    let file = app
        .dialog()
        .file()
        .add_filter("Image", IMAGE_EXTENSIONS)
        .blocking_pick_file();

    Ok(file.and_then(|f| f.into_path().ok()).map(|p| p.display().to_string()))
}

/// Remembers the chosen folder as the session's base export folder so
/// `ensure-dir` can validate containment against it (spec §6 "ensure-dir").
#[tauri::command]
pub fn select_folder(app: AppHandle, state: State<'_, AppState>) -> Result<Option<String>, String> {
    let Some(folder) = app.dialog().file().blocking_pick_folder().and_then(|f| f.into_path().ok()) else {
        return Ok(None);
    };

    *state.selected_base.lock().unwrap_or_else(|p| p.into_inner()) = Some(folder.clone());
    Ok(Some(folder.display().to_string()))
}
