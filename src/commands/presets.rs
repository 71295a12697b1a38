//! `list-presets` (spec §6): the read-only preset catalog the renderer picks
//! `presetKey` from. Presets themselves are a fixed built-in table (spec §3
//! Non-goals exclude a user-editable preset store), unlike the teacher's
//! persisted, reorderable preset list.

use serde::Serialize;
use tauri::State;

use crate::app_state::AppState;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetSummary {
    pub key: String,
    pub label: String,
    pub max_tracks: Option<u32>,
    pub prefix_track_number: bool,
}

#[tauri::command]
pub fn list_presets(state: State<'_, AppState>) -> Result<Vec<PresetSummary>, String> {
    Ok(state
        .presets
        .iter()
        .map(|p| PresetSummary {
            key: p.key.to_string(),
            label: p.label.to_string(),
            max_tracks: p.max_tracks,
            prefix_track_number: p.prefix_track_number,
        })
        .collect())
}
