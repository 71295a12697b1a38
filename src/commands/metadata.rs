//! `read-metadata` and `probe-audio` (spec §6): per-track inspection used by
//! the frontend to prefill track metadata and to pre-flight a file before it
//! enters a render job.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tauri::State;

use crate::app_state::AppState;
use crate::core::tags::{self, TrackMetadata};
use crate::core::probe::{self, ProbeResult};

#[tauri::command]
pub fn read_metadata(path: String) -> Result<TrackMetadata, String> {
    tags::read_metadata(Path::new(&path)).map_err(|e| e.to_string())
}

#[tauri::command]
pub async fn probe_audio(state: State<'_, AppState>, path: String) -> Result<ProbeResult, String> {
    let ffprobe_path: Option<PathBuf> = state.ffprobe_path.clone();
    let ffmpeg_path = state.ffmpeg_path.clone();
    let timeout = Duration::from_millis(state.settings.probe_timeout_ms);

    Ok(probe::probe(
        ffprobe_path.as_deref(),
        &ffmpeg_path,
        Path::new(&path),
        timeout,
        None,
    )
    .await)
}
