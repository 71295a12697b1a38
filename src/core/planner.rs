//! C4: normalize input tracks, apply preset policy, reserve unique output
//! filenames, build per-track argument templates (spec §4.4).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use unicode_normalization::UnicodeNormalization;

use crate::core::domain::{
    Plan, PlannedTrack, Preset, PresetDecisions, PresetOrdering, TrackInput,
};
use crate::core::path_safety::{self, SafePath};
use crate::core::probe::{probe, ProbeResult};

const WINDOWS_RESERVED_BASENAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("{0}")]
    Invalid(#[from] crate::core::error::CoreError),
    #[error("{message}")]
    PresetCap { message: String },
    #[error("PROBE_FAILED: {audio_path}: {detail}")]
    ProbeFailed { audio_path: String, detail: String },
}

/// Strips control characters and forbidden filename characters, collapses
/// whitespace, applies Windows reserved-name and trailing-dot/space rules,
/// and normalizes to Unicode NFC (spec §4.4 step 3).
pub fn sanitize_output_base(raw: &str) -> String {
    let mut s: String = raw
        .chars()
        .map(|ch| match ch {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if (c as u32) <= 31 => '_',
            _ => ch,
        })
        .collect();

    // Collapse runs of whitespace to a single space.
    let collapsed: Vec<&str> = s.split_whitespace().collect();
    s = collapsed.join(" ");

    while s.ends_with(' ') || s.ends_with('.') {
        s.pop();
    }

    let normalized: String = s.nfc().collect();
    let upper = normalized.to_ascii_uppercase();
    let base_for_check = upper.split('.').next().unwrap_or("");
    let s = if WINDOWS_RESERVED_BASENAMES.contains(&base_for_check) {
        format!("_{normalized}")
    } else {
        normalized
    };

    if s.is_empty() {
        "Untitled".to_string()
    } else {
        s
    }
}

/// Prefixes with zero-padded `NN. ` when requested and a track number exists
/// (spec §4.4 step 5).
pub fn apply_track_number_prefix(base: &str, track_no: Option<u32>, prefix: bool) -> String {
    match (prefix, track_no) {
        (true, Some(n)) if n > 0 => format!("{n:02}. {base}"),
        _ => base.to_string(),
    }
}

/// Reserves a unique `<export_folder>/<stem>.mp4` path: tries `stem.mp4`,
/// then `stem (2).mp4` .. `stem (9999).mp4`, else a timestamp-suffixed name
/// (spec §4.4 step 6). `reserved` tracks paths claimed earlier in the same
/// planning pass.
pub fn reserve_output_path(export_folder: &Path, stem: &str, reserved: &mut HashSet<PathBuf>, now_unix_ms: u64) -> PathBuf {
    let mut candidate = export_folder.join(format!("{stem}.mp4"));
    if !candidate.exists() && !reserved.contains(&candidate) {
        reserved.insert(candidate.clone());
        return candidate;
    }
    for n in 2..=9999u32 {
        candidate = export_folder.join(format!("{stem} ({n}).mp4"));
        if !candidate.exists() && !reserved.contains(&candidate) {
            reserved.insert(candidate.clone());
            return candidate;
        }
    }
    candidate = export_folder.join(format!("{stem}-{now_unix_ms}.mp4"));
    reserved.insert(candidate.clone());
    candidate
}

/// Builds the frozen FFmpeg argument base up to (but excluding) `-progress`
/// and the output path (spec §6 command template). `audio_mode_args` is
/// supplied per-attempt by the executor since it may retry in AAC mode.
pub fn ffmpeg_args_base(image_path: &Path, audio_path: &Path, preset: &Preset) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-nostdin".into(),
        "-loglevel".into(),
        "error".into(),
        "-loop".into(),
        "1".into(),
        "-framerate".into(),
        "1".into(),
        "-i".into(),
        image_path.display().to_string(),
        "-i".into(),
        audio_path.display().to_string(),
        "-map".into(),
        "0:v:0".into(),
        "-map".into(),
        "1:a:0".into(),
    ];
    if let Some(filter) = preset.engine.video_filter() {
        args.push("-vf".into());
        args.push(filter);
    }
    args.push("-r".into());
    args.push("1".into());
    args.push("-vsync".into());
    args.push("cfr".into());
    args.extend(preset.engine.video_args());
    args
}

pub struct PlanInputs<'a> {
    pub tracks: &'a [TrackInput],
    pub image_path: &'a str,
    pub export_folder: &'a str,
    pub preset: &'a Preset,
}

/// Validates inputs, applies ordering/prefix/cap policy, sanitizes and
/// reserves output filenames, probes every track, and builds the `Plan`
/// (spec §4.4).
pub async fn plan(
    inputs: PlanInputs<'_>,
    ffprobe_path: Option<&Path>,
    ffmpeg_path: &Path,
    probe_timeout: std::time::Duration,
    job_id: impl Into<String>,
    now_unix_ms: u64,
) -> Result<Plan, PlanError> {
    let image_safe: SafePath = path_safety::ensure_existing_file(Path::new(inputs.image_path), "image")?;
    let export_safe: SafePath = path_safety::ensure_existing_dir(Path::new(inputs.export_folder), "export folder")?;
    path_safety::ensure_writable_dir(export_safe.as_path())?;

    if let Some(max) = inputs.preset.max_tracks {
        if inputs.tracks.len() as u32 > max {
            return Err(PlanError::PresetCap {
                message: format!(
                    "Preset \"{}\" supports up to {} track(s).",
                    inputs.preset.label, max
                ),
            });
        }
    }

    let all_have_track_no = !inputs.tracks.is_empty() && inputs.tracks.iter().all(TrackInput::has_track_no);
    let use_track_no_ordering =
        inputs.preset.ordering == PresetOrdering::TrackNoIfAllPresent && all_have_track_no;

    let (ordering, ordering_reason) = if use_track_no_ordering {
        (
            PresetOrdering::TrackNoIfAllPresent,
            "all tracks carry a positive track number".to_string(),
        )
    } else {
        (
            PresetOrdering::Input,
            "preset requests input order, or not every track has a track number".to_string(),
        )
    };

    let ordered: Vec<&TrackInput> = if use_track_no_ordering {
        let mut indexed: Vec<(usize, &TrackInput)> = inputs.tracks.iter().enumerate().collect();
        indexed.sort_by_key(|(idx, t)| (t.track_no.unwrap_or(0), *idx));
        indexed.into_iter().map(|(_, t)| t).collect()
    } else {
        inputs.tracks.iter().collect()
    };

    let mut reserved = HashSet::new();
    let mut planned_tracks = Vec::with_capacity(ordered.len());
    let mut total_duration_sec = 0.0;

    for track in ordered {
        let audio_safe = path_safety::ensure_existing_file(Path::new(&track.audio_path), "audio file")?;

        let probe_result: ProbeResult = probe(
            ffprobe_path,
            ffmpeg_path,
            audio_safe.as_path(),
            probe_timeout,
            None,
        )
        .await;
        if !probe_result.ok || probe_result.duration_sec <= 0.0 {
            return Err(PlanError::ProbeFailed {
                audio_path: track.audio_path.clone(),
                detail: probe_result.stderr_tail,
            });
        }

        let sanitized = sanitize_output_base(&track.output_base);
        let stem = apply_track_number_prefix(&sanitized, track.track_no, inputs.preset.prefix_track_number);
        let output_final_path = reserve_output_path(export_safe.as_path(), &stem, &mut reserved, now_unix_ms);
        let mut partial_os = output_final_path.clone().into_os_string();
        partial_os.push(".partial");
        let partial_path = PathBuf::from(partial_os);

        let args_base = ffmpeg_args_base(image_safe.as_path(), audio_safe.as_path(), inputs.preset);

        total_duration_sec += probe_result.duration_sec;
        planned_tracks.push(PlannedTrack {
            audio_path: audio_safe.into_path_buf(),
            track_no: track.track_no,
            duration_sec: probe_result.duration_sec,
            output_base: stem,
            output_final_path,
            partial_path,
            ffmpeg_args_base: args_base,
        });
    }

    Ok(Plan {
        job_id: job_id.into(),
        export_folder: export_safe.into_path_buf(),
        preset_key: inputs.preset.key.to_string(),
        preset_decisions: PresetDecisions {
            ordering,
            ordering_reason,
            prefix_track_number: inputs.preset.prefix_track_number,
            max_tracks: inputs.preset.max_tracks,
        },
        image_path: image_safe.into_path_buf(),
        total_duration_sec,
        tracks: planned_tracks,
    })
}

/// Built-in preset table (ambient addition, grounded on the teacher's own
/// keyed preset tables in `ffui_core::domain::preset`).
pub fn builtin_presets() -> Vec<Preset> {
    use crate::core::domain::StaticVideoEngine;

    vec![
        Preset {
            key: "album_ep",
            label: "Album / EP",
            ordering: PresetOrdering::TrackNoIfAllPresent,
            prefix_track_number: true,
            max_tracks: None,
            engine: Box::new(StaticVideoEngine {
                filter: Some("scale=1280:-2".to_string()),
                args: vec!["-c:v".into(), "libx264".into(), "-crf".into(), "18".into()],
            }),
        },
        Preset {
            key: "single_track",
            label: "Single / Track",
            ordering: PresetOrdering::Input,
            prefix_track_number: false,
            max_tracks: Some(1),
            engine: Box::new(StaticVideoEngine {
                filter: Some("scale=1280:-2".to_string()),
                args: vec!["-c:v".into(), "libx264".into(), "-crf".into(), "18".into()],
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_forbidden_characters() {
        assert_eq!(sanitize_output_base("a/b:c*d"), "a_b_c_d");
    }

    #[test]
    fn sanitize_collapses_whitespace_and_trims_trailing_dots() {
        assert_eq!(sanitize_output_base("  Track   One.  "), "Track One");
    }

    #[test]
    fn sanitize_handles_windows_reserved_names() {
        assert_eq!(sanitize_output_base("con"), "_con");
    }

    #[test]
    fn sanitize_defaults_to_untitled_when_empty() {
        assert_eq!(sanitize_output_base("   "), "Untitled");
    }

    #[test]
    fn prefix_applies_only_with_positive_track_no() {
        assert_eq!(apply_track_number_prefix("Song", Some(3), true), "03. Song");
        assert_eq!(apply_track_number_prefix("Song", None, true), "Song");
        assert_eq!(apply_track_number_prefix("Song", Some(3), false), "Song");
    }

    #[test]
    fn reserve_output_path_avoids_collisions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Song.mp4"), b"").unwrap();
        let mut reserved = HashSet::new();
        let path = reserve_output_path(dir.path(), "Song", &mut reserved, 0);
        assert_eq!(path, dir.path().join("Song (2).mp4"));
    }

    #[tokio::test]
    async fn preset_max_tracks_guard_rejects_before_probing() {
        let export_dir = tempfile::tempdir().unwrap();
        let image_path = export_dir.path().join("cover.jpg");
        std::fs::write(&image_path, b"not a real image, just needs to exist").unwrap();

        let tracks = vec![
            TrackInput { audio_path: "missing-a.wav".to_string(), output_base: "Track A".to_string(), track_no: Some(1) },
            TrackInput { audio_path: "missing-b.wav".to_string(), output_base: "Track B".to_string(), track_no: Some(2) },
        ];

        let presets = builtin_presets();
        let preset = presets.iter().find(|p| p.key == "single_track").unwrap();

        let inputs = PlanInputs {
            tracks: &tracks,
            image_path: image_path.to_str().unwrap(),
            export_folder: export_dir.path().to_str().unwrap(),
            preset,
        };

        let err = plan(inputs, None, Path::new("ffmpeg"), std::time::Duration::from_millis(10), "scenario-s6", 0)
            .await
            .expect_err("two tracks must exceed the single_track cap of 1");

        assert_eq!(err.to_string(), "Preset \"Single / Track\" supports up to 1 track(s).");
    }
}
