//! Data model shared across the render pipeline (spec §3).
//!
//! Everything here is plain data: construction and validation live in the
//! modules that own each invariant (`planner` builds `Plan`, `fsm` owns
//! `EngineState` transitions, …). Keeping the structs free of behavior makes
//! them trivially `Serialize` for the render report / job ledger without
//! fighting the derive.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// `ordering` policy chosen by a preset (spec §3 Preset, §4.4 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresetOrdering {
    Input,
    TrackNoIfAllPresent,
}

/// Per-platform video argument/filter-graph fragments a preset contributes
/// to the FFmpeg command template (spec §6). Modeled as a producer rather
/// than a fixed value so a preset can branch on the host platform, matching
/// the invariant in spec §3 ("`engine.video` is a producer function").
pub trait VideoEngine: Send + Sync {
    /// Extra `-vf`/`-filter_complex` fragment, already validated for shell safety.
    fn video_filter(&self) -> Option<String>;
    /// Video encoder args, e.g. `["-c:v", "libx264", "-crf", "18"]`.
    fn video_args(&self) -> Vec<String>;
}

/// A preset that always emits the same fragments, used by the built-in
/// preset table (`planner::builtin_presets`).
pub struct StaticVideoEngine {
    pub filter: Option<String>,
    pub args: Vec<String>,
}

impl VideoEngine for StaticVideoEngine {
    fn video_filter(&self) -> Option<String> {
        self.filter.clone()
    }

    fn video_args(&self) -> Vec<String> {
        self.args.clone()
    }
}

/// Immutable, keyed preset (spec §3 Preset).
pub struct Preset {
    pub key: &'static str,
    pub label: &'static str,
    pub ordering: PresetOrdering,
    pub prefix_track_number: bool,
    pub max_tracks: Option<u32>,
    pub engine: Box<dyn VideoEngine>,
}

/// A single track as supplied by the caller, before planning (spec §4.4 inputs).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInput {
    pub audio_path: String,
    pub output_base: String,
    pub track_no: Option<u32>,
}

impl TrackInput {
    pub fn has_track_no(&self) -> bool {
        self.track_no.is_some_and(|n| n > 0)
    }
}

/// Planned track (spec §3 Planned Track).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedTrack {
    pub audio_path: PathBuf,
    pub track_no: Option<u32>,
    pub duration_sec: f64,
    pub output_base: String,
    pub output_final_path: PathBuf,
    pub partial_path: PathBuf,
    /// Frozen FFmpeg argument base (everything up to but excluding the
    /// `-progress`/output tail, which the executor appends per attempt).
    pub ffmpeg_args_base: Vec<String>,
}

/// Which ordering/prefix/cap policy the planner actually applied (spec §3
/// Plan.preset_decisions, spec §6 glossary "Preset decisions").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetDecisions {
    pub ordering: PresetOrdering,
    pub ordering_reason: String,
    pub prefix_track_number: bool,
    pub max_tracks: Option<u32>,
}

/// Fully materialized render plan (spec §3 Plan).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub job_id: String,
    pub export_folder: PathBuf,
    pub preset_key: String,
    pub preset_decisions: PresetDecisions,
    pub image_path: PathBuf,
    pub total_duration_sec: f64,
    pub tracks: Vec<PlannedTrack>,
}

/// Audio handling chosen for a track (spec §3 Track Report `audio_mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AudioMode {
    Copy,
    AacFallback,
}

/// Provenance of the most recent progress signal (spec §3, §4.7, glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressSignal {
    None,
    Time,
    Size,
    Both,
}

/// Progress model used to compute `rawProgress` (spec §3, glossary "WALLCLOCK model").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProgressModel {
    Media,
    Wallclock,
}

/// Per-track outcome (spec §3 Track Report).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackReport {
    pub index: usize,
    pub start_ts: u64,
    pub end_ts: u64,
    pub duration_ms: u64,
    pub encode_ms: u64,
    pub spawn_ms: u64,
    pub first_write_ms: Option<u64>,
    pub first_progress_ms: Option<u64>,
    pub exit_code: Option<i32>,
    pub stderr_tail: String,
    pub audio_mode: AudioMode,
    pub fallback_reason: Option<String>,
    pub progress_signal: ProgressSignal,
    pub progress_model: ProgressModel,
}

/// Terminal job outcome (spec §3 Render Report `status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Success,
    Failed,
    Cancelled,
    Timeout,
}

/// Environment stamps captured into the render report (spec §3 Render Report).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentStamp {
    pub app_version: String,
    pub runtime_version: String,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub ffmpeg_hash: Option<String>,
    pub ffprobe_hash: Option<String>,
    pub contract_key: String,
    pub bypass_used: bool,
    pub unpackaged: bool,
}

/// Aggregate min/avg/max over a set of per-track timing samples.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerfStats {
    pub min_ms: u64,
    pub avg_ms: u64,
    pub max_ms: u64,
    pub total_ms: u64,
}

impl PerfStats {
    pub fn from_samples(samples: &[u64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let total: u64 = samples.iter().sum();
        Self {
            min_ms: *samples.iter().min().unwrap(),
            max_ms: *samples.iter().max().unwrap(),
            avg_ms: total / samples.len() as u64,
            total_ms: total,
        }
    }
}

/// Cleanup counters surfaced in the render report (spec §4.9).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupStats {
    pub deleted_tmp_count: u64,
    pub deleted_final_count: u64,
    pub delete_failed_count: u64,
    #[serde(default)]
    pub delete_failed_examples: Vec<String>,
    pub removed_empty_folder: bool,
    pub wait_outcome: String,
}

/// Top-level, schema-stamped render report (spec §3 Render Report, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderReport {
    pub schema_family: String,
    pub schema_version: u32,
    pub environment: EnvironmentStamp,
    pub plan: Plan,
    pub tracks: Vec<TrackReport>,
    pub status: JobStatus,
    pub reason_code: Option<String>,
    pub message: String,
    pub cleanup: Option<CleanupStats>,
    pub perf: PerfStats,
}

impl RenderReport {
    pub const SCHEMA_FAMILY: &'static str = "renderReport";
    pub const SCHEMA_VERSION: u32 = 1;
}

/// Job ledger state (spec §3 Job Ledger Record).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerState {
    InProgress,
    Done,
    Failed,
    Cancelled,
}

/// On-disk job ledger record (spec §3 Job Ledger Record, §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLedgerRecord {
    pub schema_family: String,
    pub schema_version: u32,
    pub job_id: String,
    pub created_at: String,
    pub export_folder: PathBuf,
    pub tmp_paths: Vec<PathBuf>,
    pub output_final_paths: Vec<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub state: LedgerState,
    pub cleanup_complete: bool,
    pub completed_at: Option<String>,
    pub reason_code: Option<String>,
}

impl JobLedgerRecord {
    pub const SCHEMA_FAMILY: &'static str = "jobLedger";
    pub const SCHEMA_VERSION: u32 = 1;
}
