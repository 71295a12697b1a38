//! C6: spawn the transcoder, parse its key/value progress stream, fuse time
//! and output-file-size signals, enforce per-track wall and no-progress
//! watchdog timeouts, and produce a track result or typed error (spec §4.6).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::core::domain::{AudioMode, ProgressModel, ProgressSignal, TrackReport};
use crate::core::error::ReasonCode;
use crate::core::kill_tree::{kill_tree, prepare_for_tree_kill};
use crate::core::logger::Logger;
use crate::core::progress::{self, Phase, ProgressSnapshot};

/// Markers in stderr that indicate the failure is an audio-copy
/// compatibility problem the orchestrator can retry once in AAC mode
/// (spec §4.6 exit handling).
pub const AUDIO_COPY_FALLBACK_MARKERS: [&str; 6] = [
    "could not find tag for codec",
    "codec not currently supported in container",
    "error initializing output stream",
    "could not write header",
    "tag mp4a",
    "invalid argument",
];

pub fn matches_audio_copy_fallback_marker(stderr_tail: &str) -> bool {
    let lower = stderr_tail.to_ascii_lowercase();
    AUDIO_COPY_FALLBACK_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// First stderr line matching a fallback marker, truncated to 240 chars
/// (spec §4.11 step 5).
pub fn first_fallback_reason(stderr_tail: &str) -> Option<String> {
    let lower_lines: Vec<&str> = stderr_tail.lines().collect();
    for line in lower_lines {
        let lower = line.to_ascii_lowercase();
        if AUDIO_COPY_FALLBACK_MARKERS.iter().any(|m| lower.contains(m)) {
            let mut truncated = line.to_string();
            truncated.truncate(240);
            return Some(truncated);
        }
    }
    None
}

/// Builds a [`tokio::process::Command`] for one attempt; kept trait-shaped
/// so tests can inject a fake transcoder (a short shell script emitting
/// canned progress lines) in place of the real binary (spec §9 test
/// tooling).
pub trait Transcoder: Send + Sync {
    fn command(&self, args: &[String]) -> Command;
}

pub struct RealTranscoder {
    pub ffmpeg_path: PathBuf,
}

impl Transcoder for RealTranscoder {
    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(args);
        cmd
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Cancelled,
    Timeout,
}

/// Shared cancellation token; the executor selects on it instead of sharing
/// mutable state with the orchestrator (spec §9 "Cancellation shared flag").
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(AtomicBool, std::sync::Mutex<Option<CancelReason>>)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, reason: CancelReason) {
        self.inner.0.store(true, Ordering::SeqCst);
        let mut guard = self.inner.1.lock().unwrap_or_else(|p| p.into_inner());
        if guard.is_none() {
            *guard = Some(reason);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.0.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.inner.1.lock().unwrap_or_else(|p| p.into_inner())
    }
}

pub struct TrackExecutionInputs<'a> {
    pub job_id: &'a str,
    pub index: usize,
    pub partial_path: &'a Path,
    pub planned_duration_sec: f64,
    pub audio_mode: AudioMode,
    pub planned_job_total_ms: u64,
    pub audio_input_bytes: Option<u64>,
    pub watchdog_no_progress_ms: u64,
    pub wall_timeout: Duration,
    pub poll_interval: Duration,
    pub progress_ewma_alpha: f64,
    pub is_last_track: bool,
}

pub enum TrackOutcome {
    Success(TrackReport),
    Failed {
        report: TrackReport,
        reason: ReasonCode,
        retry_as_aac: bool,
    },
}

struct ProgressState {
    last_out_time_ms: u64,
    track_max_out_time_ms: u64,
    last_out_time_update: Option<Instant>,
    speed_ewma: Option<f64>,
    any_real_signal_seen: bool,
    first_write_ms: Option<u64>,
    first_progress_ms: Option<u64>,
}

impl ProgressState {
    fn new() -> Self {
        Self {
            last_out_time_ms: 0,
            track_max_out_time_ms: 0,
            last_out_time_update: None,
            speed_ewma: None,
            any_real_signal_seen: false,
            first_write_ms: None,
            first_progress_ms: None,
        }
    }
}

/// Runs exactly one track attempt. `args_base` is the planner's frozen
/// argument list (everything up to but excluding `-progress`/output); this
/// function appends `-progress pipe:1 -nostats -f mp4 <partial>` and the
/// audio-mode args itself (spec §4.6 steps 1-4).
pub async fn execute_track(
    transcoder: &dyn Transcoder,
    args_base: &[String],
    audio_args: &[String],
    inputs: TrackExecutionInputs<'_>,
    cancel: &CancelToken,
    logger: &dyn Logger,
    on_progress: &(dyn Fn(ProgressSnapshot) + Send + Sync),
) -> anyhow::Result<TrackOutcome> {
    if !inputs.partial_path.to_string_lossy().ends_with(".partial") {
        anyhow::bail!("output path does not end in .partial");
    }
    if inputs.planned_duration_sec <= 0.0 {
        return Ok(failed_report(&inputs, ReasonCode::ProbeFailed, None, String::new()));
    }

    let progress_model = if inputs.audio_mode == AudioMode::Copy {
        ProgressModel::Wallclock
    } else {
        ProgressModel::Media
    };
    let job_total_ms = progress::media_job_total_ms(inputs.planned_job_total_ms);
    let job_expected_work_ms = progress::compute_job_expected_work_ms(inputs.planned_job_total_ms, None, None);

    let mut full_args: Vec<String> = args_base.to_vec();
    full_args.extend(audio_args.iter().cloned());
    full_args.extend([
        "-movflags".into(),
        "+faststart".into(),
        "-shortest".into(),
        "-progress".into(),
        "pipe:1".into(),
        "-nostats".into(),
        "-f".into(),
        "mp4".into(),
        inputs.partial_path.display().to_string(),
    ]);

    let mut cmd = transcoder.command(&full_args);
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    prepare_for_tree_kill(&mut cmd);

    let spawn_started = Instant::now();
    let mut child: Child = cmd.spawn()?;
    let spawn_ms = spawn_started.elapsed().as_millis() as u64;
    let start_ts = now_unix_ms();

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let (stderr_tx, mut stderr_rx) = mpsc::unbounded_channel::<String>();
    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if stderr_tx.send(line).is_err() {
                break;
            }
        }
    });

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<String>();
    let progress_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if progress_tx.send(line).is_err() {
                break;
            }
        }
    });

    let mut stderr_tail = String::new();
    let mut state = ProgressState::new();
    let mut last_emit = Instant::now() - Duration::from_secs(1);
    let mut progress_ended = false;
    let mut progress_closed = false;
    let mut stderr_closed = false;
    let partial_path = inputs.partial_path.to_path_buf();
    let poll_interval = inputs.poll_interval.max(Duration::from_millis(1));
    let mut poll_timer = tokio::time::interval(poll_interval);
    let wall_deadline = Instant::now() + inputs.wall_timeout.max(Duration::from_secs(10));

    let exit_status = loop {
        tokio::select! {
            biased;

            line = progress_rx.recv(), if !progress_closed => {
                match line {
                    Some(line) => {
                        handle_progress_line(&line, &mut state, spawn_started, inputs.progress_ewma_alpha);
                        if line.trim() == "progress=end" {
                            progress_ended = true;
                        }
                        maybe_emit(
                            &inputs, &state, progress_model, job_total_ms, job_expected_work_ms,
                            spawn_started, progress_ended, &mut last_emit, on_progress,
                        );
                    }
                    None => progress_closed = true,
                }
            }

            line = stderr_rx.recv(), if !stderr_closed => {
                match line {
                    Some(line) => {
                        stderr_tail.push_str(&line);
                        stderr_tail.push('\n');
                        cap_tail(&mut stderr_tail, 64 * 1024);
                    }
                    None => stderr_closed = true,
                }
            }

            _ = poll_timer.tick() => {
                poll_partial_file(&partial_path, &mut state, spawn_started);
                if inputs.watchdog_no_progress_ms > 0 {
                    if let Some(last_update) = state.last_out_time_update {
                        let stale = last_update.elapsed() >= Duration::from_millis(1500)
                            && spawn_started.elapsed() >= Duration::from_millis(800);
                        if stale {
                            if let Some(audio_bytes) = inputs.audio_input_bytes {
                                if audio_bytes > 0 {
                                    if let Ok(meta) = std::fs::metadata(&partial_path) {
                                        let duration_ms = (inputs.planned_duration_sec * 1000.0) as u64;
                                        let size_ms = progress::size_based_progress_ms(duration_ms, meta.len(), audio_bytes);
                                        state.track_max_out_time_ms = state.track_max_out_time_ms.max(size_ms);
                                    }
                                }
                            }
                        }
                    }
                    let no_progress_elapsed = state
                        .last_out_time_update
                        .map(|t| t.elapsed())
                        .unwrap_or_else(|| spawn_started.elapsed());
                    if no_progress_elapsed >= Duration::from_millis(inputs.watchdog_no_progress_ms) {
                        let signal = progress::upgrade_none_after_real_signal(
                            if state.any_real_signal_seen { ProgressSignal::Time } else { ProgressSignal::None },
                            state.any_real_signal_seen,
                        );
                        let last_progress_at_ms =
                            state.last_out_time_update.map(|t| t.duration_since(spawn_started).as_millis() as u64);
                        logger.log(
                            "render.watchdog.timeout",
                            serde_json::json!({
                                "jobId": inputs.job_id,
                                "trackIndex": inputs.index,
                                "elapsedMs": spawn_started.elapsed().as_millis() as u64,
                                "progressSignal": serde_json::to_value(signal).unwrap_or(serde_json::Value::Null),
                                "lastProgressAtMs": last_progress_at_ms,
                            }),
                        );
                        let outcome = kill_tree(&mut child, Duration::from_secs(5)).await;
                        let _ = outcome;
                        drop(progress_task);
                        drop(stderr_task);
                        return Ok(failed_report(&inputs, ReasonCode::WatchdogTimeout, None, stderr_tail));
                    }
                }
                if cancel.is_cancelled() {
                    let reason = match cancel.reason() {
                        Some(CancelReason::Timeout) => ReasonCode::Timeout,
                        _ => ReasonCode::Cancelled,
                    };
                    let _ = kill_tree(&mut child, Duration::from_secs(5)).await;
                    drop(progress_task);
                    drop(stderr_task);
                    return Ok(failed_report(&inputs, reason, None, stderr_tail));
                }
            }

            _ = tokio::time::sleep_until(wall_deadline) => {
                let _ = kill_tree(&mut child, Duration::from_secs(5)).await;
                drop(progress_task);
                drop(stderr_task);
                return Ok(failed_report(&inputs, ReasonCode::Timeout, None, stderr_tail));
            }

            status = child.wait() => {
                break status?;
            }
        }
    };

    let _ = progress_task.await;
    let _ = stderr_task.await;
    while let Ok(line) = stderr_rx.try_recv() {
        stderr_tail.push_str(&line);
        stderr_tail.push('\n');
    }
    cap_tail(&mut stderr_tail, 64 * 1024);

    let end_ts = now_unix_ms();
    let encode_ms = end_ts.saturating_sub(start_ts);

    if !exit_status.success() {
        let retry_as_aac = inputs.audio_mode == AudioMode::Copy && matches_audio_copy_fallback_marker(&stderr_tail);
        let fallback_reason = first_fallback_reason(&stderr_tail);
        let report = TrackReport {
            index: inputs.index,
            start_ts,
            end_ts,
            duration_ms: encode_ms,
            encode_ms,
            spawn_ms,
            first_write_ms: state.first_write_ms,
            first_progress_ms: state.first_progress_ms,
            exit_code: exit_status.code(),
            stderr_tail,
            audio_mode: inputs.audio_mode,
            fallback_reason,
            progress_signal: ProgressSignal::None,
            progress_model,
        };
        return Ok(TrackOutcome::Failed {
            report,
            reason: ReasonCode::FfmpegExitNonzero,
            retry_as_aac,
        });
    }

    let report = TrackReport {
        index: inputs.index,
        start_ts,
        end_ts,
        duration_ms: encode_ms,
        encode_ms,
        spawn_ms,
        first_write_ms: state.first_write_ms,
        first_progress_ms: state.first_progress_ms,
        exit_code: exit_status.code(),
        stderr_tail,
        audio_mode: inputs.audio_mode,
        fallback_reason: None,
        progress_signal: ProgressSignal::Time,
        progress_model,
    };
    Ok(TrackOutcome::Success(report))
}

fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn cap_tail(buf: &mut String, max_bytes: usize) {
    if buf.len() > max_bytes {
        let start = buf.len() - max_bytes;
        let boundary = (start..buf.len()).find(|&i| buf.is_char_boundary(i)).unwrap_or(start);
        *buf = buf[boundary..].to_string();
    }
}

fn handle_progress_line(line: &str, state: &mut ProgressState, spawn_started: Instant, ewma_alpha: f64) {
    let Some((key, value)) = line.split_once('=') else {
        return;
    };
    match key {
        "speed" => {
            if let Ok(v) = value.trim_end_matches('x').trim().parse::<f64>() {
                state.speed_ewma = Some(match state.speed_ewma {
                    Some(prev) => ewma_alpha * v + (1.0 - ewma_alpha) * prev,
                    None => v,
                });
            }
        }
        "out_time_ms" | "out_time_us" => {
            if let Ok(raw) = value.trim().parse::<i64>() {
                let ms = if key == "out_time_us" { raw / 1000 } else { raw };
                let ms = ms.max(0) as u64;
                state.last_out_time_ms = ms;
                state.track_max_out_time_ms = state.track_max_out_time_ms.max(ms);
                state.last_out_time_update = Some(Instant::now());
                state.any_real_signal_seen = true;
                if state.first_progress_ms.is_none() {
                    state.first_progress_ms = Some(spawn_started.elapsed().as_millis() as u64);
                }
            }
        }
        _ => {}
    }
}

fn poll_partial_file(path: &Path, state: &mut ProgressState, spawn_started: Instant) {
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.len() > 0 && state.first_write_ms.is_none() {
            state.first_write_ms = Some(spawn_started.elapsed().as_millis() as u64);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn maybe_emit(
    inputs: &TrackExecutionInputs<'_>,
    state: &ProgressState,
    progress_model: ProgressModel,
    job_total_ms: u64,
    job_expected_work_ms: u64,
    spawn_started: Instant,
    is_final: bool,
    last_emit: &mut Instant,
    on_progress: &(dyn Fn(ProgressSnapshot) + Send + Sync),
) {
    if !is_final && last_emit.elapsed() < Duration::from_millis(500) {
        return;
    }
    *last_emit = Instant::now();

    let elapsed_ms = spawn_started.elapsed().as_millis() as u64;
    let raw = match progress_model {
        ProgressModel::Media => progress::media_raw_progress(state.track_max_out_time_ms, job_total_ms),
        ProgressModel::Wallclock => progress::wallclock_raw_progress(elapsed_ms, job_expected_work_ms),
    };
    let percent = progress::cap_pre_success(raw, false) * 100.0;
    let signal = progress::upgrade_none_after_real_signal(
        if state.any_real_signal_seen { ProgressSignal::Time } else { ProgressSignal::None },
        state.any_real_signal_seen,
    );

    let snapshot = ProgressSnapshot {
        track_index: inputs.index,
        track_count: 0,
        percent_track: if is_final { 99.9 } else { percent },
        percent_total: if is_final { 99.9 } else { percent },
        indeterminate: false,
        is_final,
        phase: if is_final && inputs.is_last_track { Phase::Finalizing } else { Phase::Encoding },
        job_total_ms,
        job_done_ms: state.track_max_out_time_ms,
        raw_progress: progress::cap_pre_success(raw, false),
        has_real_signal: state.any_real_signal_seen,
        progress_signal: signal,
        progress_model,
        job_started_at_ms: 0,
        job_elapsed_ms: elapsed_ms,
        job_expected_work_ms,
        audio_path: None,
        output_path: Some(inputs.partial_path.display().to_string()),
    };
    on_progress(snapshot);
}

fn failed_report(
    inputs: &TrackExecutionInputs<'_>,
    reason: ReasonCode,
    exit_code: Option<i32>,
    stderr_tail: String,
) -> TrackOutcome {
    let now = now_unix_ms();
    TrackOutcome::Failed {
        report: TrackReport {
            index: inputs.index,
            start_ts: now,
            end_ts: now,
            duration_ms: 0,
            encode_ms: 0,
            spawn_ms: 0,
            first_write_ms: None,
            first_progress_ms: None,
            exit_code,
            stderr_tail,
            audio_mode: inputs.audio_mode,
            fallback_reason: None,
            progress_signal: ProgressSignal::None,
            progress_model: if inputs.audio_mode == AudioMode::Copy {
                ProgressModel::Wallclock
            } else {
                ProgressModel::Media
            },
        },
        reason,
        retry_as_aac: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_audio_copy_fallback_markers() {
        assert!(matches_audio_copy_fallback_marker("Could not find tag for codec none"));
        assert!(!matches_audio_copy_fallback_marker("some unrelated error"));
    }

    #[test]
    fn extracts_first_matching_fallback_reason_truncated() {
        let stderr = format!("benign line\n{}", "x".repeat(300) + " could not write header");
        let reason = first_fallback_reason(&stderr).unwrap();
        assert!(reason.len() <= 240);
    }

    #[test]
    fn progress_line_parsing_tracks_monotonic_max() {
        let mut state = ProgressState::new();
        let spawn = Instant::now();
        handle_progress_line("out_time_ms=1000000", &mut state, spawn, 0.25);
        handle_progress_line("out_time_ms=500000", &mut state, spawn, 0.25);
        assert_eq!(state.track_max_out_time_ms, 1000);
        assert_eq!(state.last_out_time_ms, 500);
    }

    #[test]
    fn cancel_token_latches_first_reason() {
        let token = CancelToken::new();
        token.cancel(CancelReason::Cancelled);
        token.cancel(CancelReason::Timeout);
        assert_eq!(token.reason(), Some(CancelReason::Cancelled));
    }

    struct ShellTranscoder;
    impl Transcoder for ShellTranscoder {
        fn command(&self, args: &[String]) -> Command {
            let script = args.join(" ");
            if cfg!(windows) {
                let mut c = Command::new("cmd");
                c.args(["/C", &script]);
                c
            } else {
                let mut c = Command::new("sh");
                c.args(["-c", &script]);
                c
            }
        }
    }

    #[tokio::test]
    async fn watchdog_trips_when_no_progress_observed() {
        let dir = tempfile::tempdir().unwrap();
        let partial = dir.path().join("out.mp4.partial");
        let sleeper = if cfg!(windows) {
            "ping -n 6 127.0.0.1 > nul".to_string()
        } else {
            "sleep 5".to_string()
        };
        let inputs = TrackExecutionInputs {
            job_id: "job-watchdog-test",
            index: 0,
            partial_path: &partial,
            planned_duration_sec: 10.0,
            audio_mode: AudioMode::Copy,
            planned_job_total_ms: 10_000,
            audio_input_bytes: None,
            watchdog_no_progress_ms: 300,
            wall_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
            progress_ewma_alpha: 0.25,
            is_last_track: true,
        };
        let cancel = CancelToken::new();
        let outcome = execute_track(
            &ShellTranscoder,
            &[sleeper],
            &[],
            inputs,
            &cancel,
            &crate::core::logger::NullLogger,
            &|_snap| {},
        )
        .await
        .unwrap();
        match outcome {
            TrackOutcome::Failed { reason, .. } => assert_eq!(reason, ReasonCode::WatchdogTimeout),
            TrackOutcome::Success(_) => panic!("expected watchdog timeout"),
        }
    }
}
