//! C7: pure-function progress model (spec §4.7, glossary "WALLCLOCK model").
//! Invoked from the executor (C6) and the orchestrator (C11); holds no state
//! of its own, consistent with spec §9's "small state object owned by the
//! executor, Progress Reporter is a pure function of that state".

use serde::{Deserialize, Serialize};

use crate::core::domain::{ProgressModel, ProgressSignal};

/// Cap applied to every progress fraction emitted before the job actually
/// reaches `DONE` (spec §4.7, §8 invariant 1).
pub const PRE_SUCCESS_CAP: f64 = 0.999;

pub fn clamp_unit(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// Clamps a progress fraction to the pre-success display cap unless the job
/// has already finished.
pub fn cap_pre_success(raw: f64, is_final_success: bool) -> f64 {
    if is_final_success {
        clamp_unit(raw)
    } else {
        clamp_unit(raw).min(PRE_SUCCESS_CAP)
    }
}

/// Time-based raw progress for the MEDIA model: summed out-time over the
/// planned job total (spec §4.6 step 3, §4.7).
pub fn media_raw_progress(done_ms: u64, total_ms: u64) -> f64 {
    if total_ms == 0 {
        return 0.0;
    }
    clamp_unit(done_ms as f64 / total_ms as f64)
}

/// Elapsed-over-expected raw progress for the WALLCLOCK model, used when the
/// audio stream is being copied rather than re-encoded (spec §4.6 step 3).
pub fn wallclock_raw_progress(elapsed_ms: u64, expected_ms: u64) -> f64 {
    if expected_ms == 0 {
        return 0.0;
    }
    clamp_unit(elapsed_ms as f64 / expected_ms as f64)
}

/// `job_expected_work_ms = clamp(max(7000, planned_job_total_ms * 0.01), 2500, 20000)`
/// (spec §4.6 step 3). `observed_first_signal_ms` and `avg_bytes_per_sec` are
/// threaded through but intentionally unused: the spec's own open-question
/// note says the original leaves them as reserved, unused inputs, and this
/// preserves that rather than inventing behavior for them.
pub fn compute_job_expected_work_ms(
    planned_job_total_ms: u64,
    _observed_first_signal_ms: Option<u64>,
    _avg_bytes_per_sec: Option<f64>,
) -> u64 {
    let base = (planned_job_total_ms as f64 * 0.01).max(7000.0);
    base.clamp(2500.0, 20000.0) as u64
}

/// MEDIA-model total: the planned job total in ms, floored at 7000 (spec
/// §4.6 step 3).
pub fn media_job_total_ms(planned_job_total_ms: u64) -> u64 {
    planned_job_total_ms.max(7000)
}

/// Derives provenance for the most recent update: `time` only if the
/// time-based source advanced, `size` only if the size fallback
/// contributed, `both` if both did, `none` before any signal. Once any
/// track has emitted a real signal, a caller may upgrade a later `none` to
/// `time` to avoid flicker (spec §4.7) via [`upgrade_none_after_real_signal`].
pub fn derive_signal(time_advanced: bool, size_contributed: bool) -> ProgressSignal {
    match (time_advanced, size_contributed) {
        (true, true) => ProgressSignal::Both,
        (true, false) => ProgressSignal::Time,
        (false, true) => ProgressSignal::Size,
        (false, false) => ProgressSignal::None,
    }
}

/// Avoids visible flicker back to `none` once a real signal has ever been
/// observed in this job (spec §4.7).
pub fn upgrade_none_after_real_signal(signal: ProgressSignal, any_real_signal_seen: bool) -> ProgressSignal {
    if signal == ProgressSignal::None && any_real_signal_seen {
        ProgressSignal::Time
    } else {
        signal
    }
}

/// Size-based fallback progress when the time signal has gone stale (spec
/// §4.6 step 6): `duration_ms * clamp(partial_bytes / audio_bytes, 0, 0.999)`.
pub fn size_based_progress_ms(duration_ms: u64, partial_bytes: u64, audio_bytes: u64) -> u64 {
    if audio_bytes == 0 {
        return 0;
    }
    let fraction = (partial_bytes as f64 / audio_bytes as f64).clamp(0.0, 0.999);
    (duration_ms as f64 * fraction) as u64
}

/// A single outbound progress payload (spec §4.6 step 7, §6 `render-progress`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub track_index: usize,
    pub track_count: usize,
    pub percent_track: f64,
    pub percent_total: f64,
    pub indeterminate: bool,
    pub is_final: bool,
    pub phase: Phase,
    pub job_total_ms: u64,
    pub job_done_ms: u64,
    pub raw_progress: f64,
    pub has_real_signal: bool,
    pub progress_signal: ProgressSignal,
    pub progress_model: ProgressModel,
    pub job_started_at_ms: u64,
    pub job_elapsed_ms: u64,
    pub job_expected_work_ms: u64,
    pub audio_path: Option<String>,
    pub output_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    Preparing,
    Encoding,
    Finalizing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_success_progress_never_reaches_full() {
        assert_eq!(cap_pre_success(1.5, false), PRE_SUCCESS_CAP);
        assert_eq!(cap_pre_success(1.0, false), PRE_SUCCESS_CAP);
    }

    #[test]
    fn success_allows_full_progress() {
        assert_eq!(cap_pre_success(1.0, true), 1.0);
    }

    #[test]
    fn expected_work_ms_respects_clamp_bounds() {
        assert_eq!(compute_job_expected_work_ms(0, None, None), 7000);
        assert_eq!(compute_job_expected_work_ms(100_000, None, None), 7000);
        assert_eq!(compute_job_expected_work_ms(3_000_000, None, None), 20000);
    }

    #[test]
    fn signal_provenance_matches_inputs() {
        assert_eq!(derive_signal(true, true), ProgressSignal::Both);
        assert_eq!(derive_signal(true, false), ProgressSignal::Time);
        assert_eq!(derive_signal(false, true), ProgressSignal::Size);
        assert_eq!(derive_signal(false, false), ProgressSignal::None);
    }

    #[test]
    fn none_upgrades_to_time_after_real_signal_seen() {
        assert_eq!(
            upgrade_none_after_real_signal(ProgressSignal::None, true),
            ProgressSignal::Time
        );
        assert_eq!(
            upgrade_none_after_real_signal(ProgressSignal::None, false),
            ProgressSignal::None
        );
    }

    #[test]
    fn size_based_progress_is_clamped_below_full_track() {
        let ms = size_based_progress_ms(10_000, 10_000, 10_000);
        assert!(ms < 10_000);
    }
}
