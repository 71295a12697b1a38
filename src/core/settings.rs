//! Operator-tunable knobs (spec §4.6, §4.9, §6). The teacher reads its
//! `AppSettings` from a global `Inner.state`; here settings are loaded once
//! at startup and threaded explicitly into `Orchestrator::new`, so the
//! planner/executor/finalizer stay testable without a live `AppHandle`.

use serde::{Deserialize, Serialize};

pub const ENV_ALLOW_BIN_MISMATCH: &str = "ALBUMTOVIDEO_ALLOW_BIN_MISMATCH";
pub const ENV_EXPORT_BASE: &str = "ALBUM_TO_VIDEO_EXPORT_BASE";

fn default_watchdog_no_progress_ms() -> u64 {
    1100
}

fn default_track_wall_timeout_ms() -> u64 {
    10 * 60 * 1000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_progress_ewma_alpha() -> f64 {
    0.25
}

fn default_max_ledgers() -> usize {
    256
}

fn default_cleanup_kill_wait_ms() -> u64 {
    5_000
}

fn default_warmup_timeout_ms() -> u64 {
    10_000
}

fn default_probe_timeout_ms() -> u64 {
    8_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineSettings {
    /// No-progress watchdog window (spec §4.6 step 9). 0 disables the watchdog.
    #[serde(default = "default_watchdog_no_progress_ms")]
    pub watchdog_no_progress_ms: u64,
    /// Per-track wall-clock deadline; clamped to a 10s floor at use (spec §4.6 step 10).
    #[serde(default = "default_track_wall_timeout_ms")]
    pub track_wall_timeout_ms: u64,
    /// Partial-file / progress-staleness poll cadence (spec §4.6 step 6).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// EWMA smoothing factor for the reported `speed=Nx` samples (spec §4.6 step 5).
    #[serde(default = "default_progress_ewma_alpha")]
    pub progress_ewma_alpha: f64,
    /// Cap on ledger files scanned during startup recovery (spec §4.10 step 1).
    #[serde(default = "default_max_ledgers")]
    pub max_ledgers: usize,
    /// How long cleanup waits for the killed subprocess tree to exit (spec §4.9 step 1).
    #[serde(default = "default_cleanup_kill_wait_ms")]
    pub cleanup_kill_wait_ms: u64,
    /// Hard cap on the one-shot transcoder warmup (spec §4.11 step 3).
    #[serde(default = "default_warmup_timeout_ms")]
    pub warmup_timeout_ms: u64,
    /// Hard cap on a single probe invocation (spec §4.3).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Diagnostics-only bypass for a packaged binary hash mismatch (spec §4.2),
    /// normally read from `ALBUMTOVIDEO_ALLOW_BIN_MISMATCH`.
    #[serde(default)]
    pub allow_bin_mismatch: bool,
    /// Seeds the selected export folder for automation (spec §6), normally
    /// read from `ALBUM_TO_VIDEO_EXPORT_BASE`.
    #[serde(default)]
    pub export_base: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            watchdog_no_progress_ms: default_watchdog_no_progress_ms(),
            track_wall_timeout_ms: default_track_wall_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            progress_ewma_alpha: default_progress_ewma_alpha(),
            max_ledgers: default_max_ledgers(),
            cleanup_kill_wait_ms: default_cleanup_kill_wait_ms(),
            warmup_timeout_ms: default_warmup_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            allow_bin_mismatch: false,
            export_base: None,
        }
    }
}

impl EngineSettings {
    /// Builds the defaults, then overlays the two environment variables the
    /// spec reserves for operators/automation.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        settings.allow_bin_mismatch = std::env::var(ENV_ALLOW_BIN_MISMATCH)
            .map(|v| v == "1")
            .unwrap_or(false);
        settings.export_base = std::env::var(ENV_EXPORT_BASE).ok();
        settings
    }

    /// Per-track wall-clock deadline, floored at 10s (spec §4.6 step 10).
    pub fn effective_track_wall_timeout_ms(&self) -> u64 {
        self.track_wall_timeout_ms.max(10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let s = EngineSettings::default();
        assert_eq!(s.watchdog_no_progress_ms, 1100);
        assert_eq!(s.progress_ewma_alpha, 0.25);
    }

    #[test]
    fn wall_timeout_is_floored_at_10s() {
        let mut s = EngineSettings::default();
        s.track_wall_timeout_ms = 500;
        assert_eq!(s.effective_track_wall_timeout_ms(), 10_000);
    }

    #[test]
    fn deserializes_with_partial_json() {
        let s: EngineSettings = serde_json::from_str(r#"{"maxLedgers": 10}"#).unwrap();
        assert_eq!(s.max_ledgers, 10);
        assert_eq!(s.watchdog_no_progress_ms, 1100);
    }
}
