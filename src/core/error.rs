//! Closed reason-code set and typed component errors (spec §7).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable, closed set of reason codes surfaced across the RPC boundary,
/// the render report, and the job ledger (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    Cancelled,
    Timeout,
    WatchdogTimeout,
    FfmpegExitNonzero,
    ProbeFailed,
    BinIntegrityBypass,
    Uncaught,
}

impl ReasonCode {
    /// Deterministic, user-safe message for each code (spec §7). Never
    /// includes raw stderr or other unvetted process output.
    pub fn user_message(self) -> &'static str {
        match self {
            ReasonCode::Cancelled => "Export cancelled.",
            ReasonCode::Timeout | ReasonCode::WatchdogTimeout => {
                "Export timed out. Try fewer tracks or shorter files, then export again."
            }
            ReasonCode::ProbeFailed => {
                "One or more audio files could not be read. Re-add the file or convert it to WAV, MP3, or M4A."
            }
            ReasonCode::FfmpegExitNonzero => {
                "Encoding failed for at least one track. Try again, or enable debug logging for details."
            }
            ReasonCode::BinIntegrityBypass => {
                "Integrity bypass is active (diagnostics mode). Rendering is disabled until packaging is fixed."
            }
            ReasonCode::Uncaught => "Something went wrong while exporting. See the debug log for details.",
        }
    }

    /// `WATCHDOG_TIMEOUT` maps to the user-visible status `TIMEOUT` (spec §7).
    pub fn status_reason(self) -> ReasonCode {
        match self {
            ReasonCode::WatchdogTimeout => ReasonCode::Timeout,
            other => other,
        }
    }
}

/// Typed errors for C1 (Path Safety) and C5 (Engine FSM). Every other
/// component propagates `anyhow::Result` with `.context(...)`, same as the
/// teacher's filesystem helpers; these two need stable variants because
/// callers match on them to pick a `ReasonCode`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid path for {label}: {reason}")]
    InvalidPath { label: String, reason: String },

    #[error("{label} not found: {path}")]
    NotFound { label: String, path: String },

    #[error("permission denied for {label}: {path}")]
    PermissionDenied { label: String, path: String },

    #[error("{path} escapes base directory {base}")]
    OutsideBase { base: String, path: String },

    #[error("cannot transition from {from:?} to {to:?}")]
    InvalidTransition { from: String, to: String },

    #[error("engine state is already terminal ({state:?})")]
    TerminalAlreadyCommitted { state: String },

    #[error("progress emitted after terminal state {state:?}")]
    ProgressAfterTerminal { state: String },
}

impl CoreError {
    /// Best-effort mapping used when an error needs to become a report reason
    /// code without a more specific classification from the caller.
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            CoreError::InvalidPath { .. }
            | CoreError::NotFound { .. }
            | CoreError::PermissionDenied { .. }
            | CoreError::OutsideBase { .. } => ReasonCode::Uncaught,
            CoreError::InvalidTransition { .. }
            | CoreError::TerminalAlreadyCommitted { .. }
            | CoreError::ProgressAfterTerminal { .. } => ReasonCode::Uncaught,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watchdog_timeout_reports_as_timeout_status() {
        assert_eq!(ReasonCode::WatchdogTimeout.status_reason(), ReasonCode::Timeout);
        assert_eq!(ReasonCode::Cancelled.status_reason(), ReasonCode::Cancelled);
    }

    #[test]
    fn messages_never_echo_raw_detail() {
        for code in [
            ReasonCode::Cancelled,
            ReasonCode::Timeout,
            ReasonCode::ProbeFailed,
            ReasonCode::FfmpegExitNonzero,
            ReasonCode::BinIntegrityBypass,
            ReasonCode::Uncaught,
        ] {
            assert!(!code.user_message().is_empty());
        }
    }
}
