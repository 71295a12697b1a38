//! Diagnostics bundle export: redact user-identifying path segments, cap the
//! log tail at 200 events, and cap the overall bundle at 1 MiB (spec §6
//! "Persisted state", §8 invariant 9).

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const LOG_TAIL_LIMIT: usize = 200;
pub const BUNDLE_SIZE_CAP_BYTES: usize = 1024 * 1024;

/// Rewrites `/Users/<name>/`, `C:\Users\<name>\`, and `/Volumes/<name>/`
/// segments to a fixed placeholder, leaving the rest of the path untouched
/// (spec §6 "Path redaction rules").
pub fn redact_paths(input: &str) -> String {
    let unix_users = Regex::new(r"/Users/[^/\\]+/").unwrap();
    let windows_users = Regex::new(r"C:\\Users\\[^\\]+\\").unwrap();
    let volumes = Regex::new(r"/Volumes/[^/\\]+/").unwrap();

    let redacted = unix_users.replace_all(input, "/Users/{USER}/");
    let redacted = windows_users.replace_all(&redacted, r"C:\Users\{USER}\");
    volumes.replace_all(&redacted, "/Volumes/{VOLUME}/").into_owned()
}

fn redact_value(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(redact_paths(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(redact_value).collect()),
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, redact_value(v))).collect()),
        other => other,
    }
}

/// Keeps at most the newest [`LOG_TAIL_LIMIT`] events, redacting every
/// string field along the way, and reports whether truncation happened
/// (spec §8 invariant 9: 220 inputs → exactly 200 outputs, `truncated=true`).
pub fn build_log_tail(events: &[Value]) -> (Vec<Value>, bool) {
    let truncated = events.len() > LOG_TAIL_LIMIT;
    let start = events.len().saturating_sub(LOG_TAIL_LIMIT);
    let tail = events[start..].iter().cloned().map(redact_value).collect();
    (tail, truncated)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsBundle {
    pub schema_family: String,
    pub schema_version: u32,
    pub app_version: String,
    pub engine: Value,
    pub log_tail: Vec<Value>,
    pub log_tail_truncated: bool,
    pub progress_status_tail: Value,
    pub startup_partial_scan: Value,
    pub startup_job_recovery: Value,
    pub finalize_summary: Value,
    /// Only present when the latest render report serializes under the size cap.
    pub render_report: Option<Value>,
}

impl DiagnosticsBundle {
    pub const SCHEMA_FAMILY: &'static str = "diagnostics";
    pub const SCHEMA_VERSION: u32 = 1;
}

pub struct DiagnosticsInputs {
    pub app_version: String,
    pub engine: Value,
    pub raw_log_events: Vec<Value>,
    pub progress_status_tail: Value,
    pub startup_partial_scan: Value,
    pub startup_job_recovery: Value,
    pub finalize_summary: Value,
    pub render_report: Option<Value>,
}

/// Builds the full bundle, redacting the log tail and dropping the render
/// report if including it would push the bundle over the 1 MiB cap.
pub fn build_bundle(inputs: DiagnosticsInputs) -> DiagnosticsBundle {
    let (log_tail, log_tail_truncated) = build_log_tail(&inputs.raw_log_events);

    let mut bundle = DiagnosticsBundle {
        schema_family: DiagnosticsBundle::SCHEMA_FAMILY.to_string(),
        schema_version: DiagnosticsBundle::SCHEMA_VERSION,
        app_version: inputs.app_version,
        engine: redact_value(inputs.engine),
        log_tail,
        log_tail_truncated,
        progress_status_tail: redact_value(inputs.progress_status_tail),
        startup_partial_scan: redact_value(inputs.startup_partial_scan),
        startup_job_recovery: redact_value(inputs.startup_job_recovery),
        finalize_summary: redact_value(inputs.finalize_summary),
        render_report: None,
    };

    if let Some(report) = inputs.render_report {
        let redacted = redact_value(report);
        let mut with_report = bundle.clone();
        with_report.render_report = Some(redacted);
        if serde_json::to_vec(&with_report).map(|b| b.len()).unwrap_or(usize::MAX) <= BUNDLE_SIZE_CAP_BYTES {
            bundle = with_report;
        }
    }

    bundle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_unix_windows_and_volumes_paths() {
        assert_eq!(redact_paths("/Users/alice/Music/x.wav"), "/Users/{USER}/Music/x.wav");
        assert_eq!(
            redact_paths(r"C:\Users\alice\Music\x.wav"),
            r"C:\Users\{USER}\Music\x.wav"
        );
        assert_eq!(redact_paths("/Volumes/MyDrive/x.wav"), "/Volumes/{VOLUME}/x.wav");
    }

    #[test]
    fn two_hundred_twenty_inputs_truncate_to_two_hundred() {
        let events: Vec<Value> = (0..220).map(|i| serde_json::json!({"event": format!("e{i}")})).collect();
        let (tail, truncated) = build_log_tail(&events);
        assert_eq!(tail.len(), 200);
        assert!(truncated);
        assert_eq!(tail[0]["event"], "e20");
    }

    #[test]
    fn no_truncation_when_under_the_limit() {
        let events: Vec<Value> = (0..10).map(|i| serde_json::json!({"event": format!("e{i}")})).collect();
        let (tail, truncated) = build_log_tail(&events);
        assert_eq!(tail.len(), 10);
        assert!(!truncated);
    }

    #[test]
    fn oversized_render_report_is_dropped_but_bundle_still_builds() {
        let huge = "x".repeat(BUNDLE_SIZE_CAP_BYTES + 1);
        let inputs = DiagnosticsInputs {
            app_version: "0.1.0".into(),
            engine: serde_json::json!({}),
            raw_log_events: vec![],
            progress_status_tail: serde_json::json!({}),
            startup_partial_scan: serde_json::json!({}),
            startup_job_recovery: serde_json::json!({}),
            finalize_summary: serde_json::json!({}),
            render_report: Some(serde_json::json!({ "blob": huge })),
        };
        let bundle = build_bundle(inputs);
        assert!(bundle.render_report.is_none());
    }
}
