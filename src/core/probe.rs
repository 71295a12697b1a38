//! C3: ask the probe binary (or a fallback transcoder invocation) for
//! duration/codec metadata, with timeouts (spec §4.3).

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeMethod {
    Ffprobe,
    FallbackTranscode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub ok: bool,
    pub duration_sec: f64,
    pub method: Option<ProbeMethod>,
    pub stderr_tail: String,
}

fn tail(bytes: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= max {
        text.into_owned()
    } else {
        text[text.len() - max..].to_string()
    }
}

/// Runs `ffprobe -show_entries stream=codec_type,duration:format=duration`
/// and extracts duration from the first audio stream, falling back to the
/// format-level duration (spec §4.3 step 1).
async fn run_ffprobe(ffprobe_path: &Path, audio_path: &Path, timeout_dur: Duration) -> anyhow::Result<f64> {
    let mut cmd = Command::new(ffprobe_path);
    cmd.args([
        "-v",
        "error",
        "-show_entries",
        "stream=codec_type,duration:format=duration",
        "-of",
        "json",
    ])
    .arg(audio_path)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    let child = cmd.spawn()?;
    let output = timeout(timeout_dur, child.wait_with_output()).await??;
    if !output.status.success() {
        anyhow::bail!("ffprobe exited with {:?}", output.status.code());
    }

    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    let streams = parsed.get("streams").and_then(|s| s.as_array());
    let mut has_audio = false;
    let mut stream_duration = None;
    if let Some(streams) = streams {
        for s in streams {
            if s.get("codec_type").and_then(|v| v.as_str()) == Some("audio") {
                has_audio = true;
                if let Some(d) = s.get("duration").and_then(|v| v.as_str()).and_then(|v| v.parse::<f64>().ok()) {
                    stream_duration = Some(d);
                }
            }
        }
    }
    if !has_audio {
        anyhow::bail!("no audio stream present");
    }
    let format_duration = parsed
        .get("format")
        .and_then(|f| f.get("duration"))
        .and_then(|v| v.as_str())
        .and_then(|v| v.parse::<f64>().ok());

    let duration = stream_duration.or(format_duration).unwrap_or(0.0);
    if duration <= 0.0 {
        anyhow::bail!("no positive duration reported");
    }
    Ok(duration)
}

/// `-f null -` dry run to confirm the transcoder can at least open the file
/// when ffprobe is unavailable (spec §4.3 step 2).
async fn run_transcoder_null_output(ffmpeg_path: &Path, audio_path: &Path, timeout_dur: Duration) -> anyhow::Result<()> {
    let mut cmd = Command::new(ffmpeg_path);
    cmd.args(["-v", "error", "-i"])
        .arg(audio_path)
        .args(["-f", "null", "-"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    let child = cmd.spawn()?;
    let output = timeout(timeout_dur, child.wait_with_output()).await??;
    if !output.status.success() {
        anyhow::bail!("transcoder null-output probe failed");
    }
    Ok(())
}

/// Full probe strategy (spec §4.3): try `ffprobe`, else fall back to a
/// transcoder dry-run plus an external duration estimate from the tag
/// reader (`tags::read_duration_estimate`, out of scope for this function so
/// callers can supply whichever estimate their metadata layer produced).
pub async fn probe(
    ffprobe_path: Option<&Path>,
    ffmpeg_path: &Path,
    audio_path: &Path,
    timeout_dur: Duration,
    fallback_duration_estimate: Option<f64>,
) -> ProbeResult {
    if let Some(ffprobe_path) = ffprobe_path {
        match run_ffprobe(ffprobe_path, audio_path, timeout_dur).await {
            Ok(duration_sec) => {
                return ProbeResult {
                    ok: true,
                    duration_sec,
                    method: Some(ProbeMethod::Ffprobe),
                    stderr_tail: String::new(),
                };
            }
            Err(err) => {
                if run_transcoder_null_output(ffmpeg_path, audio_path, timeout_dur)
                    .await
                    .is_ok()
                {
                    if let Some(estimate) = fallback_duration_estimate {
                        if estimate > 0.0 {
                            return ProbeResult {
                                ok: true,
                                duration_sec: estimate,
                                method: Some(ProbeMethod::FallbackTranscode),
                                stderr_tail: String::new(),
                            };
                        }
                    }
                }
                return ProbeResult {
                    ok: false,
                    duration_sec: 0.0,
                    method: None,
                    stderr_tail: tail(err.to_string().as_bytes(), 64 * 1024),
                };
            }
        }
    }

    if run_transcoder_null_output(ffmpeg_path, audio_path, timeout_dur).await.is_ok() {
        if let Some(estimate) = fallback_duration_estimate {
            if estimate > 0.0 {
                return ProbeResult {
                    ok: true,
                    duration_sec: estimate,
                    method: Some(ProbeMethod::FallbackTranscode),
                    stderr_tail: String::new(),
                };
            }
        }
    }

    ProbeResult {
        ok: false,
        duration_sec: 0.0,
        method: None,
        stderr_tail: "probe failed: no ffprobe binary and no usable fallback estimate".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_fails_cleanly() {
        let result = probe(
            None,
            Path::new("/definitely/does/not/exist/ffmpeg"),
            Path::new("/definitely/does/not/exist/audio.wav"),
            Duration::from_millis(500),
            None,
        )
        .await;
        assert!(!result.ok);
    }
}
