//! Probe module for checking that a video file is decodable.
//!
//! Runs ffprobe against a file and parses its JSON output into the few facts the
//! merge pipeline cares about: stream counts and container duration.

use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Time allowed for one ffprobe invocation.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe ran but reported failure.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// ffprobe did not finish in time and was killed.
    #[error("ffprobe timed out after {0:?}")]
    TimedOut(Duration),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of probing a video file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeResult {
    /// Number of video streams.
    pub video_streams: usize,
    /// Number of audio streams.
    pub audio_streams: usize,
    /// Container duration in seconds (0 when unknown).
    pub duration_secs: f64,
    /// Size reported by the container in bytes (0 when unknown).
    pub size_bytes: u64,
}

impl ProbeResult {
    /// A file is playable when it has a video stream and a positive duration.
    pub fn is_playable(&self) -> bool {
        self.video_streams > 0 && self.duration_secs > 0.0
    }
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub size: Option<String>,
    }
}

/// Probes a video file with ffprobe.
///
/// Runs `ffprobe -v error -print_format json -show_streams -show_format <path>`,
/// killing it if it exceeds `timeout`.
pub fn probe_file(ffprobe: &Path, path: &Path, timeout: Duration) -> Result<ProbeResult, ProbeError> {
    let mut child = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_streams",
            "-show_format",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    // Drain pipes on helper threads so a chatty child can't block on a full pipe
    let stdout_reader = child.stdout.take().map(|mut out| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = out.read_to_end(&mut buf);
            buf
        })
    });
    let stderr_reader = child.stderr.take().map(|mut err| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = err.read_to_end(&mut buf);
            buf
        })
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ProbeError::TimedOut(timeout));
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    let stdout = stdout_reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    let stderr = stderr_reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();

    if !status.success() {
        let stderr = String::from_utf8_lossy(&stderr);
        return Err(ProbeError::FfprobeFailed(format!(
            "ffprobe exited with status {}: {}",
            status,
            stderr.trim()
        )));
    }

    parse_ffprobe_output(&String::from_utf8_lossy(&stdout))
}

/// Parses ffprobe JSON output into a ProbeResult.
pub fn parse_ffprobe_output(json_str: &str) -> Result<ProbeResult, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let streams = ffprobe.streams.unwrap_or_default();
    let format = ffprobe.format.ok_or_else(|| {
        ProbeError::ParseError("Missing format information in ffprobe output".to_string())
    })?;

    let count = |kind: &str| {
        streams
            .iter()
            .filter(|s| s.codec_type.as_deref() == Some(kind))
            .count()
    };

    let duration_secs = format
        .duration
        .as_ref()
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite())
        .unwrap_or(0.0);

    let size_bytes = format
        .size
        .as_ref()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    Ok(ProbeResult {
        video_streams: count("video"),
        audio_streams: count("audio"),
        duration_secs,
        size_bytes,
    })
}
