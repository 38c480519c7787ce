//! Helpers shared by unit tests.
//!
//! `FakeTranscoder` stands in for ffmpeg/ffprobe: its concat command is a
//! `sh` script that joins the listed files byte for byte, and its probe
//! reports one second of video per thousand bytes.

use crate::probe::{ProbeError, ProbeResult};
use crate::transcode::{AudioMode, ConcatRequest, Transcoder};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::process::Command;

const CONCAT_SCRIPT: &str = r#"
n=0
if [ -n "$COUNTER" ]; then
    echo x >> "$COUNTER"
    n=$(wc -l < "$COUNTER")
fi
if [ "$n" -gt 0 ] && [ "$n" -le "$HANG" ]; then
    : > "$OUT"
    exec sleep 30
fi
if [ "$AUDIO" = copy ] && [ "$FAIL_COPY" = 1 ]; then
    echo 'Could not find tag for codec pcm_alaw in stream #1' >&2
    exit 1
fi
sed -e "s/^file '//" -e "s/'\$//" "$LIST" | while IFS= read -r f; do cat "$f"; done > "$OUT"
"#;

/// Creates `path` (and parents) holding `size` bytes.
pub fn write_file(path: &Path, size: usize) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, vec![b'v'; size]).unwrap();
}

/// `sh -c <script>`
pub fn shell(script: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(script);
    command
}

/// Lines in a file; 0 when it does not exist.
pub fn count_lines(path: &Path) -> usize {
    fs::read_to_string(path).map(|s| s.lines().count()).unwrap_or(0)
}

#[derive(Debug, Clone, Default)]
pub struct FakeTranscoder {
    counter: Option<PathBuf>,
    hang_first: u32,
    fail_audio_copy: bool,
    unplayable: Vec<String>,
}

impl FakeTranscoder {
    /// Records every concat run in `<dir>/tool-runs`.
    pub fn counting(dir: &Path) -> Self {
        Self {
            counter: Some(dir.join("tool-runs")),
            ..Self::default()
        }
    }

    /// The first `n` concat runs hang until killed.
    pub fn hanging_first(mut self, n: u32) -> Self {
        self.hang_first = n;
        self
    }

    /// Concat runs that copy audio fail.
    pub fn failing_audio_copy(mut self) -> Self {
        self.fail_audio_copy = true;
        self
    }

    /// Probing a file whose name ends with `suffix` fails.
    pub fn with_unplayable(mut self, suffix: &str) -> Self {
        self.unplayable.push(suffix.to_string());
        self
    }

    /// Concat runs started so far.
    pub fn tool_runs(&self) -> usize {
        self.counter.as_deref().map_or(0, count_lines)
    }
}

impl Transcoder for FakeTranscoder {
    fn concat_command(&self, request: &ConcatRequest) -> Command {
        let mut command = shell(CONCAT_SCRIPT);
        command
            .env("LIST", &request.list_file)
            .env("OUT", &request.output)
            .env("HANG", self.hang_first.to_string())
            .env("FAIL_COPY", if self.fail_audio_copy { "1" } else { "0" })
            .env(
                "AUDIO",
                match request.audio {
                    AudioMode::Copy => "copy",
                    AudioMode::Aac => "aac",
                },
            )
            .env("COUNTER", self.counter.as_deref().unwrap_or(Path::new("")));
        command
    }

    fn probe(&self, path: &Path) -> Result<ProbeResult, ProbeError> {
        let name = path.to_string_lossy();
        if self.unplayable.iter().any(|suffix| name.ends_with(suffix.as_str())) {
            return Err(ProbeError::FfprobeFailed("moov atom not found".to_string()));
        }
        let size_bytes = fs::metadata(path)?.len();
        Ok(ProbeResult {
            video_streams: 1,
            audio_streams: 1,
            duration_secs: size_bytes as f64 / 1000.0,
            size_bytes,
        })
    }
}
