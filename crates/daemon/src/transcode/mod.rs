//! External transcoding tool
//!
//! The core only needs three things from the tool: a command that concatenates
//! a list of files, an exit status, and a way to probe a file. Everything else
//! about ffmpeg stays inside this module.

pub mod ffmpeg;

use crate::probe::{ProbeError, ProbeResult};
use std::path::{Path, PathBuf};
use tokio::process::Command;

pub use ffmpeg::{build_concat_command, escape_concat_path, write_concat_list, FfmpegTranscoder};

/// How audio is handled during concatenation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioMode {
    /// Copy audio packets unchanged.
    Copy,
    /// Re-encode audio to AAC (tolerates mismatched source audio).
    Aac,
}

/// One concatenation run: every file named in `list_file` into `output`.
#[derive(Debug, Clone)]
pub struct ConcatRequest {
    /// ffmpeg concat-demuxer list file.
    pub list_file: PathBuf,
    /// File to write.
    pub output: PathBuf,
    pub audio: AudioMode,
    /// Ask for hardware-accelerated decoding.
    pub hw_accel: bool,
}

/// Collaborator that performs the actual media work.
pub trait Transcoder: Send + Sync {
    /// Build (but do not spawn) the command for a concatenation.
    fn concat_command(&self, request: &ConcatRequest) -> Command;

    /// Inspect a file. Blocking; call from a blocking context.
    fn probe(&self, path: &Path) -> Result<ProbeResult, ProbeError>;
}
