//! ffmpeg concat commands and list files

use super::{AudioMode, ConcatRequest, Transcoder};
use crate::probe::{probe_file, ProbeError, ProbeResult, PROBE_TIMEOUT};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Transcoder backed by the ffmpeg and ffprobe binaries.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(ffmpeg: PathBuf, ffprobe: PathBuf) -> Self {
        Self { ffmpeg, ffprobe }
    }
}

impl Transcoder for FfmpegTranscoder {
    fn concat_command(&self, request: &ConcatRequest) -> Command {
        build_concat_command(&self.ffmpeg, request)
    }

    fn probe(&self, path: &Path) -> Result<ProbeResult, ProbeError> {
        probe_file(&self.ffprobe, path, PROBE_TIMEOUT)
    }
}

/// Build an ffmpeg concat-demuxer command
///
/// Creates a Command configured with:
/// - Optional `-hwaccel auto` on the decode side
/// - concat demuxer reading `request.list_file` with unsafe paths allowed
/// - Video stream copy; audio copied or re-encoded to AAC
/// - Overwrite of `request.output`
///
/// stdout is discarded and stderr piped so failures can be reported.
pub fn build_concat_command(ffmpeg: &Path, request: &ConcatRequest) -> Command {
    let mut cmd = Command::new(ffmpeg);

    cmd.arg("-hide_banner").arg("-nostdin");
    cmd.arg("-loglevel").arg("error");

    if request.hw_accel {
        cmd.arg("-hwaccel").arg("auto");
    }

    cmd.arg("-f").arg("concat");
    cmd.arg("-safe").arg("0");
    cmd.arg("-i").arg(&request.list_file);

    cmd.arg("-c:v").arg("copy");
    match request.audio {
        AudioMode::Copy => {
            cmd.arg("-c:a").arg("copy");
        }
        AudioMode::Aac => {
            cmd.arg("-c:a").arg("aac");
        }
    }

    // Output muxer is chosen explicitly since partial outputs carry a temp suffix
    cmd.arg("-f").arg("mp4");
    cmd.arg("-y").arg(&request.output);

    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    cmd
}

/// Quote a path for a concat list line (`'` becomes `'\''`).
pub fn escape_concat_path(path: &Path) -> String {
    path.to_string_lossy().replace('\'', "'\\''")
}

/// Writes a concat list with one `file '<path>'` line per input, in order.
pub fn write_concat_list(list_file: &Path, inputs: &[PathBuf]) -> io::Result<()> {
    if let Some(parent) = list_file.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(list_file)?;
    for input in inputs {
        writeln!(file, "file '{}'", escape_concat_path(input))?;
    }
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::ffi::OsStr;
    use tempfile::TempDir;

    /// Helper to convert Command args to a Vec of strings for easier testing
    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    /// Helper to check if args contain a flag with a specific value
    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    // Strategy for generating valid path-like strings
    fn path_strategy() -> impl Strategy<Value = String> {
        prop::string::string_regex("[a-zA-Z0-9_/.-]{1,50}")
            .unwrap()
            .prop_filter("non-empty path", |s| !s.is_empty())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_concat_command_completeness(
            list in path_strategy(),
            output in path_strategy(),
            aac in proptest::bool::ANY,
            hw_accel in proptest::bool::ANY,
        ) {
            let request = ConcatRequest {
                list_file: PathBuf::from(&list),
                output: PathBuf::from(&output),
                audio: if aac { AudioMode::Aac } else { AudioMode::Copy },
                hw_accel,
            };

            let cmd = build_concat_command(Path::new("ffmpeg"), &request);
            let args = get_command_args(&cmd);

            prop_assert_eq!(cmd.as_std().get_program(), OsStr::new("ffmpeg"));
            prop_assert!(has_flag_with_value(&args, "-f", "concat"), "args: {:?}", args);
            prop_assert!(has_flag_with_value(&args, "-safe", "0"), "args: {:?}", args);
            prop_assert!(has_flag_with_value(&args, "-i", &list), "args: {:?}", args);
            prop_assert!(has_flag_with_value(&args, "-c:v", "copy"), "args: {:?}", args);
            prop_assert!(
                has_flag_with_value(&args, "-c:a", if aac { "aac" } else { "copy" }),
                "args: {:?}", args
            );
            prop_assert!(has_flag_with_value(&args, "-y", &output), "args: {:?}", args);
            prop_assert_eq!(args.last().map(String::as_str), Some(output.as_str()));
            prop_assert_eq!(has_flag_with_value(&args, "-hwaccel", "auto"), hw_accel);

            // hwaccel is an input option and must precede -i
            if hw_accel {
                let hw_pos = args.iter().position(|a| a == "-hwaccel").unwrap();
                let input_pos = args.iter().position(|a| a == "-i").unwrap();
                prop_assert!(hw_pos < input_pos);
            }
        }
    }

    #[test]
    fn test_escape_concat_path_quotes() {
        assert_eq!(
            escape_concat_path(Path::new("/v/it's here.mp4")),
            "/v/it'\\''s here.mp4"
        );
        assert_eq!(escape_concat_path(Path::new("/v/plain.mp4")), "/v/plain.mp4");
    }

    #[test]
    fn test_write_concat_list_keeps_order() {
        let temp = TempDir::new().unwrap();
        let list = temp.path().join("nested/out.mp4.txt");
        let inputs = vec![
            PathBuf::from("/v/2025062900/00M00S.mp4"),
            PathBuf::from("/v/2025062900/10M00S.mp4.old"),
        ];

        write_concat_list(&list, &inputs).unwrap();

        let content = fs::read_to_string(&list).unwrap();
        assert_eq!(
            content,
            "file '/v/2025062900/00M00S.mp4'\nfile '/v/2025062900/10M00S.mp4.old'\n"
        );
    }
}
