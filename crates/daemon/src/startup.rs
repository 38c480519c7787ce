//! Startup checks
//!
//! Verifies the external tools before the first scan:
//! - ffmpeg and ffprobe run (`-version`); a missing binary is fatal
//! - when hardware acceleration is requested, ffmpeg lists at least one method

use crate::config::Config;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },
}

/// Parse a tool's `-version` output and extract the major version number
///
/// Handles:
/// - Standard: "ffmpeg version 6.1.1 ..."
/// - N-prefixed: "ffprobe version n7.0-... ..."
pub fn parse_tool_version(version_output: &str, tool: &str) -> Option<u32> {
    let marker = format!("{} version", tool.to_lowercase());
    let version_line = version_output
        .lines()
        .map(str::to_lowercase)
        .find(|line| line.contains(&marker))?;

    let version_part = version_line
        .split(marker.as_str())
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    version_part
        .trim_start_matches('n')
        .split(|c| c == '.' || c == '-')
        .next()?
        .parse()
        .ok()
}

/// Parse `ffmpeg -hwaccels` output into method names
pub fn parse_hwaccels(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|line| !line.to_lowercase().contains("hardware acceleration methods"))
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

/// Run `<binary> -version` and return the major version if it can be parsed
pub fn check_tool_available(binary: &Path, tool: &str) -> Result<Option<u32>, StartupError> {
    let unavailable = |reason: String| StartupError::ToolUnavailable {
        tool: tool.to_string(),
        reason,
    };

    let output = Command::new(binary)
        .arg("-version")
        .output()
        .map_err(|e| unavailable(format!("{} -version failed; is it installed and in PATH? Error: {}", binary.display(), e)))?;

    if !output.status.success() {
        return Err(unavailable(format!(
            "{} -version exited with {}",
            binary.display(),
            output.status
        )));
    }

    let version = parse_tool_version(&String::from_utf8_lossy(&output.stdout), tool);
    if version.is_none() {
        warn!(tool, "could not parse version output");
    }
    Ok(version)
}

/// Hardware acceleration methods ffmpeg supports; empty when the query fails
pub fn detect_hwaccels(ffmpeg: &Path) -> Vec<String> {
    match Command::new(ffmpeg).args(["-hide_banner", "-hwaccels"]).output() {
        Ok(output) if output.status.success() => parse_hwaccels(&String::from_utf8_lossy(&output.stdout)),
        Ok(output) => {
            warn!(status = %output.status, "ffmpeg -hwaccels failed");
            Vec::new()
        }
        Err(e) => {
            warn!(error = %e, "could not query hardware acceleration");
            Vec::new()
        }
    }
}

/// Run all startup checks in order
///
/// 1. ffmpeg availability
/// 2. ffprobe availability
/// 3. hardware acceleration (only when enabled)
///
/// Returns whether merges should request hardware decoding.
pub fn run_startup_checks(cfg: &Config) -> Result<bool, StartupError> {
    let ffmpeg_major = check_tool_available(&cfg.merge.ffmpeg_path, "ffmpeg")?;
    let ffprobe_major = check_tool_available(&cfg.merge.ffprobe_path, "ffprobe")?;

    let hw_accel = cfg.merge.use_hw_accel && {
        let methods = detect_hwaccels(&cfg.merge.ffmpeg_path);
        if methods.is_empty() {
            warn!("hardware acceleration requested but ffmpeg lists no methods; disabled for this run");
        } else {
            info!(methods = ?methods, "hardware acceleration available");
        }
        !methods.is_empty()
    };

    info!(
        ffmpeg = ?ffmpeg_major,
        ffprobe = ?ffprobe_major,
        hw_accel,
        "startup checks passed"
    );
    Ok(hw_accel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::path::PathBuf;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_version_parsing(major in 1u32..100, minor in 0u32..10, n_prefix in any::<bool>(), tool_idx in 0usize..2) {
            let tool = ["ffmpeg", "ffprobe"][tool_idx];
            let prefix = if n_prefix { "n" } else { "" };
            let output = format!(
                "{} version {}{}.{} Copyright (c) 2000-2024 the FFmpeg developers\nbuilt with gcc 13",
                tool, prefix, major, minor
            );
            prop_assert_eq!(parse_tool_version(&output, tool), Some(major));
        }
    }

    #[test]
    fn test_parse_version_standard() {
        let output = "ffmpeg version 6.1.1-3ubuntu5 Copyright (c) 2000-2023 the FFmpeg developers";
        assert_eq!(parse_tool_version(output, "ffmpeg"), Some(6));
    }

    #[test]
    fn test_parse_version_n_prefixed() {
        let output = "ffprobe version n7.0-12-gabcdef Copyright (c) 2007-2024";
        assert_eq!(parse_tool_version(output, "ffprobe"), Some(7));
    }

    #[test]
    fn test_parse_version_wrong_tool_or_garbage() {
        assert_eq!(parse_tool_version("ffmpeg version 6.0", "ffprobe"), None);
        assert_eq!(parse_tool_version("not ffmpeg output", "ffmpeg"), None);
        assert_eq!(parse_tool_version("", "ffmpeg"), None);
    }

    #[test]
    fn test_parse_hwaccels() {
        let output = "Hardware acceleration methods:\nvdpau\ncuda\nvaapi\n\n";
        assert_eq!(parse_hwaccels(output), vec!["vdpau", "cuda", "vaapi"]);
        assert!(parse_hwaccels("Hardware acceleration methods:\n").is_empty());
        assert!(parse_hwaccels("").is_empty());
    }

    #[test]
    fn test_missing_tool_is_fatal() {
        let err = check_tool_available(Path::new("/nonexistent/ffmpeg-binary"), "ffmpeg").unwrap_err();
        assert!(matches!(err, StartupError::ToolUnavailable { ref tool, .. } if tool == "ffmpeg"));
    }

    #[cfg(unix)]
    fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn test_startup_checks_without_hwaccel_methods() {
        let temp = tempfile::TempDir::new().unwrap();
        let ffmpeg = fake_tool(
            temp.path(),
            "ffmpeg",
            r#"case "$*" in *hwaccels*) echo "Hardware acceleration methods:";; *) echo "ffmpeg version 6.1.1";; esac"#,
        );
        let ffprobe = fake_tool(temp.path(), "ffprobe", r#"echo "ffprobe version 6.1.1""#);

        let mut cfg = Config::default();
        cfg.merge.ffmpeg_path = ffmpeg;
        cfg.merge.ffprobe_path = ffprobe;
        cfg.merge.use_hw_accel = true;

        assert!(!run_startup_checks(&cfg).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_startup_checks_failing_tool() {
        let temp = tempfile::TempDir::new().unwrap();
        let ffmpeg = fake_tool(temp.path(), "ffmpeg", "echo 'ffmpeg version 6.1'");
        let ffprobe = fake_tool(temp.path(), "ffprobe", "exit 1");

        let mut cfg = Config::default();
        cfg.merge.ffmpeg_path = ffmpeg;
        cfg.merge.ffprobe_path = ffprobe;

        let err = run_startup_checks(&cfg).unwrap_err();
        assert!(matches!(err, StartupError::ToolUnavailable { ref tool, .. } if tool == "ffprobe"));
    }
}
