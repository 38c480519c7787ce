//! Day merger daemon
//!
//! Watches camera recording trees, detects dates whose hourly recordings are
//! complete across every camera, and merges each camera's day into one file
//! with ffmpeg under a watchdog-bounded retry.

pub mod camera;
pub mod cleanup;
pub mod daemon;
pub mod merge;
pub mod persist;
pub mod probe;
pub mod readiness;
pub mod records;
pub mod scan;
pub mod startup;
pub mod transcode;
pub mod watchdog;

#[cfg(test)]
mod test_support;

pub use daymerge_config as config;
pub use daymerge_config::Config;
pub use camera::{discover_cameras, resolve_cameras, CameraSource};
pub use cleanup::{clean_merged, clean_originals, retention_window, CleanupReport};
pub use daemon::{CycleReport, Daemon, DaemonError};
pub use merge::{day_output_path, MergeError, MergeExecutor, MergeJob, MergeOutcome, MergeSettings, MergeStage};
pub use probe::{probe_file, ProbeError, ProbeResult};
pub use readiness::{detect_ready_dates, DateStatus, ReadinessOptions, ReadyDate};
pub use records::{AttemptResult, Outcome, ProcessRecord, RecordError, RecordFilter, RecordKey, RecordStore};
pub use scan::{scan_camera, CameraInventory, FileHealth, HourBucket, ScanOptions};
pub use startup::{run_startup_checks, StartupError};
pub use transcode::{AudioMode, ConcatRequest, FfmpegTranscoder, Transcoder};
pub use watchdog::{
    run_watchdogged, watch_heartbeat, Heartbeat, RetryPolicy, WatchdogError, WatchdogFailure, WatchdogReport,
};
