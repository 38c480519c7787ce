//! Merge executor.
//!
//! Turns one camera's hour buckets for a date into a single day file:
//! multi-file hours are concatenated into hour files first, then the hour
//! files are concatenated into the day output, which is verified before it
//! takes its final name. Every external command runs under the watchdog.
//!
//! All tool output goes to a `.partial` path first. A failed or cancelled
//! attempt removes its partial output and any hour files it produced, so no
//! later pass can mistake leftovers for a finished merge.

use crate::config::Config;
use crate::scan::DateInventory;
use crate::transcode::{write_concat_list, AudioMode, ConcatRequest, Transcoder};
use crate::watchdog::{remove_partial, run_watchdogged, Heartbeat, RetryPolicy, WatchdogFailure, WatchdogReport};
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Day merges get this many times the hour budget.
pub const DAY_BUDGET_FACTOR: u32 = 2;

/// A verified output must cover at least this share of its inputs' duration.
pub const MIN_DURATION_RATIO: f64 = 0.5;

/// Error type for merge attempts
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("no input files for any hour")]
    NoInputs,

    #[error("hour {hour:02} merge failed: {source}")]
    Hour {
        hour: u8,
        #[source]
        source: WatchdogFailure,
    },

    #[error("day merge failed: {0}")]
    Day(#[source] WatchdogFailure),

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("merge cancelled")]
    Cancelled,
}

impl MergeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MergeError::Cancelled)
    }

    fn from_watchdog(failure: WatchdogFailure, wrap: impl FnOnce(WatchdogFailure) -> MergeError) -> Self {
        if failure.is_cancelled() {
            MergeError::Cancelled
        } else {
            wrap(failure)
        }
    }
}

/// Stage of a merge attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStage {
    Pending,
    MergingHour(u8),
    MergingDay,
    Verifying,
    Succeeded,
    Failed,
}

impl MergeStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStage::Pending => "pending",
            MergeStage::MergingHour(_) => "merging_hour",
            MergeStage::MergingDay => "merging_day",
            MergeStage::Verifying => "verifying",
            MergeStage::Succeeded => "succeeded",
            MergeStage::Failed => "failed",
        }
    }
}

/// Settings for the merge pipeline
#[derive(Debug, Clone)]
pub struct MergeSettings {
    /// Watchdog policy for hour merges; day merges scale its budget.
    pub policy: RetryPolicy,
    pub hw_accel: bool,
    pub min_valid_bytes: u64,
    /// Probe the day output (playability and duration sanity).
    pub verify_output: bool,
    /// Keep hour files after a successful day merge.
    pub save_hourly: bool,
    /// Remove concat list files when done.
    pub cleanup_temp_files: bool,
}

impl MergeSettings {
    pub fn from_config(config: &Config, hw_accel: bool) -> Self {
        Self {
            policy: RetryPolicy::from_config(&config.merge),
            hw_accel,
            min_valid_bytes: config.min_valid_bytes(),
            verify_output: config.merge.verify_merged_files || config.scan.deep_check,
            save_hourly: config.merge.save_hourly,
            cleanup_temp_files: config.merge.cleanup_temp_files,
        }
    }

    fn day_policy(&self) -> RetryPolicy {
        self.policy
            .with_budget(self.policy.max_timeout.saturating_mul(DAY_BUDGET_FACTOR))
    }
}

/// Inputs for one camera and date: healthy files per hour, in concat order.
#[derive(Debug, Clone)]
pub struct MergeJob {
    pub camera: String,
    pub date: NaiveDate,
    pub hours: BTreeMap<u8, Vec<PathBuf>>,
}

impl MergeJob {
    /// Collects the healthy inputs of `hours` from an inventory.
    pub fn from_inventory(camera: &str, inventory: &DateInventory, hours: &[u8]) -> Self {
        let hours = hours
            .iter()
            .filter_map(|hour| inventory.hours.get(hour))
            .map(|bucket| (bucket.hour, bucket.merge_inputs()))
            .filter(|(_, inputs)| !inputs.is_empty())
            .collect();
        Self {
            camera: camera.to_string(),
            date: inventory.date,
            hours,
        }
    }
}

/// A completed merge
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub output: PathBuf,
    /// Hour files left on disk (only with `save_hourly`).
    pub saved_hours: Vec<PathBuf>,
    /// External processes started across every stage.
    pub tool_runs: u32,
}

/// `<merged_root>/<YYYYMMDD>`
pub fn date_dir(merged_root: &Path, date: NaiveDate) -> PathBuf {
    merged_root.join(date.format("%Y%m%d").to_string())
}

/// `<merged_root>/<YYYYMMDD>/<YYYYMMDD>_<camera>.mp4`
pub fn day_output_path(merged_root: &Path, camera: &str, date: NaiveDate) -> PathBuf {
    let day = date.format("%Y%m%d");
    date_dir(merged_root, date).join(format!("{}_{}.mp4", day, camera))
}

/// `<merged_root>/<YYYYMMDD>/<YYYYMMDD>_<camera>_<HH>.mp4`
pub fn hour_output_path(merged_root: &Path, camera: &str, date: NaiveDate, hour: u8) -> PathBuf {
    let day = date.format("%Y%m%d");
    date_dir(merged_root, date).join(format!("{}_{}_{:02}.mp4", day, camera, hour))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Where the tool writes before the output is accepted.
pub fn partial_path(output: &Path) -> PathBuf {
    with_suffix(output, ".partial")
}

/// Concat list file for an output.
pub fn list_path(output: &Path) -> PathBuf {
    with_suffix(output, ".txt")
}

/// True when `output_secs` plausibly holds `input_secs` of footage.
///
/// Unknown input durations (zero) pass.
pub fn duration_is_plausible(output_secs: f64, input_secs: f64) -> bool {
    input_secs <= 0.0 || output_secs >= input_secs * MIN_DURATION_RATIO
}

/// Executes merge attempts one at a time.
pub struct MergeExecutor {
    transcoder: Arc<dyn Transcoder>,
    settings: MergeSettings,
    merged_root: PathBuf,
    heartbeat: Heartbeat,
}

impl MergeExecutor {
    pub fn new(transcoder: Arc<dyn Transcoder>, settings: MergeSettings, merged_root: PathBuf) -> Self {
        Self {
            transcoder,
            settings,
            merged_root,
            heartbeat: Heartbeat::default(),
        }
    }

    /// Beats `heartbeat` before every supervised slice and probe.
    pub fn with_heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn settings(&self) -> &MergeSettings {
        &self.settings
    }

    pub fn merged_root(&self) -> &Path {
        &self.merged_root
    }

    pub fn transcoder(&self) -> &Arc<dyn Transcoder> {
        &self.transcoder
    }

    /// Output path for a camera and date.
    pub fn day_output(&self, camera: &str, date: NaiveDate) -> PathBuf {
        day_output_path(&self.merged_root, camera, date)
    }

    /// Runs one attempt for `job`.
    ///
    /// On success the day file exists at its final path and has passed
    /// verification. On any error nothing produced by this attempt remains.
    pub async fn merge_day(&self, job: &MergeJob, cancel: &CancellationToken) -> Result<MergeOutcome, MergeError> {
        let mut hour_files = Vec::new();
        let mut tool_runs = 0;

        let result = self.run_stages(job, cancel, &mut hour_files, &mut tool_runs).await;

        match result {
            Ok(output) => {
                let saved_hours = if self.settings.save_hourly {
                    hour_files
                } else {
                    for file in &hour_files {
                        remove_partial(file);
                    }
                    Vec::new()
                };
                info!(
                    camera = %job.camera,
                    date = %job.date,
                    stage = MergeStage::Succeeded.as_str(),
                    output = %output.display(),
                    tool_runs,
                    "day merge complete"
                );
                Ok(MergeOutcome {
                    output,
                    saved_hours,
                    tool_runs,
                })
            }
            Err(e) => {
                for file in &hour_files {
                    remove_partial(file);
                }
                remove_partial(&partial_path(&self.day_output(&job.camera, job.date)));
                if e.is_cancelled() {
                    warn!(camera = %job.camera, date = %job.date, "merge cancelled; partial output removed");
                } else {
                    error!(
                        camera = %job.camera,
                        date = %job.date,
                        stage = MergeStage::Failed.as_str(),
                        error = %e,
                        "day merge failed"
                    );
                }
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        job: &MergeJob,
        cancel: &CancellationToken,
        hour_files: &mut Vec<PathBuf>,
        tool_runs: &mut u32,
    ) -> Result<PathBuf, MergeError> {
        if job.hours.is_empty() {
            return Err(MergeError::NoInputs);
        }

        let output = self.day_output(&job.camera, job.date);
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        debug!(camera = %job.camera, date = %job.date, stage = MergeStage::Pending.as_str(), hours = job.hours.len(), "merge attempt starting");

        // Stage 1: one file per hour
        let mut day_inputs = Vec::with_capacity(job.hours.len());
        for (&hour, inputs) in &job.hours {
            if cancel.is_cancelled() {
                return Err(MergeError::Cancelled);
            }
            if inputs.len() == 1 {
                day_inputs.push(inputs[0].clone());
                continue;
            }

            let stage = MergeStage::MergingHour(hour);
            debug!(camera = %job.camera, date = %job.date, hour, stage = stage.as_str(), files = inputs.len(), "merging hour");

            let hour_output = hour_output_path(&self.merged_root, &job.camera, job.date, hour);
            match self
                .concat(inputs, &hour_output, AudioMode::Aac, self.settings.policy, cancel)
                .await?
            {
                Ok(report) => *tool_runs += report.attempts,
                Err(failure) => {
                    *tool_runs += failure.report.attempts;
                    return Err(MergeError::from_watchdog(failure, |source| MergeError::Hour { hour, source }));
                }
            }

            let hour_partial = partial_path(&hour_output);
            if let Err(e) = tokio::fs::rename(&hour_partial, &hour_output).await {
                remove_partial(&hour_partial);
                return Err(e.into());
            }
            hour_files.push(hour_output.clone());
            day_inputs.push(hour_output);
        }

        if cancel.is_cancelled() {
            return Err(MergeError::Cancelled);
        }

        // Stage 2: the day file
        debug!(camera = %job.camera, date = %job.date, stage = MergeStage::MergingDay.as_str(), inputs = day_inputs.len(), "merging day");
        let partial = partial_path(&output);
        if day_inputs.len() == 1 {
            tokio::fs::copy(&day_inputs[0], &partial).await?;
        } else {
            *tool_runs += self.concat_day(&day_inputs, &output, cancel).await?;
        }

        // Stage 3: verify, then publish
        debug!(camera = %job.camera, date = %job.date, stage = MergeStage::Verifying.as_str(), "verifying day output");
        self.verify(&partial, &day_inputs).await?;
        tokio::fs::rename(&partial, &output).await?;

        Ok(output)
    }

    /// Copy-audio first, then AAC with whatever budget remains.
    async fn concat_day(&self, inputs: &[PathBuf], output: &Path, cancel: &CancellationToken) -> Result<u32, MergeError> {
        let policy = self.settings.day_policy();

        let failure = match self.concat(inputs, output, AudioMode::Copy, policy, cancel).await? {
            Ok(report) => return Ok(report.attempts),
            Err(failure) => failure,
        };
        if failure.is_cancelled() {
            return Err(MergeError::Cancelled);
        }
        let attempts = failure.report.attempts;

        let remaining = policy.max_timeout.saturating_sub(failure.report.charged());
        if remaining.is_zero() {
            return Err(MergeError::Day(failure));
        }
        warn!(output = %output.display(), error = %failure, "stream copy failed; retrying with AAC audio");

        match self
            .concat(inputs, output, AudioMode::Aac, policy.with_budget(remaining), cancel)
            .await?
        {
            Ok(report) => Ok(attempts + report.attempts),
            Err(failure) => Err(MergeError::from_watchdog(failure, MergeError::Day)),
        }
    }

    /// Writes the list file and runs one supervised concatenation into the
    /// partial path of `output`. Only list-file errors use the outer `Result`.
    async fn concat(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        audio: AudioMode,
        policy: RetryPolicy,
        cancel: &CancellationToken,
    ) -> io::Result<Result<WatchdogReport, WatchdogFailure>> {
        let list_file = list_path(output);
        let partial = partial_path(output);
        if let Err(e) = write_concat_list(&list_file, inputs) {
            remove_partial(&list_file);
            return Err(e);
        }

        let request = ConcatRequest {
            list_file: list_file.clone(),
            output: partial.clone(),
            audio,
            hw_accel: self.settings.hw_accel,
        };
        let result = run_watchdogged(
            || self.transcoder.concat_command(&request),
            policy,
            &partial,
            cancel,
            &self.heartbeat,
        )
        .await;

        if self.settings.cleanup_temp_files {
            remove_partial(&list_file);
        }
        Ok(result)
    }

    async fn verify(&self, partial: &Path, inputs: &[PathBuf]) -> Result<(), MergeError> {
        let size = tokio::fs::metadata(partial).await?.len();
        if size < self.settings.min_valid_bytes {
            return Err(MergeError::Verification(format!(
                "output is {} bytes, minimum {}",
                size, self.settings.min_valid_bytes
            )));
        }
        if !self.settings.verify_output {
            return Ok(());
        }

        let transcoder = Arc::clone(&self.transcoder);
        let heartbeat = self.heartbeat.clone();
        let output = partial.to_path_buf();
        let inputs = inputs.to_vec();
        let checked = tokio::task::spawn_blocking(move || {
            heartbeat.beat();
            let probe = transcoder.probe(&output).map_err(|e| e.to_string())?;
            if !probe.is_playable() {
                return Err("output has no playable video stream".to_string());
            }
            let expected: f64 = inputs
                .iter()
                .filter_map(|input| {
                    heartbeat.beat();
                    transcoder.probe(input).ok()
                })
                .map(|p| p.duration_secs)
                .sum();
            if !duration_is_plausible(probe.duration_secs, expected) {
                return Err(format!(
                    "output lasts {:.1}s but inputs total {:.1}s",
                    probe.duration_secs, expected
                ));
            }
            Ok(())
        })
        .await
        .map_err(|e| MergeError::Verification(format!("probe task failed: {}", e)))?;

        checked.map_err(MergeError::Verification)
    }
}
