//! Scan loop for the day merger
//!
//! One cycle: verify records, scan every camera, detect ready dates, merge
//! them one camera at a time (oldest date first), record each outcome, then
//! run the retention cleaners. The loop sleeps `scan_interval` between cycles
//! and stops when the cancellation token fires.
//!
//! Every stage beats the daemon's [`Heartbeat`], including the idle wait, so
//! a process-level monitor can tell a slow cycle from a hung one.

use crate::camera::{resolve_cameras, CameraSource};
use crate::cleanup::{clean_merged, clean_originals, retention_window, CleanupReport};
use crate::config::{Config, ConfigError, Timezone};
use crate::merge::{MergeExecutor, MergeJob, MergeSettings};
use crate::readiness::{detect_ready_dates, required_hours, ReadinessOptions, ReadyDate, HOURS_PER_DAY};
use crate::records::{check_output, AttemptResult, ProcessRecord, RecordError, RecordFilter, RecordKey, RecordStore, VerifyReport};
use crate::scan::{scan_camera, CameraInventory, ScanOptions};
use crate::startup::{run_startup_checks, StartupError};
use crate::transcode::{FfmpegTranscoder, Transcoder};
use crate::watchdog::Heartbeat;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Beat period while waiting for the next cycle.
const IDLE_BEAT: Duration = Duration::from_secs(30);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Record store could not be read or written
    #[error("Record store error: {0}")]
    Records(#[from] RecordError),

    /// A blocking task panicked or was aborted
    #[error("Background task failed: {0}")]
    Task(String),
}

/// What one cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub ready: Vec<ReadyDate>,
    pub merged: Vec<RecordKey>,
    pub failed: Vec<RecordKey>,
    pub downgraded: Vec<RecordKey>,
    pub originals: CleanupReport,
    pub merged_cleanup: CleanupReport,
    /// The cycle stopped early on cancellation.
    pub cancelled: bool,
}

/// Daemon state containing all runtime components
pub struct Daemon {
    config: Config,
    cameras: Vec<CameraSource>,
    timezone: Timezone,
    store: RecordStore,
    executor: MergeExecutor,
    scan_options: ScanOptions,
    force: bool,
    cancel: CancellationToken,
    heartbeat: Heartbeat,
}

impl Daemon {
    /// Initialize the daemon with a loaded configuration
    ///
    /// This performs the startup sequence:
    /// 1. Validate the configuration
    /// 2. Run startup checks (ffmpeg, ffprobe, hardware acceleration)
    /// 3. Load the process records
    /// 4. Resolve the camera list
    pub fn new(config: Config, cancel: CancellationToken) -> Result<Self, DaemonError> {
        config.validate()?;
        let hw_accel = run_startup_checks(&config)?;
        let transcoder = FfmpegTranscoder::new(config.merge.ffmpeg_path.clone(), config.merge.ffprobe_path.clone());
        Self::with_transcoder(config, Arc::new(transcoder), hw_accel, cancel)
    }

    /// Initialize the daemon without running startup checks
    ///
    /// Useful for testing when ffmpeg is not available.
    pub fn with_transcoder(
        config: Config,
        transcoder: Arc<dyn Transcoder>,
        hw_accel: bool,
        cancel: CancellationToken,
    ) -> Result<Self, DaemonError> {
        config.validate()?;
        let timezone = config.timezone()?;
        let store = RecordStore::load(&config.record_path())?;
        let cameras = resolve_cameras(&config);
        if cameras.is_empty() {
            warn!(root = %config.paths.video_root.display(), "no cameras configured or discovered");
        }

        let settings = MergeSettings::from_config(&config, hw_accel && config.merge.use_hw_accel);
        let heartbeat = Heartbeat::default();
        let executor = MergeExecutor::new(transcoder, settings, config.merged_root()).with_heartbeat(heartbeat.clone());
        let scan_options = ScanOptions {
            min_valid_bytes: config.min_valid_bytes(),
            deep_check: config.scan.deep_check,
        };

        Ok(Self {
            config,
            cameras,
            timezone,
            store,
            executor,
            scan_options,
            force: false,
            cancel,
            heartbeat,
        })
    }

    /// Ignore Success records and the attempt ceiling; allow today's finished hours.
    pub fn set_force(&mut self, force: bool) {
        self.force = force;
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    /// Scan every camera on the blocking pool.
    pub async fn scan(&self) -> Result<Vec<CameraInventory>, DaemonError> {
        let cameras = self.cameras.clone();
        let options = self.scan_options.clone();
        let transcoder = Arc::clone(self.executor.transcoder());
        let heartbeat = self.heartbeat.clone();

        tokio::task::spawn_blocking(move || {
            cameras
                .iter()
                .map(|camera| {
                    heartbeat.beat();
                    scan_camera(camera, &options, transcoder.as_ref())
                })
                .collect()
        })
        .await
        .map_err(|e| DaemonError::Task(e.to_string()))
    }

    /// Re-check Success records against the disk and persist any downgrade.
    ///
    /// File checks (and probes in deep-check mode) run on the blocking pool.
    pub async fn verify_records(&mut self, now: DateTime<Utc>) -> Result<VerifyReport, DaemonError> {
        let targets = self.store.verify_targets();
        let checked = targets.len();
        let min_bytes = self.scan_options.min_valid_bytes;
        let prober = self
            .scan_options
            .deep_check
            .then(|| Arc::clone(self.executor.transcoder()));
        let heartbeat = self.heartbeat.clone();

        let failures = tokio::task::spawn_blocking(move || {
            targets
                .into_iter()
                .filter_map(|(key, output)| {
                    heartbeat.beat();
                    check_output(&output, min_bytes, prober.as_deref())
                        .err()
                        .map(|reason| (key, reason))
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| DaemonError::Task(e.to_string()))?;

        let report = self.store.apply_verification(checked, failures, now);
        if !report.downgraded.is_empty() {
            self.store.save()?;
        }
        info!(
            checked = report.checked,
            downgraded = report.downgraded.len(),
            "process records verified"
        );
        Ok(report)
    }

    /// Drop Failed records whose output does not exist.
    pub fn clean_records(&mut self) -> Result<Vec<RecordKey>, DaemonError> {
        let removed = self.store.clean();
        if !removed.is_empty() {
            self.store.save()?;
        }
        info!(removed = removed.len(), "process records cleaned");
        Ok(removed)
    }

    /// Success records, ordered by camera then date.
    pub fn successful_records(&self) -> Vec<&ProcessRecord> {
        self.store.list(&RecordFilter::successes())
    }

    /// Run the originals cleaner on its own.
    pub async fn cleanup_originals(&mut self, now: DateTime<Utc>) -> Result<CleanupReport, DaemonError> {
        let Some(window) = retention_window(self.config.retention.delete_original_after_days) else {
            info!("original retention disabled");
            return Ok(CleanupReport::default());
        };
        let inventories = self.scan().await?;
        let report = clean_originals(&mut self.store, &inventories, window, now);
        self.store.save()?;
        Ok(report)
    }

    /// Run the merged-output cleaner on its own.
    pub fn cleanup_merged(&mut self, now: DateTime<Utc>) -> Result<CleanupReport, DaemonError> {
        let Some(window) = retention_window(self.config.retention.delete_merged_after_days) else {
            info!("merged retention disabled");
            return Ok(CleanupReport::default());
        };
        let report = clean_merged(&mut self.store, self.executor.merged_root(), window, now);
        self.store.save()?;
        Ok(report)
    }

    /// Run one cycle at the current time.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, DaemonError> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Run one cycle as if the clock read `now`.
    pub async fn run_cycle_at(&mut self, now: DateTime<Utc>) -> Result<CycleReport, DaemonError> {
        self.heartbeat.beat();
        let mut report = CycleReport {
            downgraded: self.verify_records(now).await?.downgraded,
            ..CycleReport::default()
        };

        let inventories = self.scan().await?;
        let local_now = self.timezone.at(now);
        let options = ReadinessOptions {
            force: self.force,
            max_date_attempts: self.config.merge.max_date_attempts,
            exclude_unhealthy: self.config.scan.exclude_unhealthy,
        };
        report.ready = detect_ready_dates(&inventories, &self.store, local_now, &options);
        info!(
            cameras = inventories.len(),
            ready_dates = report.ready.len(),
            today = %local_now.date_naive(),
            "scan complete"
        );

        'dates: for ready in report.ready.clone() {
            let Some(hours) = required_hours(ready.date, local_now, self.force) else {
                continue;
            };
            for camera in &ready.cameras {
                if self.cancel.is_cancelled() {
                    report.cancelled = true;
                    break 'dates;
                }
                self.heartbeat.beat();
                let Some(day) = inventories
                    .iter()
                    .find(|inv| inv.camera == *camera)
                    .and_then(|inv| inv.date(ready.date))
                else {
                    continue;
                };

                let key = RecordKey::new(camera.clone(), ready.date);
                if !self.store.reserve(&key) {
                    debug!(record = %key, "already reserved; skipping");
                    continue;
                }
                let job = MergeJob::from_inventory(camera, day, &hours);
                let outcome = self.executor.merge_day(&job, &self.cancel).await;

                let result = match outcome {
                    Ok(merged) => {
                        report.merged.push(key.clone());
                        Some(AttemptResult::Success {
                            output: merged.output,
                            partial: hours.len() < usize::from(HOURS_PER_DAY),
                        })
                    }
                    Err(e) if e.is_cancelled() => {
                        report.cancelled = true;
                        None
                    }
                    Err(e) => {
                        report.failed.push(key.clone());
                        Some(AttemptResult::Failed {
                            output: self.executor.day_output(camera, ready.date),
                            reason: e.to_string(),
                        })
                    }
                };

                if let Some(result) = result {
                    let record = self.store.upsert(key.clone(), result, Utc::now());
                    info!(
                        camera = %record.camera,
                        date = %record.date,
                        outcome = %record.outcome,
                        retry_count = record.retry_count,
                        "attempt recorded"
                    );
                    if let Err(e) = self.store.save() {
                        error!(record = %key, error = %e, "failed to persist process record");
                    }
                }
                self.store.release(&key);

                if report.cancelled {
                    break 'dates;
                }
            }
        }

        if report.cancelled {
            warn!("cycle cancelled; skipping retention");
            return Ok(report);
        }

        if let Some(window) = retention_window(self.config.retention.delete_original_after_days) {
            report.originals = clean_originals(&mut self.store, &inventories, window, now);
        }
        if let Some(window) = retention_window(self.config.retention.delete_merged_after_days) {
            report.merged_cleanup = clean_merged(&mut self.store, self.executor.merged_root(), window, now);
        }
        if report.originals.records_marked + report.merged_cleanup.records_marked > 0 {
            self.store.save()?;
        }

        info!(
            merged = report.merged.len(),
            failed = report.failed.len(),
            originals_deleted = report.originals.files_deleted,
            merged_deleted = report.merged_cleanup.files_deleted,
            "cycle complete"
        );
        Ok(report)
    }

    /// Run cycles until cancelled, or once with `single_run`.
    ///
    /// A failing cycle is logged and the loop continues.
    pub async fn run(&mut self, single_run: bool) -> Result<(), DaemonError> {
        info!(
            cameras = self.cameras.len(),
            interval_secs = self.config.scan.scan_interval_secs,
            single_run,
            "daemon starting"
        );

        'cycles: loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if let Err(e) = self.run_cycle().await {
                error!(error = %e, "cycle failed");
            }
            if single_run {
                break;
            }

            let idle = tokio::time::sleep(self.config.scan_interval());
            tokio::pin!(idle);
            let mut ticks = tokio::time::interval(IDLE_BEAT);
            loop {
                tokio::select! {
                    _ = &mut idle => break,
                    _ = ticks.tick() => self.heartbeat.beat(),
                    _ = self.cancel.cancelled() => break 'cycles,
                }
            }
        }

        info!("daemon stopped");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::CameraConfig;
    use crate::records::Outcome;
    use crate::test_support::{write_file, FakeTranscoder};
    use chrono::{NaiveDate, TimeZone};
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn config(root: &Path, cameras: &[&str]) -> Config {
        let mut config = Config::default();
        config.paths.video_root = root.to_path_buf();
        config.cameras.camera_subdir = "cams".to_string();
        config.cameras.required = cameras
            .iter()
            .map(|name| CameraConfig {
                name: name.to_string(),
                root: None,
                device_id: None,
            })
            .collect();
        config.scan.min_valid_size_kb = 1;
        config.scan.timezone = "utc".to_string();
        config.merge.max_timeout_secs = 2;
        config.merge.sub_timeout_secs = 1;
        config.merge.max_retries = 2;
        config.merge.retry_delay_secs = 0;
        config.merge.use_hw_accel = false;
        config
    }

    fn seed_day(root: &Path, camera: &str, day: &str, hours: impl Iterator<Item = u8>) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for hour in hours {
            let file = root.join(format!("{}/cams/dev1/{}{:02}/00M00S.mp4", camera, day, hour));
            write_file(&file, 2048);
            files.push(file);
        }
        files
    }

    /// 2025-07-01 06:00 UTC
    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 7, 1, 6, 0, 0).unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y%m%d").unwrap()
    }

    fn daemon(config: Config, fake: FakeTranscoder) -> Daemon {
        Daemon::with_transcoder(config, Arc::new(fake), false, CancellationToken::new()).unwrap()
    }

    #[tokio::test]
    async fn test_four_cameras_full_day() {
        let temp = TempDir::new().unwrap();
        let cameras = ["A", "B", "C", "D"];
        for camera in cameras {
            seed_day(temp.path(), camera, "20250629", 0..24);
        }
        let fake = FakeTranscoder::counting(temp.path());
        let counter = fake.clone();
        let mut daemon = daemon(config(temp.path(), &cameras), fake);

        let report = daemon.run_cycle_at(now()).await.unwrap();

        assert_eq!(report.merged.len(), 4);
        assert!(report.failed.is_empty());
        for camera in cameras {
            let output = temp
                .path()
                .join(format!("merged_videos/20250629/20250629_{}.mp4", camera));
            assert_eq!(fs::metadata(&output).unwrap().len(), 24 * 2048);
            let record = daemon.store().get(&RecordKey::new(camera, date("20250629"))).unwrap();
            assert_eq!(record.outcome, Outcome::Success);
            assert_eq!(record.output_path, output);
        }
        assert_eq!(counter.tool_runs(), 4);

        // Records survive a restart
        let reloaded = RecordStore::load(&temp.path().join("processed.json")).unwrap();
        assert_eq!(reloaded.list(&RecordFilter::successes()).len(), 4);
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let temp = TempDir::new().unwrap();
        seed_day(temp.path(), "A", "20250629", 0..24);
        let fake = FakeTranscoder::counting(temp.path());
        let counter = fake.clone();
        let mut daemon = daemon(config(temp.path(), &["A"]), fake);

        daemon.run_cycle_at(now()).await.unwrap();
        assert_eq!(counter.tool_runs(), 1);

        let report = daemon.run_cycle_at(now()).await.unwrap();
        assert!(report.ready.is_empty());
        assert!(report.merged.is_empty());
        assert_eq!(counter.tool_runs(), 1);
    }

    #[tokio::test]
    async fn test_missing_hour_blocks_all_cameras() {
        let temp = TempDir::new().unwrap();
        for camera in ["A", "B", "C"] {
            seed_day(temp.path(), camera, "20250630", 0..24);
        }
        seed_day(temp.path(), "D", "20250630", 0..23);
        let fake = FakeTranscoder::counting(temp.path());
        let counter = fake.clone();
        let mut daemon = daemon(config(temp.path(), &["A", "B", "C", "D"]), fake);

        let report = daemon.run_cycle_at(now()).await.unwrap();

        assert!(report.ready.is_empty());
        assert!(daemon.store().is_empty());
        assert_eq!(counter.tool_runs(), 0);
        assert!(!temp.path().join("merged_videos/20250630").exists());
    }

    #[tokio::test]
    async fn test_today_waits_unless_forced() {
        let temp = TempDir::new().unwrap();
        seed_day(temp.path(), "A", "20250701", 0..6);
        let mut daemon = daemon(config(temp.path(), &["A"]), FakeTranscoder::counting(temp.path()));

        assert!(daemon.run_cycle_at(now()).await.unwrap().ready.is_empty());

        daemon.set_force(true);
        let report = daemon.run_cycle_at(now()).await.unwrap();
        assert_eq!(report.merged, vec![RecordKey::new("A", date("20250701"))]);
        let output = temp.path().join("merged_videos/20250701/20250701_A.mp4");
        assert_eq!(fs::metadata(output).unwrap().len(), 6 * 2048);
    }

    #[tokio::test]
    async fn test_forced_today_is_completed_next_day_before_retention() {
        let temp = TempDir::new().unwrap();
        let mut originals = seed_day(temp.path(), "A", "20250701", 0..6);
        let mut daemon = daemon(config(temp.path(), &["A"]), FakeTranscoder::counting(temp.path()));
        let key = RecordKey::new("A", date("20250701"));
        let output = temp.path().join("merged_videos/20250701/20250701_A.mp4");

        daemon.set_force(true);
        daemon.run_cycle_at(now()).await.unwrap();
        assert!(daemon.store().get(&key).unwrap().partial);

        // A partial day never releases its recordings
        let later = Utc::now() + chrono::Duration::days(2);
        assert_eq!(daemon.cleanup_originals(later).await.unwrap().files_deleted, 0);
        assert!(originals.iter().all(|f| f.exists()));

        originals.extend(seed_day(temp.path(), "A", "20250701", 6..24));
        daemon.set_force(false);
        let next_day = now() + chrono::Duration::days(1);
        let report = daemon.run_cycle_at(next_day).await.unwrap();

        assert_eq!(report.merged, vec![key.clone()]);
        assert_eq!(fs::metadata(&output).unwrap().len(), 24 * 2048);
        assert!(daemon.store().get(&key).unwrap().is_complete());

        let later = Utc::now() + chrono::Duration::days(2);
        let cleaned = daemon.cleanup_originals(later).await.unwrap();
        assert_eq!(cleaned.files_deleted, 24);
        assert!(originals.iter().all(|f| !f.exists()));
    }

    #[tokio::test]
    async fn test_deleted_output_downgraded_by_verify() {
        let temp = TempDir::new().unwrap();
        seed_day(temp.path(), "A", "20250629", 0..24);
        let mut daemon = daemon(config(temp.path(), &["A"]), FakeTranscoder::counting(temp.path()));
        daemon.run_cycle_at(now()).await.unwrap();

        fs::remove_file(temp.path().join("merged_videos/20250629/20250629_A.mp4")).unwrap();
        let report = daemon.verify_records(now()).await.unwrap();

        let key = RecordKey::new("A", date("20250629"));
        assert_eq!(report.downgraded, vec![key.clone()]);
        assert_eq!(daemon.store().get(&key).unwrap().outcome, Outcome::Failed);

        // The downgraded date is merged again on the next cycle
        let cycle = daemon.run_cycle_at(now()).await.unwrap();
        assert_eq!(cycle.merged, vec![key.clone()]);
        assert!(daemon.store().get(&key).unwrap().is_success());
    }

    #[tokio::test]
    async fn test_deep_check_verify_downgrades_unplayable_output() {
        let temp = TempDir::new().unwrap();
        seed_day(temp.path(), "A", "20250629", 0..24);
        let mut config = config(temp.path(), &["A"]);
        config.scan.deep_check = true;
        let fake = FakeTranscoder::counting(temp.path()).with_unplayable("20250629_A.mp4");
        let mut daemon = daemon(config, fake);
        daemon.run_cycle_at(now()).await.unwrap();

        let key = RecordKey::new("A", date("20250629"));
        assert!(daemon.store().get(&key).unwrap().is_success());

        let report = daemon.verify_records(now()).await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.downgraded, vec![key.clone()]);
        let record = daemon.store().get(&key).unwrap();
        assert!(record.failure_reason.as_deref().unwrap().contains("moov atom"));
    }

    #[tokio::test]
    async fn test_failed_merge_records_failure_and_keeps_originals() {
        let temp = TempDir::new().unwrap();
        let originals = seed_day(temp.path(), "A", "20250629", 0..24);
        let fake = FakeTranscoder::counting(temp.path()).hanging_first(u32::MAX);
        let mut daemon = daemon(config(temp.path(), &["A"]), fake);

        let report = daemon.run_cycle_at(now()).await.unwrap();

        let key = RecordKey::new("A", date("20250629"));
        assert_eq!(report.failed, vec![key.clone()]);
        let record = daemon.store().get(&key).unwrap();
        assert_eq!(record.outcome, Outcome::Failed);
        assert_eq!(record.retry_count, 1);
        assert!(record.failure_reason.as_deref().unwrap().contains("day merge failed"));
        assert!(!record.output_path.exists());
        assert!(!temp.path().join("merged_videos/20250629/20250629_A.mp4.partial").exists());

        // Retention never touches a date that did not succeed
        let cleaned = daemon.cleanup_originals(now() + chrono::Duration::days(30)).await.unwrap();
        assert_eq!(cleaned.files_deleted, 0);
        assert!(originals.iter().all(|f| f.exists()));
    }

    #[tokio::test]
    async fn test_cancelled_cycle_merges_nothing() {
        let temp = TempDir::new().unwrap();
        seed_day(temp.path(), "A", "20250629", 0..24);
        let fake = FakeTranscoder::counting(temp.path());
        let counter = fake.clone();
        let cancel = CancellationToken::new();
        let mut daemon =
            Daemon::with_transcoder(config(temp.path(), &["A"]), Arc::new(fake), false, cancel.clone()).unwrap();
        cancel.cancel();

        let report = daemon.run_cycle_at(now()).await.unwrap();

        assert!(report.cancelled);
        assert!(daemon.store().is_empty());
        assert_eq!(counter.tool_runs(), 0);
    }

    #[tokio::test]
    async fn test_retention_after_success() {
        let temp = TempDir::new().unwrap();
        let originals = seed_day(temp.path(), "A", "20250629", 0..24);
        let mut daemon = daemon(config(temp.path(), &["A"]), FakeTranscoder::counting(temp.path()));
        daemon.run_cycle_at(now()).await.unwrap();

        let later = Utc::now() + chrono::Duration::days(2);
        let cleaned = daemon.cleanup_originals(later).await.unwrap();
        assert_eq!(cleaned.files_deleted, 24);
        assert!(originals.iter().all(|f| !f.exists()));

        let cleaned = daemon.cleanup_merged(later).unwrap();
        assert_eq!(cleaned.records_marked, 1);
        assert!(!temp.path().join("merged_videos/20250629/20250629_A.mp4").exists());

        // Retired outputs are not downgraded, and the date is not merged again
        assert!(daemon.verify_records(later).await.unwrap().downgraded.is_empty());
        let report = daemon.run_cycle_at(now()).await.unwrap();
        assert!(report.ready.is_empty());
    }

    #[tokio::test]
    async fn test_cycle_and_idle_wait_beat() {
        let temp = TempDir::new().unwrap();
        seed_day(temp.path(), "A", "20250629", 0..24);
        let mut daemon = daemon(config(temp.path(), &["A"]), FakeTranscoder::counting(temp.path()));
        let beats = daemon.heartbeat().subscribe();

        daemon.run_cycle_at(now()).await.unwrap();
        // Cycle start, camera scan, merge attempt and the concat slice
        let after_cycle = *beats.borrow();
        assert!(after_cycle >= 4);

        let mut config = config(temp.path(), &["A"]);
        config.scan.scan_interval_secs = 3_600;
        let cancel = CancellationToken::new();
        let mut idle = Daemon::with_transcoder(config, Arc::new(FakeTranscoder::default()), false, cancel.clone()).unwrap();
        let mut beats = idle.heartbeat().subscribe();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        idle.run(false).await.unwrap();
        assert!(beats.has_changed().unwrap());
        assert!(*beats.borrow_and_update() >= 2);
    }

    #[tokio::test]
    async fn test_single_run_loop_exits() {
        let temp = TempDir::new().unwrap();
        let mut daemon = daemon(config(temp.path(), &["A"]), FakeTranscoder::default());
        daemon.run(true).await.unwrap();
    }
}
