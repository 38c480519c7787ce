//! Retention cleaner.
//!
//! Two independent clocks: source recordings of a merged date are removed once
//! they are older than the originals window, merged outputs once they are older
//! than the merged window. Only dates whose record is Success are touched.
//! Deletion is best effort per file.

use crate::merge::{date_dir, hour_output_path};
use crate::readiness::HOURS_PER_DAY;
use crate::records::{RecordFilter, RecordKey, RecordStore};
use crate::scan::CameraInventory;
use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Retention window for a day count; 0 disables.
pub fn retention_window(days: u32) -> Option<Duration> {
    (days > 0).then(|| Duration::from_secs(u64::from(days) * SECS_PER_DAY))
}

/// Counters for one cleaner pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub files_deleted: usize,
    pub failures: usize,
    pub records_marked: usize,
}

fn is_older_than(modified: SystemTime, window: Duration, now: SystemTime) -> bool {
    now.duration_since(modified).map_or(false, |age| age > window)
}

/// Deletes one file, counting the result. Missing files count as gone.
fn delete_file(path: &Path, report: &mut CleanupReport) -> bool {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "deleted");
            report.files_deleted += 1;
            true
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to delete file");
            report.failures += 1;
            false
        }
    }
}

/// Removes `dir` if it is empty; anything else is left alone.
fn remove_dir_if_empty(dir: &Path) {
    let empty = fs::read_dir(dir).map_or(false, |mut entries| entries.next().is_none());
    if empty {
        if let Err(e) = fs::remove_dir(dir) {
            debug!(dir = %dir.display(), error = %e, "could not remove directory");
        }
    }
}

/// Deletes source recordings of merged dates older than `window`.
///
/// Only whole-day Success records qualify, and only files already on disk when
/// the record was written; anything newer was not a merge input. A record is
/// marked once every recording of its date is gone.
pub fn clean_originals(
    store: &mut RecordStore,
    inventories: &[CameraInventory],
    window: Duration,
    now: DateTime<Utc>,
) -> CleanupReport {
    let mut report = CleanupReport::default();
    let now_system = SystemTime::from(now);

    let keys: Vec<(RecordKey, SystemTime)> = store
        .list(&RecordFilter::successes())
        .into_iter()
        .filter(|r| r.is_complete() && r.originals_deleted_at.is_none())
        .map(|r| (r.key(), SystemTime::from(r.timestamp)))
        .collect();

    for (key, merged_at) in keys {
        let Some(day) = inventories
            .iter()
            .find(|inv| inv.camera == key.camera)
            .and_then(|inv| inv.date(key.date))
        else {
            continue;
        };

        let mut remaining = 0;
        for file in day.files() {
            if file.modified_time <= merged_at && is_older_than(file.modified_time, window, now_system) {
                if !delete_file(&file.path, &mut report) {
                    remaining += 1;
                }
            } else {
                remaining += 1;
            }
        }
        for folder in day.folders() {
            remove_dir_if_empty(folder);
        }

        if remaining == 0 {
            store.mark_originals_deleted(&key, now);
            report.records_marked += 1;
            info!(camera = %key.camera, date = %key.date, "original recordings removed");
        }
    }

    report
}

/// Deletes merged outputs (and saved hour files) older than `window`.
pub fn clean_merged(store: &mut RecordStore, merged_root: &Path, window: Duration, now: DateTime<Utc>) -> CleanupReport {
    let mut report = CleanupReport::default();
    let now_system = SystemTime::from(now);

    let candidates: Vec<(RecordKey, std::path::PathBuf)> = store
        .list(&RecordFilter::successes())
        .into_iter()
        .filter(|r| r.merged_deleted_at.is_none())
        .map(|r| (r.key(), r.output_path.clone()))
        .collect();

    for (key, output) in candidates {
        let modified = match fs::metadata(&output).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                debug!(output = %output.display(), error = %e, "merged output not inspectable; skipping");
                continue;
            }
        };
        if !is_older_than(modified, window, now_system) {
            continue;
        }

        let mut all_deleted = delete_file(&output, &mut report);
        for hour in 0..HOURS_PER_DAY {
            let hour_file = hour_output_path(merged_root, &key.camera, key.date, hour);
            if hour_file.exists() {
                all_deleted &= delete_file(&hour_file, &mut report);
            }
        }
        remove_dir_if_empty(&date_dir(merged_root, key.date));

        if all_deleted {
            store.mark_merged_deleted(&key, now);
            report.records_marked += 1;
            info!(camera = %key.camera, date = %key.date, output = %output.display(), "merged output removed");
        }
    }

    report
}
