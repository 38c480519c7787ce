//! Readiness detector.
//!
//! Decides which dates can be merged this cycle. A date is ready only when
//! every required camera either has full healthy coverage for it or has
//! already been merged; one incomplete camera holds the date back for all.

use crate::records::{RecordKey, RecordStore};
use crate::scan::{CameraInventory, DateInventory};
use chrono::{DateTime, FixedOffset, NaiveDate, Timelike};
use std::collections::BTreeSet;
use std::fmt;

/// Hours in a full day.
pub const HOURS_PER_DAY: u8 = 24;

/// Where one camera stands for one date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateStatus {
    /// Some required hours are absent or contain unhealthy files.
    Incomplete { missing: Vec<u8>, unhealthy: Vec<u8> },
    Ready,
    /// An attempt holds the reservation.
    Processing,
    Merged,
    /// Failed too often to be retried automatically.
    Failed { attempts: u32 },
}

impl fmt::Display for DateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DateStatus::Incomplete { missing, unhealthy } => write!(
                f,
                "incomplete ({} missing, {} unhealthy hours)",
                missing.len(),
                unhealthy.len()
            ),
            DateStatus::Ready => write!(f, "ready"),
            DateStatus::Processing => write!(f, "processing"),
            DateStatus::Merged => write!(f, "merged"),
            DateStatus::Failed { attempts } => write!(f, "failed after {} attempts", attempts),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReadinessOptions {
    /// Ignore Success records and the attempt ceiling; allow today's finished hours.
    pub force: bool,
    /// Failed records with this many attempts are not retried unless forced.
    pub max_date_attempts: u32,
    /// Unhealthy files do not block an hour that also has healthy files.
    pub exclude_unhealthy: bool,
}

/// A date with the cameras that should be merged for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyDate {
    pub date: NaiveDate,
    pub cameras: Vec<String>,
}

/// Per-camera statuses for one date.
#[derive(Debug, Clone)]
pub struct DateAssessment {
    pub date: NaiveDate,
    pub statuses: Vec<(String, DateStatus)>,
}

impl DateAssessment {
    pub fn is_blocked(&self) -> bool {
        self.statuses
            .iter()
            .any(|(_, status)| matches!(status, DateStatus::Incomplete { .. }))
    }

    pub fn ready_cameras(&self) -> Vec<String> {
        self.statuses
            .iter()
            .filter(|(_, status)| *status == DateStatus::Ready)
            .map(|(camera, _)| camera.clone())
            .collect()
    }
}

/// Hours that must be covered for `date`, or `None` when the date is not eligible.
///
/// Past dates need all 24 hours. Today is eligible only when forced, and then
/// needs the hours that have already ended.
pub fn required_hours(date: NaiveDate, now: DateTime<FixedOffset>, force: bool) -> Option<Vec<u8>> {
    let today = now.date_naive();
    if date < today {
        return Some((0..HOURS_PER_DAY).collect());
    }
    if date == today && force {
        let finished = now.hour() as u8;
        return (finished > 0).then(|| (0..finished).collect());
    }
    None
}

/// Status of one camera for one date.
pub fn camera_date_status(
    key: &RecordKey,
    inventory: Option<&DateInventory>,
    hours: &[u8],
    store: &RecordStore,
    options: &ReadinessOptions,
) -> DateStatus {
    if store.is_reserved(key) {
        return DateStatus::Processing;
    }

    let record = store.get(key);
    if !options.force && record.map_or(false, |r| r.is_complete()) {
        return DateStatus::Merged;
    }

    let mut missing = Vec::new();
    let mut unhealthy = Vec::new();
    for &hour in hours {
        match inventory.and_then(|inv| inv.hours.get(&hour)) {
            None => missing.push(hour),
            Some(bucket) if bucket.healthy_count() == 0 => missing.push(hour),
            Some(bucket) if !bucket.is_covered(options.exclude_unhealthy) => unhealthy.push(hour),
            Some(_) => {}
        }
    }
    if !missing.is_empty() || !unhealthy.is_empty() {
        return DateStatus::Incomplete { missing, unhealthy };
    }

    match record {
        Some(r) if !options.force && !r.is_success() && r.retry_count >= options.max_date_attempts => {
            DateStatus::Failed {
                attempts: r.retry_count,
            }
        }
        _ => DateStatus::Ready,
    }
}

/// Assesses every eligible date seen in any inventory, oldest first.
pub fn assess_dates(
    inventories: &[CameraInventory],
    store: &RecordStore,
    now: DateTime<FixedOffset>,
    options: &ReadinessOptions,
) -> Vec<DateAssessment> {
    let dates: BTreeSet<NaiveDate> = inventories
        .iter()
        .flat_map(|inv| inv.dates.keys().copied())
        .collect();

    dates
        .into_iter()
        .filter_map(|date| {
            let hours = required_hours(date, now, options.force)?;
            let statuses = inventories
                .iter()
                .map(|inv| {
                    let key = RecordKey::new(inv.camera.clone(), date);
                    let status = camera_date_status(&key, inv.date(date), &hours, store, options);
                    (inv.camera.clone(), status)
                })
                .collect();
            Some(DateAssessment { date, statuses })
        })
        .collect()
}

/// Dates to merge this cycle, oldest first, each with its ready cameras.
///
/// `inventories` must contain one entry per required camera (empty for an
/// offline camera) so that a missing camera blocks the date.
pub fn detect_ready_dates(
    inventories: &[CameraInventory],
    store: &RecordStore,
    now: DateTime<FixedOffset>,
    options: &ReadinessOptions,
) -> Vec<ReadyDate> {
    if inventories.is_empty() {
        return Vec::new();
    }

    assess_dates(inventories, store, now, options)
        .into_iter()
        .filter(|assessment| !assessment.is_blocked())
        .filter_map(|assessment| {
            let cameras = assessment.ready_cameras();
            (!cameras.is_empty()).then_some(ReadyDate {
                date: assessment.date,
                cameras,
            })
        })
        .collect()
}
