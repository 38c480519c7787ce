//! Process record store.
//!
//! One record per (camera, date) holding the outcome of the last merge
//! attempt. Records are the only durable state besides the videos. A Success
//! record is written only after the merged file has been verified on disk.
//!
//! The store is a single JSON document (`{"version": 1, "records": [...]}`),
//! rewritten atomically on every save.

use crate::persist::{atomic_write, quarantine};
use crate::transcode::Transcoder;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

/// Current on-disk format version.
pub const RECORD_FORMAT_VERSION: u32 = 1;

/// Errors from loading or saving the store.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record store IO error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to serialize records: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Identity of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub camera: String,
    pub date: NaiveDate,
}

impl RecordKey {
    pub fn new(camera: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            camera: camera.into(),
            date,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.camera, self.date)
    }
}

/// Outcome of the last concluded attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Failed => write!(f, "failed"),
        }
    }
}

/// Persisted entry for one camera and date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub camera: String,
    pub date: NaiveDate,
    pub outcome: Outcome,
    /// Merged day file (written or intended).
    pub output_path: PathBuf,
    /// When the outcome was recorded.
    pub timestamp: DateTime<Utc>,
    /// Number of failed attempts so far.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// The output covers only the hours finished when a forced merge ran.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
    /// Set once retention removed the source recordings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub originals_deleted_at: Option<DateTime<Utc>>,
    /// Set once retention removed the merged output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_deleted_at: Option<DateTime<Utc>>,
}

impl ProcessRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.camera.clone(), self.date)
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    /// Success covering the whole day.
    pub fn is_complete(&self) -> bool {
        self.is_success() && !self.partial
    }
}

/// Result of one concluded attempt, as handed to [`RecordStore::upsert`].
#[derive(Debug, Clone)]
pub enum AttemptResult {
    /// `partial` marks an output built from part of the day.
    Success { output: PathBuf, partial: bool },
    Failed { output: PathBuf, reason: String },
}

/// Selection for [`RecordStore::list`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub camera: Option<String>,
    pub outcome: Option<Outcome>,
    pub date: Option<NaiveDate>,
}

impl RecordFilter {
    pub fn successes() -> Self {
        Self {
            outcome: Some(Outcome::Success),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &ProcessRecord) -> bool {
        self.camera.as_ref().map_or(true, |c| *c == record.camera)
            && self.outcome.map_or(true, |o| o == record.outcome)
            && self.date.map_or(true, |d| d == record.date)
    }
}

/// Summary of a verify pass.
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    pub checked: usize,
    pub downgraded: Vec<RecordKey>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordFile<T> {
    version: u32,
    records: Vec<T>,
}

/// In-memory view of the record file plus in-flight reservations.
#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    records: BTreeMap<RecordKey, ProcessRecord>,
    reserved: HashSet<RecordKey>,
}

impl RecordStore {
    /// An empty store that will save to `path`.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: BTreeMap::new(),
            reserved: HashSet::new(),
        }
    }

    /// Loads the store from `path`.
    ///
    /// A missing file yields an empty store. A file that is not a valid record
    /// document is moved aside to `<file>.corrupt-<ts>` and an empty store is
    /// used. Individual entries that fail to parse are skipped.
    pub fn load(path: &Path) -> Result<Self, RecordError> {
        let mut store = Self::empty(path);

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(store),
            Err(e) => return Err(e.into()),
        };

        let document: RecordFile<serde_json::Value> = match serde_json::from_str(&content) {
            Ok(document) => document,
            Err(e) => {
                let moved = quarantine(path)?;
                error!(
                    path = %path.display(),
                    moved_to = %moved.display(),
                    error = %e,
                    "record file unreadable; starting with an empty store"
                );
                return Ok(store);
            }
        };

        if document.version != RECORD_FORMAT_VERSION {
            warn!(version = document.version, "unexpected record file version; reading anyway");
        }

        for (index, raw) in document.records.into_iter().enumerate() {
            match serde_json::from_value::<ProcessRecord>(raw) {
                Ok(record) => {
                    store.records.insert(record.key(), record);
                }
                Err(e) => {
                    error!(index, error = %e, "skipping unreadable process record");
                }
            }
        }

        info!(path = %path.display(), count = store.records.len(), "loaded process records");
        Ok(store)
    }

    /// Writes the store atomically.
    pub fn save(&self) -> Result<(), RecordError> {
        let document = RecordFile {
            version: RECORD_FORMAT_VERSION,
            records: self.records.values().collect(),
        };
        let json = serde_json::to_vec_pretty(&document)?;
        atomic_write(&self.path, &json)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &RecordKey) -> Option<&ProcessRecord> {
        self.records.get(key)
    }

    /// Records the conclusion of an attempt.
    ///
    /// A failed attempt increments `retry_count`; a success keeps it and clears
    /// the failure reason and any deletion marks from an earlier output.
    pub fn upsert(&mut self, key: RecordKey, result: AttemptResult, at: DateTime<Utc>) -> &ProcessRecord {
        let previous_retries = self.records.get(&key).map_or(0, |r| r.retry_count);

        let record = match result {
            AttemptResult::Success { output, partial } => ProcessRecord {
                camera: key.camera.clone(),
                date: key.date,
                outcome: Outcome::Success,
                output_path: output,
                timestamp: at,
                retry_count: previous_retries,
                failure_reason: None,
                partial,
                originals_deleted_at: None,
                merged_deleted_at: None,
            },
            AttemptResult::Failed { output, reason } => ProcessRecord {
                camera: key.camera.clone(),
                date: key.date,
                outcome: Outcome::Failed,
                output_path: output,
                timestamp: at,
                retry_count: previous_retries.saturating_add(1),
                failure_reason: Some(reason),
                partial: false,
                originals_deleted_at: None,
                merged_deleted_at: None,
            },
        };

        match self.records.entry(key) {
            Entry::Occupied(mut entry) => {
                entry.insert(record);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(record),
        }
    }

    /// Records matching `filter`, ordered by camera then date.
    pub fn list(&self, filter: &RecordFilter) -> Vec<&ProcessRecord> {
        self.records.values().filter(|r| filter.matches(r)).collect()
    }

    /// Re-checks every Success record whose output has not been retired.
    ///
    /// A record is downgraded to Failed when its file is missing, smaller than
    /// `min_bytes`, or (when a prober is given) not playable.
    pub fn verify(&mut self, min_bytes: u64, prober: Option<&dyn Transcoder>, at: DateTime<Utc>) -> VerifyReport {
        let targets = self.verify_targets();
        let checked = targets.len();
        let failures: Vec<(RecordKey, String)> = targets
            .into_iter()
            .filter_map(|(key, output)| check_output(&output, min_bytes, prober).err().map(|reason| (key, reason)))
            .collect();
        self.apply_verification(checked, failures, at)
    }

    /// Success records whose output has not been retired, with their outputs.
    ///
    /// Lets callers run the file checks elsewhere and hand the failures to
    /// [`RecordStore::apply_verification`].
    pub fn verify_targets(&self) -> Vec<(RecordKey, PathBuf)> {
        self.records
            .values()
            .filter(|r| r.is_success() && r.merged_deleted_at.is_none())
            .map(|r| (r.key(), r.output_path.clone()))
            .collect()
    }

    /// Downgrades each `(key, reason)` to Failed.
    pub fn apply_verification(
        &mut self,
        checked: usize,
        failures: Vec<(RecordKey, String)>,
        at: DateTime<Utc>,
    ) -> VerifyReport {
        let mut report = VerifyReport {
            checked,
            downgraded: Vec::new(),
        };

        for (key, reason) in failures {
            let Some(record) = self.records.get_mut(&key) else {
                continue;
            };
            warn!(
                camera = %record.camera,
                date = %record.date,
                output = %record.output_path.display(),
                reason = %reason,
                "merged output failed verification; downgrading record"
            );
            record.outcome = Outcome::Failed;
            record.failure_reason = Some(format!("verification failed: {}", reason));
            record.timestamp = at;
            report.downgraded.push(key);
        }

        report
    }

    /// Removes Failed records whose output file does not exist.
    pub fn clean(&mut self) -> Vec<RecordKey> {
        let stale: Vec<RecordKey> = self
            .records
            .values()
            .filter(|r| r.outcome == Outcome::Failed && !r.output_path.exists())
            .map(ProcessRecord::key)
            .collect();

        for key in &stale {
            self.records.remove(key);
            info!(record = %key, "removed stale failed record");
        }
        stale
    }

    pub fn mark_originals_deleted(&mut self, key: &RecordKey, at: DateTime<Utc>) {
        if let Some(record) = self.records.get_mut(key) {
            record.originals_deleted_at = Some(at);
        }
    }

    pub fn mark_merged_deleted(&mut self, key: &RecordKey, at: DateTime<Utc>) {
        if let Some(record) = self.records.get_mut(key) {
            record.merged_deleted_at = Some(at);
        }
    }

    /// Claims a (camera, date) for an attempt. Returns false when already held.
    pub fn reserve(&mut self, key: &RecordKey) -> bool {
        self.reserved.insert(key.clone())
    }

    pub fn release(&mut self, key: &RecordKey) {
        self.reserved.remove(key);
    }

    pub fn is_reserved(&self, key: &RecordKey) -> bool {
        self.reserved.contains(key)
    }
}

/// Existence, size and optional playability check for a merged output.
pub fn check_output(path: &Path, min_bytes: u64, prober: Option<&dyn Transcoder>) -> Result<(), String> {
    let metadata = fs::metadata(path).map_err(|e| format!("cannot stat output: {}", e))?;
    if metadata.len() < min_bytes {
        return Err(format!("output is {} bytes, minimum {}", metadata.len(), min_bytes));
    }
    if let Some(prober) = prober {
        let probe = prober.probe(path).map_err(|e| e.to_string())?;
        if !probe.is_playable() {
            return Err("output has no playable video".to_string());
        }
    }
    Ok(())
}
