//! Inventory scanner for camera directory trees.
//!
//! Walks a camera's tree for hour folders named `YYYYMMDDHH`, collects the
//! recordings inside them (`*.mp4` and rotated `*.mp4.old`), and groups them by
//! calendar date and hour with a health verdict per file. The scanner is
//! read-only; deep checks only run the probe.

use crate::camera::CameraSource;
use crate::transcode::Transcoder;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Hour folders are searched at most this many levels below the scan root.
pub const HOUR_FOLDER_MAX_DEPTH: usize = 4;

/// Suffix of a recording that is still open for writing.
pub const LIVE_SUFFIX: &str = ".mp4";
/// Suffix of a recording that was rotated and closed.
pub const ROLLED_SUFFIX: &str = ".mp4.old";

/// Health verdict for one source file.
#[derive(Debug, Clone, PartialEq)]
pub enum FileHealth {
    Healthy,
    /// Smaller than the configured minimum.
    Undersized { size_bytes: u64, min_bytes: u64 },
    /// Deep check could not decode the file.
    Unplayable(String),
}

impl FileHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, FileHealth::Healthy)
    }
}

/// A recording discovered inside an hour folder.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified_time: SystemTime,
    /// True for rotated `.mp4.old` files.
    pub rolled: bool,
    pub health: FileHealth,
}

impl SourceFile {
    /// File name with the rotation suffix removed, used for ordering.
    fn capture_name(&self) -> String {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match name.strip_suffix(".old") {
            Some(stripped) if self.rolled => stripped.to_string(),
            _ => name,
        }
    }
}

/// All recordings for one camera, date and hour.
#[derive(Debug, Clone)]
pub struct HourBucket {
    pub camera: String,
    pub date: NaiveDate,
    pub hour: u8,
    /// Hour folders that contributed (several device directories may share an hour).
    pub folders: Vec<PathBuf>,
    /// Files in stable concatenation order.
    pub files: Vec<SourceFile>,
}

impl HourBucket {
    pub fn healthy_count(&self) -> usize {
        self.files.iter().filter(|f| f.health.is_healthy()).count()
    }

    pub fn unhealthy_count(&self) -> usize {
        self.files.len() - self.healthy_count()
    }

    /// True when the hour can be merged: at least one healthy file, and no
    /// unhealthy ones unless they are excluded.
    pub fn is_covered(&self, exclude_unhealthy: bool) -> bool {
        self.healthy_count() > 0 && (exclude_unhealthy || self.unhealthy_count() == 0)
    }

    /// Healthy files in concatenation order.
    pub fn merge_inputs(&self) -> Vec<PathBuf> {
        self.files
            .iter()
            .filter(|f| f.health.is_healthy())
            .map(|f| f.path.clone())
            .collect()
    }

    fn sort_files(&mut self) {
        self.files.sort_by(|a, b| {
            a.capture_name()
                .cmp(&b.capture_name())
                .then(a.modified_time.cmp(&b.modified_time))
                .then(a.path.cmp(&b.path))
        });
    }
}

/// Hours observed for one camera and date.
#[derive(Debug, Clone)]
pub struct DateInventory {
    pub date: NaiveDate,
    pub hours: BTreeMap<u8, HourBucket>,
}

impl DateInventory {
    /// Every file under this date, across hours.
    pub fn files(&self) -> impl Iterator<Item = &SourceFile> {
        self.hours.values().flat_map(|bucket| bucket.files.iter())
    }

    /// Every hour folder under this date.
    pub fn folders(&self) -> impl Iterator<Item = &PathBuf> {
        self.hours.values().flat_map(|bucket| bucket.folders.iter())
    }
}

/// Snapshot of one camera's tree.
#[derive(Debug, Clone)]
pub struct CameraInventory {
    pub camera: String,
    pub dates: BTreeMap<NaiveDate, DateInventory>,
}

impl CameraInventory {
    pub fn empty(camera: &str) -> Self {
        Self {
            camera: camera.to_string(),
            dates: BTreeMap::new(),
        }
    }

    pub fn date(&self, date: NaiveDate) -> Option<&DateInventory> {
        self.dates.get(&date)
    }
}

/// Settings that decide file health.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Minimum size in bytes for a healthy file.
    pub min_valid_bytes: u64,
    /// Probe each sufficiently large file for decodability.
    pub deep_check: bool,
}

/// Parses an hour folder name (`YYYYMMDDHH`) into its date and hour.
pub fn parse_hour_folder(name: &str) -> Option<(NaiveDate, u8)> {
    if name.len() != 10 || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let date = NaiveDate::parse_from_str(&name[..8], "%Y%m%d").ok()?;
    let hour: u8 = name[8..].parse().ok()?;
    (hour < 24).then_some((date, hour))
}

/// Classifies a recording by suffix: `Some(false)` live, `Some(true)` rolled.
pub fn recording_kind(path: &Path) -> Option<bool> {
    let name = path.file_name()?.to_str()?.to_lowercase();
    if name.ends_with(ROLLED_SUFFIX) {
        Some(true)
    } else if name.ends_with(LIVE_SUFFIX) {
        Some(false)
    } else {
        None
    }
}

/// Health of a file of `size_bytes`; runs the probe only for deep checks on
/// files that already pass the size check.
pub fn assess_health(
    path: &Path,
    size_bytes: u64,
    options: &ScanOptions,
    prober: &dyn Transcoder,
) -> FileHealth {
    if size_bytes < options.min_valid_bytes {
        return FileHealth::Undersized {
            size_bytes,
            min_bytes: options.min_valid_bytes,
        };
    }
    if options.deep_check {
        match prober.probe(path) {
            Ok(probe) if probe.is_playable() => {}
            Ok(_) => return FileHealth::Unplayable("no decodable video stream".to_string()),
            Err(e) => return FileHealth::Unplayable(e.to_string()),
        }
    }
    FileHealth::Healthy
}

/// Scans one camera's tree.
///
/// This function:
/// - Walks the camera's scan root up to `HOUR_FOLDER_MAX_DEPTH` levels
/// - Skips hidden directories (names starting with `.`)
/// - Treats directories named `YYYYMMDDHH` as hour folders, filtered by device id
/// - Collects `.mp4` and `.mp4.old` files and classifies their health
///
/// A missing root yields an empty inventory.
pub fn scan_camera(camera: &CameraSource, options: &ScanOptions, prober: &dyn Transcoder) -> CameraInventory {
    let mut inventory = CameraInventory::empty(&camera.name);
    let root = camera.scan_root();

    if !root.is_dir() {
        warn!(camera = %camera.name, root = %root.display(), "camera root missing; treating as offline");
        return inventory;
    }

    let mut walker = WalkDir::new(&root)
        .min_depth(1)
        .max_depth(HOUR_FOLDER_MAX_DEPTH)
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(camera = %camera.name, error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }

        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if name.starts_with('.') {
            walker.skip_current_dir();
            continue;
        }

        let Some((date, hour)) = parse_hour_folder(name) else {
            continue;
        };
        // Hour folders hold files only
        walker.skip_current_dir();

        if let Some(device_id) = &camera.device_id {
            let parent_name = entry
                .path()
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str());
            if parent_name != Some(device_id.as_str()) {
                continue;
            }
        }

        let files = read_hour_folder(entry.path(), options, prober);
        let bucket = inventory
            .dates
            .entry(date)
            .or_insert_with(|| DateInventory {
                date,
                hours: BTreeMap::new(),
            })
            .hours
            .entry(hour)
            .or_insert_with(|| HourBucket {
                camera: camera.name.clone(),
                date,
                hour,
                folders: Vec::new(),
                files: Vec::new(),
            });
        bucket.folders.push(entry.path().to_path_buf());
        bucket.files.extend(files);
    }

    for date_inventory in inventory.dates.values_mut() {
        for bucket in date_inventory.hours.values_mut() {
            bucket.sort_files();
        }
    }

    debug!(camera = %camera.name, dates = inventory.dates.len(), "camera scanned");
    inventory
}

fn read_hour_folder(folder: &Path, options: &ScanOptions, prober: &dyn Transcoder) -> Vec<SourceFile> {
    let entries = match fs::read_dir(folder) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(folder = %folder.display(), error = %e, "cannot read hour folder");
            return Vec::new();
        }
    };

    let mut files = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let Some(rolled) = recording_kind(&path) else {
            continue;
        };
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }

        let size_bytes = metadata.len();
        let health = assess_health(&path, size_bytes, options, prober);
        if !health.is_healthy() {
            warn!(file = %path.display(), health = ?health, "unhealthy recording");
        }

        files.push(SourceFile {
            path,
            size_bytes,
            modified_time: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            rolled,
            health,
        });
    }
    files
}
