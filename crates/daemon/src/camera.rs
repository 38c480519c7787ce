//! Camera sources: which directory trees are monitored and under what name.

use crate::config::Config;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// A monitored camera tree. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraSource {
    /// Label used in output names and process records.
    pub name: String,
    /// Camera root directory (`video_root/<name>` unless configured).
    pub root: PathBuf,
    /// Directory between the root and the device-id directories.
    pub camera_subdir: String,
    /// When set, only hour folders directly under this device-id directory count.
    pub device_id: Option<String>,
}

impl CameraSource {
    /// Directory the scanner walks for hour folders.
    pub fn scan_root(&self) -> PathBuf {
        self.root.join(&self.camera_subdir)
    }
}

/// Resolves the configured cameras, or discovers them when none are listed.
///
/// Discovery treats every directory directly under `video_root` that contains
/// `camera_subdir` as a camera named after that directory. The merged output
/// directory is never treated as a camera.
pub fn resolve_cameras(config: &Config) -> Vec<CameraSource> {
    let subdir = config.cameras.camera_subdir.clone();

    if !config.cameras.required.is_empty() {
        return config
            .cameras
            .required
            .iter()
            .map(|camera| CameraSource {
                name: camera.name.clone(),
                root: camera
                    .root
                    .clone()
                    .unwrap_or_else(|| config.paths.video_root.join(&camera.name)),
                camera_subdir: subdir.clone(),
                device_id: camera.device_id.clone(),
            })
            .collect();
    }

    let cameras = discover_cameras(&config.paths.video_root, &config.merged_root(), &subdir);
    info!(
        count = cameras.len(),
        root = %config.paths.video_root.display(),
        "discovered camera directories"
    );
    cameras
}

/// Lists `video_root/<name>/<camera_subdir>` directories, sorted by name.
pub fn discover_cameras(video_root: &Path, merged_root: &Path, camera_subdir: &str) -> Vec<CameraSource> {
    let entries = match fs::read_dir(video_root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(root = %video_root.display(), error = %e, "cannot list video root");
            return Vec::new();
        }
    };

    let mut cameras: Vec<CameraSource> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir() && path != merged_root)
        .filter(|path| path.join(camera_subdir).is_dir())
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?.to_string();
            Some(CameraSource {
                name,
                root: path,
                camera_subdir: camera_subdir.to_string(),
                device_id: None,
            })
        })
        .collect();

    cameras.sort_by(|a, b| a.name.cmp(&b.name));
    cameras
}
