//! Durable file writes.
//!
//! Writes go to a uniquely named sibling temp file, are synced, then renamed
//! over the destination, so readers never observe a half-written file.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Path of the temp file used while writing `dest`.
///
/// Format: `.<name>.<uuid>.tmp` in the same directory as `dest`, so the final
/// rename never crosses filesystems.
pub fn temp_path_for(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    dest.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4()))
}

/// Atomically replaces `dest` with `contents`.
///
/// # Arguments
///
/// * `dest` - Final location; parent directories are created
/// * `contents` - Complete new file contents
///
/// On error the previous `dest` (if any) is left untouched and the temp file
/// is removed.
pub fn atomic_write(dest: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp = temp_path_for(dest);
    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, dest)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Path a damaged file is moved to: `<name>.corrupt-<unix seconds>`.
pub fn quarantine_path(path: &Path) -> PathBuf {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut quarantined = path.as_os_str().to_owned();
    quarantined.push(format!(".corrupt-{}", timestamp));
    PathBuf::from(quarantined)
}

/// Moves a damaged file aside and returns where it went.
pub fn quarantine(path: &Path) -> io::Result<PathBuf> {
    let target = quarantine_path(path);
    fs::rename(path, &target)?;
    Ok(target)
}
