//! Core configuration structures and loading logic

use chrono::{DateTime, FixedOffset, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value parsed but is outside its valid range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Filesystem locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathsConfig {
    /// Root directory holding every camera tree
    #[serde(default = "default_video_root")]
    pub video_root: PathBuf,
    /// Output directory for merged files (relative paths resolve under video_root)
    #[serde(default = "default_merged_dir")]
    pub merged_dir: PathBuf,
    /// Process record file (relative paths resolve under video_root)
    #[serde(default = "default_record_file")]
    pub record_file: PathBuf,
}

fn default_video_root() -> PathBuf {
    PathBuf::from("/var/lib/daymerge/videos")
}

fn default_merged_dir() -> PathBuf {
    PathBuf::from("merged_videos")
}

fn default_record_file() -> PathBuf {
    PathBuf::from("processed.json")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            video_root: default_video_root(),
            merged_dir: default_merged_dir(),
            record_file: default_record_file(),
        }
    }
}

/// One monitored camera
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CameraConfig {
    /// Label used in output file names and records
    pub name: String,
    /// Camera root (defaults to `video_root/<name>`)
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Restrict the inventory to hour folders under this device-id directory
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Camera selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CamerasConfig {
    /// Directory between a camera root and its device-id directories
    #[serde(default = "default_camera_subdir")]
    pub camera_subdir: String,
    /// Cameras that must all be complete before a date merges (empty = discover)
    #[serde(default)]
    pub required: Vec<CameraConfig>,
}

fn default_camera_subdir() -> String {
    "xiaomi_camera_videos".to_string()
}

impl Default for CamerasConfig {
    fn default() -> Self {
        Self {
            camera_subdir: default_camera_subdir(),
            required: Vec::new(),
        }
    }
}

/// Scan loop and inventory settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanConfig {
    /// Seconds between scan cycles (default 600)
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// Minimum size in KB for a file to count as healthy (default 1024)
    #[serde(default = "default_min_valid_size_kb")]
    pub min_valid_size_kb: u64,
    /// Probe every source file for decodability
    #[serde(default)]
    pub deep_check: bool,
    /// Let unhealthy files be ignored when the hour also has a healthy file
    #[serde(default)]
    pub exclude_unhealthy: bool,
    /// `local`, `utc` or a fixed offset such as `+08:00`
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_scan_interval_secs() -> u64 {
    600
}

fn default_min_valid_size_kb() -> u64 {
    1024
}

fn default_timezone() -> String {
    "local".to_string()
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval_secs(),
            min_valid_size_kb: default_min_valid_size_kb(),
            deep_check: false,
            exclude_unhealthy: false,
            timezone: default_timezone(),
        }
    }
}

/// Merge execution settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeConfig {
    /// Overall budget in seconds for one hour-merge command (default 1800)
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,
    /// Watchdog slice in seconds, strictly below max_timeout_secs (default 600)
    #[serde(default = "default_sub_timeout_secs")]
    pub sub_timeout_secs: u64,
    /// Maximum invocations of one command (default 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds to wait after a non-timeout failure (default 5)
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Failed attempts after which a date is left alone until forced (default 3)
    #[serde(default = "default_max_date_attempts")]
    pub max_date_attempts: u32,
    /// Concurrent merges; only 1 is supported
    #[serde(default = "default_max_workers")]
    pub max_workers: u32,
    /// Ask ffmpeg for hardware-accelerated decoding (default true)
    #[serde(default = "default_true")]
    pub use_hw_accel: bool,
    /// Keep intermediate hour files after the day merge
    #[serde(default)]
    pub save_hourly: bool,
    /// Remove concat list files after each merge (default true)
    #[serde(default = "default_true")]
    pub cleanup_temp_files: bool,
    /// Probe merged output before accepting it (default true)
    #[serde(default = "default_true")]
    pub verify_merged_files: bool,
    /// ffmpeg binary
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    /// ffprobe binary
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
}

fn default_max_timeout_secs() -> u64 {
    1800
}

fn default_sub_timeout_secs() -> u64 {
    600
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_max_date_attempts() -> u32 {
    3
}

fn default_max_workers() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_timeout_secs: default_max_timeout_secs(),
            sub_timeout_secs: default_sub_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            max_date_attempts: default_max_date_attempts(),
            max_workers: default_max_workers(),
            use_hw_accel: true,
            save_hourly: false,
            cleanup_temp_files: true,
            verify_merged_files: true,
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
        }
    }
}

impl MergeConfig {
    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.max_timeout_secs)
    }

    pub fn sub_timeout(&self) -> Duration {
        Duration::from_secs(self.sub_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Retention windows (0 disables the cleaner)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_days")]
    pub delete_original_after_days: u32,
    #[serde(default = "default_retention_days")]
    pub delete_merged_after_days: u32,
}

fn default_retention_days() -> u32 {
    1
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            delete_original_after_days: default_retention_days(),
            delete_merged_after_days: default_retention_days(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub cameras: CamerasConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Timezone used to decide what "today" is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timezone {
    Local,
    Utc,
    Fixed(FixedOffset),
}

impl Timezone {
    /// Parse `local`, `utc` or `±HH:MM`
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let trimmed = s.trim();
        match trimmed.to_lowercase().as_str() {
            "local" => return Ok(Timezone::Local),
            "utc" | "z" => return Ok(Timezone::Utc),
            _ => {}
        }

        let invalid = || ConfigError::Invalid(format!("timezone '{}' is not local, utc or ±HH:MM", s));
        let (sign, rest) = match trimmed.chars().next() {
            Some('+') => (1, &trimmed[1..]),
            Some('-') => (-1, &trimmed[1..]),
            _ => return Err(invalid()),
        };
        let (hours, minutes) = rest.split_once(':').ok_or_else(invalid)?;
        let hours: i32 = hours.parse().map_err(|_| invalid())?;
        let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
        if hours > 23 || minutes > 59 {
            return Err(invalid());
        }
        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
            .map(Timezone::Fixed)
            .ok_or_else(invalid)
    }

    /// Convert a UTC instant into this timezone
    pub fn at(&self, instant: DateTime<Utc>) -> DateTime<FixedOffset> {
        match self {
            Timezone::Local => instant.with_timezone(&Local).fixed_offset(),
            Timezone::Utc => instant.fixed_offset(),
            Timezone::Fixed(offset) => instant.with_timezone(offset),
        }
    }

    /// Current time in this timezone
    pub fn now(&self) -> DateTime<FixedOffset> {
        self.at(Utc::now())
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - DAYMERGE_VIDEO_ROOT -> paths.video_root
    /// - DAYMERGE_MERGED_DIR -> paths.merged_dir
    /// - DAYMERGE_SCAN_INTERVAL_SECS -> scan.scan_interval_secs
    /// - DAYMERGE_DEEP_CHECK -> scan.deep_check
    /// - DAYMERGE_USE_HW_ACCEL -> merge.use_hw_accel
    /// - DAYMERGE_MAX_TIMEOUT_SECS -> merge.max_timeout_secs
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("DAYMERGE_VIDEO_ROOT") {
            if !val.is_empty() {
                self.paths.video_root = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("DAYMERGE_MERGED_DIR") {
            if !val.is_empty() {
                self.paths.merged_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("DAYMERGE_SCAN_INTERVAL_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.scan.scan_interval_secs = secs;
            }
        }

        if let Ok(val) = env::var("DAYMERGE_DEEP_CHECK") {
            if let Some(flag) = parse_bool(&val) {
                self.scan.deep_check = flag;
            }
        }

        if let Ok(val) = env::var("DAYMERGE_USE_HW_ACCEL") {
            if let Some(flag) = parse_bool(&val) {
                self.merge.use_hw_accel = flag;
            }
        }

        if let Ok(val) = env::var("DAYMERGE_MAX_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.merge.max_timeout_secs = secs;
            }
        }
    }

    /// Check ranges and cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        let merge = &self.merge;
        if merge.sub_timeout_secs == 0 {
            return Err(ConfigError::Invalid("merge.sub_timeout_secs must be > 0".into()));
        }
        if merge.sub_timeout_secs >= merge.max_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "merge.sub_timeout_secs ({}) must be smaller than merge.max_timeout_secs ({})",
                merge.sub_timeout_secs, merge.max_timeout_secs
            )));
        }
        if merge.max_retries == 0 {
            return Err(ConfigError::Invalid("merge.max_retries must be >= 1".into()));
        }
        if merge.max_date_attempts == 0 {
            return Err(ConfigError::Invalid("merge.max_date_attempts must be >= 1".into()));
        }
        if merge.max_workers != 1 {
            return Err(ConfigError::Invalid(format!(
                "merge.max_workers = {} is not supported; merges run one at a time",
                merge.max_workers
            )));
        }
        if self.scan.scan_interval_secs == 0 {
            return Err(ConfigError::Invalid("scan.scan_interval_secs must be >= 1".into()));
        }
        Timezone::parse(&self.scan.timezone)?;

        let mut seen = HashSet::new();
        for camera in &self.cameras.required {
            if camera.name.is_empty() || camera.name.contains(['/', '\\']) {
                return Err(ConfigError::Invalid(format!(
                    "camera name '{}' must be non-empty and contain no path separators",
                    camera.name
                )));
            }
            if !seen.insert(camera.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "camera '{}' is listed twice",
                    camera.name
                )));
            }
        }

        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, validated
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Directory that receives `<YYYYMMDD>/` output folders
    pub fn merged_root(&self) -> PathBuf {
        self.paths.video_root.join(&self.paths.merged_dir)
    }

    /// Location of the process record file
    pub fn record_path(&self) -> PathBuf {
        self.paths.video_root.join(&self.paths.record_file)
    }

    /// Parsed timezone; `validate` guarantees this succeeds on a loaded config
    pub fn timezone(&self) -> Result<Timezone, ConfigError> {
        Timezone::parse(&self.scan.timezone)
    }

    /// Minimum healthy file size in bytes
    pub fn min_valid_bytes(&self) -> u64 {
        self.scan.min_valid_size_kb.saturating_mul(1024)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan.scan_interval_secs)
    }
}

// Accept "true", "1", "yes" as true; "false", "0", "no" as false
fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
