//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Semantic validation failure
    Invalid(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(errors) => {
                write!(f, "Invalid configuration: {}", errors.join("; "))
            }
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

/// Storage-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Path to the SQLite state database
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Soft cap on tracked file entries; oldest are pruned beyond this
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
    /// How long terminal records are retained before GC removes them
    #[serde(default = "default_keep_processed_days")]
    pub keep_processed_days: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("state.db")
}

fn default_max_entries() -> u64 {
    5000
}

fn default_keep_processed_days() -> u64 {
    30
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_entries: default_max_entries(),
            keep_processed_days: default_keep_processed_days(),
        }
    }
}

/// Planner loop configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannerConfig {
    /// Maximum records picked per tick
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// In-flight handler cap (0 = derive from CPU count)
    #[serde(default)]
    pub parallelism: u32,
    /// Lower bound on idle sleep between ticks
    #[serde(default = "default_min_sleep_sec")]
    pub min_sleep_sec: u64,
    /// Upper bound on idle sleep between ticks
    #[serde(default = "default_max_sleep_sec")]
    pub max_sleep_sec: u64,
    /// Lease lifetime for picked records (0 = derive from integrity timeout)
    #[serde(default)]
    pub lease_ttl_sec: u64,
    /// How often the monitoring loop runs GC and compaction
    #[serde(default = "default_maintenance_interval_sec")]
    pub maintenance_interval_sec: u64,
    /// How long running handlers get to finish on shutdown
    #[serde(default = "default_shutdown_grace_sec")]
    pub shutdown_grace_sec: u64,
}

fn default_batch_size() -> u32 {
    50
}

fn default_min_sleep_sec() -> u64 {
    1
}

fn default_max_sleep_sec() -> u64 {
    60
}

fn default_maintenance_interval_sec() -> u64 {
    600
}

fn default_shutdown_grace_sec() -> u64 {
    10
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            parallelism: 0,
            min_sleep_sec: default_min_sleep_sec(),
            max_sleep_sec: default_max_sleep_sec(),
            lease_ttl_sec: 0,
            maintenance_interval_sec: default_maintenance_interval_sec(),
            shutdown_grace_sec: default_shutdown_grace_sec(),
        }
    }
}

/// Size-stability gate configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StabilityConfig {
    /// How long a file's size must hold before integrity runs
    #[serde(default = "default_stable_wait_sec")]
    pub stable_wait_sec: u64,
    /// Re-sample interval while a file is still growing
    #[serde(default = "default_size_poll_sec")]
    pub size_poll_sec: u64,
}

fn default_stable_wait_sec() -> u64 {
    30
}

fn default_size_poll_sec() -> u64 {
    5
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            stable_wait_sec: default_stable_wait_sec(),
            size_poll_sec: default_size_poll_sec(),
        }
    }
}

/// Integrity check configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntegrityConfig {
    /// Check mode: "quick", "full", or "auto"
    #[serde(default = "default_integrity_mode")]
    pub mode: String,
    /// Per-check deadline in seconds
    #[serde(default = "default_integrity_timeout_sec")]
    pub timeout_sec: u64,
    /// Base retry wait after a recoverable failure
    #[serde(default = "default_backoff_step_sec")]
    pub backoff_step_sec: u64,
    /// Ceiling on the retry wait
    #[serde(default = "default_backoff_max_sec")]
    pub backoff_max_sec: u64,
    /// Attempts before a record is parked as terminal
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_integrity_mode() -> String {
    "quick".to_string()
}

fn default_integrity_timeout_sec() -> u64 {
    300
}

fn default_backoff_step_sec() -> u64 {
    30
}

fn default_backoff_max_sec() -> u64 {
    600
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            mode: default_integrity_mode(),
            timeout_sec: default_integrity_timeout_sec(),
            backoff_step_sec: default_backoff_step_sec(),
            backoff_max_sec: default_backoff_max_sec(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Audio probing and conversion configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioConfig {
    /// Path to the ffprobe binary
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    /// Path to the ffmpeg binary
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// Deadline for an audio probe call
    #[serde(default = "default_probe_timeout_sec")]
    pub probe_timeout_sec: u64,
    /// Deadline for a conversion call
    #[serde(default = "default_convert_timeout_sec")]
    pub convert_timeout_sec: u64,
    /// Audio codec for the stereo companion track
    #[serde(default = "default_audio_codec")]
    pub codec: String,
    /// Bitrate for the stereo companion track
    #[serde(default = "default_audio_bitrate")]
    pub bitrate: String,
    /// Tracked file extensions, including in-progress download suffixes
    /// so renames like `.mkv.part` -> `.mkv` are observed
    #[serde(default = "default_video_extensions")]
    pub video_extensions: Vec<String>,
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_probe_timeout_sec() -> u64 {
    30
}

fn default_convert_timeout_sec() -> u64 {
    3600
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

fn default_audio_bitrate() -> String {
    "192k".to_string()
}

fn default_video_extensions() -> Vec<String> {
    [
        ".mkv", ".mp4", ".avi", ".mov", ".m4v", ".wmv", ".webm", ".tmp", ".part", ".download",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            ffprobe_path: default_ffprobe_path(),
            ffmpeg_path: default_ffmpeg_path(),
            probe_timeout_sec: default_probe_timeout_sec(),
            convert_timeout_sec: default_convert_timeout_sec(),
            codec: default_audio_codec(),
            bitrate: default_audio_bitrate(),
            video_extensions: default_video_extensions(),
        }
    }
}

/// Group completion policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GroupsConfig {
    /// When true, a finished stereo companion alone completes the group
    /// and the original may be deleted by the caller
    #[serde(default)]
    pub delete_original: bool,
}

/// Metrics surface configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    /// Enable the in-process metrics registry
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    /// Local HTTP port for the metrics/status endpoint (0 = disabled)
    #[serde(default)]
    pub http_port: u16,
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            http_port: 0,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub stability: StabilityConfig,
    #[serde(default)]
    pub integrity: IntegrityConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub groups: GroupsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a TOML file
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
    /// - STATE_DB_URL -> storage.db_path
    /// - STATE_BATCH_SIZE -> planner.batch_size
    /// - STATE_STABLE_WAIT_SEC -> stability.stable_wait_sec
    /// - STATE_BACKOFF_STEP_SEC -> integrity.backoff_step_sec
    /// - STATE_BACKOFF_MAX_SEC -> integrity.backoff_max_sec
    /// - STATE_DELETE_ORIGINAL -> groups.delete_original
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("STATE_DB_URL") {
            if !val.is_empty() {
                self.storage.db_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("STATE_BATCH_SIZE") {
            if let Ok(n) = val.parse::<u32>() {
                self.planner.batch_size = n;
            }
        }

        if let Ok(val) = env::var("STATE_STABLE_WAIT_SEC") {
            if let Ok(n) = val.parse::<u64>() {
                self.stability.stable_wait_sec = n;
            }
        }

        if let Ok(val) = env::var("STATE_BACKOFF_STEP_SEC") {
            if let Ok(n) = val.parse::<u64>() {
                self.integrity.backoff_step_sec = n;
            }
        }

        if let Ok(val) = env::var("STATE_BACKOFF_MAX_SEC") {
            if let Ok(n) = val.parse::<u64>() {
                self.integrity.backoff_max_sec = n;
            }
        }

        if let Ok(val) = env::var("STATE_DELETE_ORIGINAL") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.groups.delete_original = true,
                "false" | "0" | "no" => self.groups.delete_original = false,
                _ => {} // Invalid value, keep existing
            }
        }
    }

    /// Validate the configuration, collecting every problem found
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.stability.stable_wait_sec < 1 {
            errors.push("stability.stable_wait_sec must be >= 1".to_string());
        }
        if self.stability.size_poll_sec < 1 {
            errors.push("stability.size_poll_sec must be >= 1".to_string());
        }
        if self.integrity.backoff_step_sec < 1 {
            errors.push("integrity.backoff_step_sec must be >= 1".to_string());
        }
        if self.integrity.backoff_max_sec < self.integrity.backoff_step_sec {
            errors.push("integrity.backoff_max_sec must be >= backoff_step_sec".to_string());
        }
        if self.integrity.max_attempts < 1 {
            errors.push("integrity.max_attempts must be >= 1".to_string());
        }
        if !matches!(self.integrity.mode.as_str(), "quick" | "full" | "auto") {
            errors.push(format!(
                "integrity.mode must be quick, full, or auto (got {:?})",
                self.integrity.mode
            ));
        }
        if self.planner.batch_size < 1 {
            errors.push("planner.batch_size must be >= 1".to_string());
        }
        if self.planner.max_sleep_sec < self.planner.min_sleep_sec {
            errors.push("planner.max_sleep_sec must be >= min_sleep_sec".to_string());
        }
        if self.storage.max_entries < 100 {
            errors.push("storage.max_entries must be >= 100".to_string());
        }
        if self.audio.ffprobe_path.is_empty() {
            errors.push("audio.ffprobe_path must not be empty".to_string());
        }
        if self.audio.ffmpeg_path.is_empty() {
            errors.push("audio.ffmpeg_path must not be empty".to_string());
        }
        if self.audio.video_extensions.is_empty() {
            errors.push("audio.video_extensions must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Effective lease lifetime: explicit value, or derived so a crashed
    /// integrity run becomes reclaimable shortly after its deadline
    pub fn effective_lease_ttl_sec(&self) -> u64 {
        if self.planner.lease_ttl_sec > 0 {
            self.planner.lease_ttl_sec
        } else {
            self.integrity.timeout_sec + 60
        }
    }

    /// Load configuration from file, apply environment overrides, validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}
