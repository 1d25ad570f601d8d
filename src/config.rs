//! Configuration types for chapter-dl

use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Download behavior configuration (directories, concurrency, HTTP)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Library root; chapters land in `{download_dir}/{owner}/{unit}` (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Maximum concurrent chapter downloads (default: 3)
    ///
    /// This is the initial value of the runtime concurrency ceiling; see
    /// [`RuntimeSettings`](crate::settings::RuntimeSettings) for live updates.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_downloads: usize,

    /// Pieces fetched in parallel within one chapter (default: 4)
    #[serde(default = "default_piece_concurrency")]
    pub piece_concurrency: usize,

    /// Per-request HTTP timeout (default: 30 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_concurrent_downloads: default_max_concurrent(),
            piece_concurrency: default_piece_concurrency(),
            request_timeout: default_request_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

/// Scheduler behavior configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Automatic re-enqueues allowed for transient failures (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before re-dispatching after a completion or failure (default: 100ms)
    #[serde(default = "default_settle_delay", with = "duration_millis_serde")]
    pub dispatch_settle_delay: Duration,

    /// Base priority shared by every item of a batch download (default: 1)
    #[serde(default = "default_batch_priority")]
    pub batch_priority: i32,

    /// Priority of synthetic repair requests (default: 5)
    #[serde(default = "default_repair_priority")]
    pub repair_priority: i32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            dispatch_settle_delay: default_settle_delay(),
            batch_priority: default_batch_priority(),
            repair_priority: default_repair_priority(),
        }
    }
}

/// Retry configuration for transient per-request failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_millis_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_millis_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Integrity validation and repair configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntegrityConfig {
    /// Score below which a unit is no longer considered valid (default: 70)
    #[serde(default = "default_repair_threshold")]
    pub repair_threshold: u8,

    /// Score penalty per missing piece (default: 20)
    #[serde(default = "default_missing_penalty")]
    pub missing_piece_penalty: u8,

    /// Score penalty per corrupt-but-present piece (default: 10)
    #[serde(default = "default_corrupt_penalty")]
    pub corrupt_piece_penalty: u8,

    /// Score penalty per warning (default: 2)
    #[serde(default = "default_warning_penalty")]
    pub warning_penalty: u8,

    /// Files smaller than this are treated as truncated (default: 100 bytes)
    #[serde(default = "default_min_piece_bytes")]
    pub min_piece_bytes: u64,

    /// Units validated concurrently during a full scan (default: 5)
    #[serde(default = "default_validation_batch_size")]
    pub batch_size: usize,

    /// Pause between validation batches (default: 500ms)
    #[serde(default = "default_inter_batch_delay", with = "duration_millis_serde")]
    pub inter_batch_delay: Duration,

    /// Interval of the background validation task (default: 24 hours)
    #[serde(default = "default_background_interval", with = "duration_serde")]
    pub background_interval: Duration,

    /// Background runs finding more corrupted units than this notify instead of repairing (default: 5)
    #[serde(default = "default_notify_threshold")]
    pub notify_threshold: usize,

    /// Run a quick validation after each completed chapter (default: false)
    #[serde(default)]
    pub verify_on_complete: bool,

    /// Maximum time to wait for repair downloads to settle (default: 10 minutes)
    #[serde(default = "default_repair_timeout", with = "duration_serde")]
    pub repair_timeout: Duration,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            repair_threshold: default_repair_threshold(),
            missing_piece_penalty: default_missing_penalty(),
            corrupt_piece_penalty: default_corrupt_penalty(),
            warning_penalty: default_warning_penalty(),
            min_piece_bytes: default_min_piece_bytes(),
            batch_size: default_validation_batch_size(),
            inter_batch_delay: default_inter_batch_delay(),
            background_interval: default_background_interval(),
            notify_threshold: default_notify_threshold(),
            verify_on_complete: false,
            repair_timeout: default_repair_timeout(),
        }
    }
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Database path (default: "./chapter-dl.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Main configuration for [`ChapterDownloader`](crate::ChapterDownloader)
///
/// Every field has a default, so an empty JSON object is a valid configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Download behavior settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// Scheduler settings
    #[serde(default)]
    pub queue: QueueConfig,

    /// Per-request retry settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// Integrity validation and repair settings
    #[serde(default)]
    pub integrity: IntegrityConfig,

    /// Data storage settings
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Config {
    /// Library root directory
    pub fn download_dir(&self) -> &PathBuf {
        &self.download.download_dir
    }

    /// Check values that would otherwise surface as confusing runtime behavior
    pub fn validate(&self) -> crate::Result<()> {
        if self.download.max_concurrent_downloads == 0 {
            return Err(crate::Error::Config {
                message: "max_concurrent_downloads must be at least 1".into(),
                key: Some("max_concurrent_downloads".into()),
            });
        }
        if self.download.piece_concurrency == 0 {
            return Err(crate::Error::Config {
                message: "piece_concurrency must be at least 1".into(),
                key: Some("piece_concurrency".into()),
            });
        }
        if self.integrity.batch_size == 0 {
            return Err(crate::Error::Config {
                message: "integrity batch_size must be at least 1".into(),
                key: Some("batch_size".into()),
            });
        }
        if self.integrity.repair_threshold > 100 {
            return Err(crate::Error::Config {
                message: "repair_threshold must be within 0..=100".into(),
                key: Some("repair_threshold".into()),
            });
        }
        Ok(())
    }
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

/// Concurrency ceiling used whenever no valid setting is available
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT_DOWNLOADS
}

fn default_piece_concurrency() -> usize {
    4
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_user_agent() -> String {
    concat!("chapter-dl/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_max_retries() -> u32 {
    crate::retry::DEFAULT_MAX_RETRIES
}

fn default_settle_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_batch_priority() -> i32 {
    1
}

fn default_repair_priority() -> i32 {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_repair_threshold() -> u8 {
    70
}

fn default_missing_penalty() -> u8 {
    20
}

fn default_corrupt_penalty() -> u8 {
    10
}

fn default_warning_penalty() -> u8 {
    2
}

fn default_min_piece_bytes() -> u64 {
    100
}

fn default_validation_batch_size() -> usize {
    5
}

fn default_inter_batch_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_background_interval() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_notify_threshold() -> usize {
    5
}

fn default_repair_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_database_path() -> PathBuf {
    PathBuf::from("chapter-dl.db")
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds, for sub-second delays)
mod duration_millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let config: Config = serde_json::from_str("{}").expect("deserialize failed");

        assert_eq!(config.download.max_concurrent_downloads, 3);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.integrity.repair_threshold, 70);
        assert_eq!(config.integrity.batch_size, 5);
        assert_eq!(config.integrity.notify_threshold, 5);
        assert_eq!(
            config.integrity.background_interval,
            Duration::from_secs(86_400)
        );
        assert!(!config.integrity.verify_on_complete);
    }

    #[test]
    fn durations_round_trip_with_their_units() {
        let mut config = Config::default();
        config.queue.dispatch_settle_delay = Duration::from_millis(25);
        config.integrity.repair_timeout = Duration::from_secs(90);

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["queue"]["dispatch_settle_delay"], 25);
        assert_eq!(json["integrity"]["repair_timeout"], 90);

        let back: Config = serde_json::from_value(json).unwrap();
        assert_eq!(back.queue.dispatch_settle_delay, Duration::from_millis(25));
        assert_eq!(back.integrity.repair_timeout, Duration::from_secs(90));
    }

    #[test]
    fn partial_sub_config_fills_remaining_fields() {
        let config: Config =
            serde_json::from_str(r#"{"download": {"max_concurrent_downloads": 7}}"#).unwrap();
        assert_eq!(config.download.max_concurrent_downloads, 7);
        assert_eq!(config.download.piece_concurrency, 4);
        assert_eq!(config.download.download_dir, PathBuf::from("downloads"));
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.download.max_concurrent_downloads = 0;

        match config.validate() {
            Err(crate::Error::Config { key, .. }) => {
                assert_eq!(key.as_deref(), Some("max_concurrent_downloads"));
            }
            other => panic!("expected Config error, got: {:?}", other),
        }
    }

    #[test]
    fn validate_accepts_defaults() {
        assert!(Config::default().validate().is_ok());
    }
}
