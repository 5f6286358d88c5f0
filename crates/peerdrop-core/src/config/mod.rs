//! Configuration management for PeerDrop.
//!
//! This module handles loading, saving, and validating the tuning knobs of
//! the transfer protocol.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/peerdrop/config.toml` |
//! | macOS | `~/Library/Application Support/dev.peerdrop.PeerDrop/config.toml` |
//! | Windows | `%APPDATA%\PeerDrop\PeerDrop\config\config.toml` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use peerdrop_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("Max chunk size: {}", config.chunk.max_chunk_size);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::CompressionMode;
use crate::error::{Error, Result};

/// Main configuration struct for PeerDrop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Adaptive chunk sizing
    pub chunk: ChunkConfig,
    /// Network measurement
    pub monitor: MonitorConfig,
    /// Stall detection
    pub timeout: TimeoutConfig,
    /// Acknowledgment pacing
    pub ack: AckConfig,
    /// Sender-side chunk retry
    pub retry: RetryConfig,
    /// Transfer encoding
    pub transfer: TransferConfig,
}

/// Adaptive chunk-size controller settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Smallest chunk the controller may recommend
    pub min_chunk_size: usize,
    /// Largest chunk the controller may recommend
    pub max_chunk_size: usize,
    /// Chunk size before any adaptation
    pub initial_chunk_size: usize,
    /// Fraction of the gap to the target size covered per update
    pub adaptation_rate: f64,
    /// RTT the controller steers towards
    #[serde(with = "humantime_serde")]
    pub target_rtt: Duration,
    /// Utilization below which chunks grow
    pub target_bandwidth_utilization: f64,
    /// Utilization above which chunks shrink
    pub saturation_utilization: f64,
    /// Share of `buffer_reference` that counts as a backed-up send buffer
    pub target_buffer_utilization: f64,
    /// Reference send-buffer size in bytes
    pub buffer_reference: usize,
    /// Jitter above which the link counts as unstable
    #[serde(with = "humantime_serde")]
    pub stability_threshold: Duration,
    /// Minimum relative change for a new size to be committed
    pub significance_threshold: f64,
    /// Minimum confidence for a new size to be committed
    pub confidence_threshold: f64,
    /// Chunks sent between controller updates
    pub adapt_every_chunks: u32,
    /// Sender pauses while the channel buffers more than this many bytes
    pub buffer_high_water: usize,
    /// Samples used for trend classification
    pub trend_window: usize,
    /// How long performance samples are kept
    #[serde(with = "humantime_serde")]
    pub history_window: Duration,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: crate::MIN_CHUNK_SIZE,
            max_chunk_size: crate::MAX_CHUNK_SIZE,
            initial_chunk_size: crate::DEFAULT_CHUNK_SIZE,
            adaptation_rate: 0.2,
            target_rtt: Duration::from_millis(100),
            target_bandwidth_utilization: 0.85,
            saturation_utilization: 0.95,
            target_buffer_utilization: 0.7,
            buffer_reference: 1024 * 1024,
            stability_threshold: Duration::from_millis(10),
            significance_threshold: 0.05,
            confidence_threshold: 0.6,
            adapt_every_chunks: 8,
            buffer_high_water: 1024 * 1024,
            trend_window: 10,
            history_window: Duration::from_secs(120),
        }
    }
}

/// One rung of the network quality ladder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityTier {
    /// Highest RTT allowed for this tier
    #[serde(with = "humantime_serde")]
    pub max_rtt: Duration,
    /// Lowest bandwidth allowed for this tier, in megabits per second
    pub min_bandwidth_mbps: f64,
}

/// Network performance monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// RTT samples kept in the ring
    pub rtt_samples: usize,
    /// Trailing window for bandwidth estimation
    #[serde(with = "humantime_serde")]
    pub bandwidth_window: Duration,
    /// Trailing window for buffer-level samples
    #[serde(with = "humantime_serde")]
    pub buffer_window: Duration,
    /// How long a ping waits for its pong
    #[serde(with = "humantime_serde")]
    pub ping_timeout: Duration,
    /// Chunks between RTT probes while sending; 0 disables them
    pub probe_every_chunks: u32,
    /// Excellent tier thresholds
    pub excellent: QualityTier,
    /// Good tier thresholds
    pub good: QualityTier,
    /// Fair tier thresholds
    pub fair: QualityTier,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            rtt_samples: 20,
            bandwidth_window: Duration::from_secs(10),
            buffer_window: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(5),
            probe_every_chunks: 16,
            excellent: QualityTier {
                max_rtt: Duration::from_millis(50),
                min_bandwidth_mbps: 10.0,
            },
            good: QualityTier {
                max_rtt: Duration::from_millis(100),
                min_bandwidth_mbps: 5.0,
            },
            fair: QualityTier {
                max_rtt: Duration::from_millis(200),
                min_bandwidth_mbps: 1.0,
            },
        }
    }
}

/// Stall timeout settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Files up to this size use the small-file timeout
    pub small_file_threshold: u64,
    /// Silence window for small files
    #[serde(with = "humantime_serde")]
    pub small_file_timeout: Duration,
    /// Silence window for larger files
    #[serde(with = "humantime_serde")]
    pub large_file_timeout: Duration,
    /// Bytes per second at which the window tightens
    pub fast_rate: u64,
    /// Bytes per second below which the window widens
    pub slow_rate: u64,
    /// Multiplier applied to fast transfers
    pub fast_multiplier: f64,
    /// Multiplier applied to slow transfers
    pub slow_multiplier: f64,
    /// Lower bound of the window
    #[serde(with = "humantime_serde")]
    pub min_timeout: Duration,
    /// Upper bound of the window
    #[serde(with = "humantime_serde")]
    pub max_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            small_file_threshold: 10 * 1024 * 1024,
            small_file_timeout: Duration::from_secs(30),
            large_file_timeout: Duration::from_secs(90),
            fast_rate: 1024 * 1024,
            slow_rate: 64 * 1024,
            fast_multiplier: 0.5,
            slow_multiplier: 2.0,
            min_timeout: Duration::from_secs(10),
            max_timeout: Duration::from_secs(300),
        }
    }
}

/// Acknowledgment settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AckConfig {
    /// Files below this size ack every percentage point
    pub small_file_threshold: u64,
    /// Files up to this size ack on even percentage points
    pub medium_file_threshold: u64,
    /// Time-based ack interval for large files
    #[serde(with = "humantime_serde")]
    pub large_file_interval: Duration,
    /// Percentage step that always triggers an ack for large files
    pub large_file_step: u8,
    /// Minimum time between two acks of one transfer (except at 100%)
    #[serde(with = "humantime_serde")]
    pub min_spacing: Duration,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            small_file_threshold: 10 * 1024 * 1024,
            medium_file_threshold: 100 * 1024 * 1024,
            large_file_interval: Duration::from_millis(500),
            large_file_step: 5,
            min_spacing: Duration::from_millis(200),
        }
    }
}

/// Sender-side retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per chunk, including the first
    pub max_attempts: u32,
    /// Fixed delay between attempts
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    /// Fail the whole transfer when a chunk runs out of attempts
    pub fail_transfer_on_exhaustion: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
            fail_transfer_on_exhaustion: false,
        }
    }
}

/// Transfer encoding settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// When outgoing chunks are compressed
    pub compression: CompressionMode,
    /// Zstd level (1-22, lower = faster)
    pub compression_level: u8,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            compression: CompressionMode::Auto,
            compression_level: 1,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read,
    /// parsed, or validated.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, parsed, or
    /// validated.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to a specific file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "peerdrop", "PeerDrop")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        let chunk = &self.chunk;
        if chunk.min_chunk_size == 0 {
            return Err(invalid("chunk.min_chunk_size", "must be greater than zero"));
        }
        if chunk.min_chunk_size > chunk.max_chunk_size {
            return Err(invalid(
                "chunk.min_chunk_size",
                "must not exceed chunk.max_chunk_size",
            ));
        }
        if !(chunk.min_chunk_size..=chunk.max_chunk_size).contains(&chunk.initial_chunk_size) {
            return Err(invalid(
                "chunk.initial_chunk_size",
                "must lie between the minimum and maximum chunk size",
            ));
        }
        if !(chunk.adaptation_rate > 0.0 && chunk.adaptation_rate <= 1.0) {
            return Err(invalid("chunk.adaptation_rate", "must be in (0, 1]"));
        }
        for (key, value) in [
            (
                "chunk.target_bandwidth_utilization",
                chunk.target_bandwidth_utilization,
            ),
            ("chunk.saturation_utilization", chunk.saturation_utilization),
            (
                "chunk.target_buffer_utilization",
                chunk.target_buffer_utilization,
            ),
            ("chunk.confidence_threshold", chunk.confidence_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(key, "must be between 0 and 1"));
            }
        }
        if chunk.adapt_every_chunks == 0 {
            return Err(invalid("chunk.adapt_every_chunks", "must be at least 1"));
        }
        if chunk.trend_window == 0 {
            return Err(invalid("chunk.trend_window", "must be at least 1"));
        }

        if self.monitor.rtt_samples == 0 {
            return Err(invalid("monitor.rtt_samples", "must be at least 1"));
        }
        if self.monitor.bandwidth_window.is_zero() {
            return Err(invalid("monitor.bandwidth_window", "must be non-zero"));
        }

        if self.timeout.min_timeout > self.timeout.max_timeout {
            return Err(invalid(
                "timeout.min_timeout",
                "must not exceed timeout.max_timeout",
            ));
        }
        if self.timeout.slow_rate > self.timeout.fast_rate {
            return Err(invalid(
                "timeout.slow_rate",
                "must not exceed timeout.fast_rate",
            ));
        }

        if self.ack.small_file_threshold > self.ack.medium_file_threshold {
            return Err(invalid(
                "ack.small_file_threshold",
                "must not exceed ack.medium_file_threshold",
            ));
        }
        if self.ack.large_file_step == 0 {
            return Err(invalid("ack.large_file_step", "must be at least 1"));
        }

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }

        if !(1..=22).contains(&self.transfer.compression_level) {
            return Err(invalid("transfer.compression_level", "must be between 1 and 22"));
        }

        Ok(())
    }

    /// Read a value by dotted key, e.g. `chunk.max_chunk_size`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be serialized.
    pub fn get_value(&self, key: &str) -> Result<Option<String>> {
        let root = toml::Value::try_from(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        Ok(lookup(&root, key).and_then(|value| match value {
            toml::Value::Table(_) => None,
            toml::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }))
    }

    /// Set a value by dotted key.
    ///
    /// The raw string is parsed according to the type of the current value,
    /// and the whole configuration is validated before it is applied.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for unknown keys, unparsable values,
    /// or values that fail validation.
    pub fn set_value(&mut self, key: &str, raw: &str) -> Result<()> {
        let mut root = toml::Value::try_from(&*self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        let slot = lookup_mut(&mut root, key).ok_or_else(|| invalid(key, "unknown key"))?;
        *slot = match slot {
            toml::Value::Table(_) => return Err(invalid(key, "is a section, not a value")),
            toml::Value::Integer(_) => toml::Value::Integer(
                raw.parse()
                    .map_err(|e| invalid(key, &format!("expected an integer: {e}")))?,
            ),
            toml::Value::Float(_) => toml::Value::Float(
                raw.parse()
                    .map_err(|e| invalid(key, &format!("expected a number: {e}")))?,
            ),
            toml::Value::Boolean(_) => toml::Value::Boolean(
                raw.parse()
                    .map_err(|e| invalid(key, &format!("expected true or false: {e}")))?,
            ),
            _ => toml::Value::String(raw.to_string()),
        };

        let updated: Self = root
            .try_into()
            .map_err(|e| invalid(key, &format!("{e}")))?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// All settable dotted keys, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be serialized.
    pub fn keys(&self) -> Result<Vec<String>> {
        let root = toml::Value::try_from(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;
        let mut keys = Vec::new();
        collect_keys(&root, "", &mut keys);
        Ok(keys)
    }
}

fn collect_keys(value: &toml::Value, prefix: &str, keys: &mut Vec<String>) {
    let toml::Value::Table(table) = value else {
        keys.push(prefix.to_string());
        return;
    };
    for (name, child) in table {
        let key = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        collect_keys(child, &key, keys);
    }
}

fn invalid(key: &str, reason: &str) -> Error {
    Error::InvalidConfig {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn lookup<'a>(root: &'a toml::Value, key: &str) -> Option<&'a toml::Value> {
    key.split('.').try_fold(root, |value, part| value.get(part))
}

fn lookup_mut<'a>(root: &'a mut toml::Value, key: &str) -> Option<&'a mut toml::Value> {
    key.split('.').try_fold(root, |value, part| value.get_mut(part))
}

pub use humantime_serde::{format_duration, parse_duration};

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn format_duration(duration: Duration) -> String {
        let secs = duration.as_secs();
        if duration.subsec_millis() != 0 || secs == 0 {
            format!("{}ms", duration.as_millis())
        } else if secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{secs}s")
        }
    }

    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let parse = |digits: &str| {
            digits
                .trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        };

        if let Some(ms) = s.strip_suffix("ms") {
            parse(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            parse(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            parse(mins).map(|m| Duration::from_secs(m * 60))
        } else {
            Err(format!("invalid duration format '{s}'"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.chunk.min_chunk_size, 8 * 1024);
        assert_eq!(config.chunk.max_chunk_size, 1024 * 1024);
        assert_eq!(config.timeout.small_file_timeout, Duration::from_secs(30));
        assert_eq!(config.ack.min_spacing, Duration::from_millis(200));
        assert_eq!(config.retry.max_attempts, 3);
        assert!(!config.retry.fail_transfer_on_exhaustion);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.chunk.max_chunk_size = 512 * 1024;
        original.ack.min_spacing = Duration::from_millis(350);
        original.transfer.compression = CompressionMode::Never;

        original.save_to(&config_path).expect("save");
        let loaded = Config::load_from(&config_path).expect("load");

        assert_eq!(loaded, original);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let loaded = Config::load_from(&temp_dir.path().join("absent.toml")).expect("load");
        assert_eq!(loaded, Config::default());
    }

    #[test]
    fn test_config_deserialization_partial() {
        let partial_toml = r#"
[chunk]
initial_chunk_size = 32768

[timeout]
large_file_timeout = "2m"
"#;

        let config: Config = toml::from_str(partial_toml).expect("parse partial config");

        assert_eq!(config.chunk.initial_chunk_size, 32768);
        assert_eq!(config.timeout.large_file_timeout, Duration::from_secs(120));
        assert_eq!(config.chunk.max_chunk_size, crate::MAX_CHUNK_SIZE);
        assert_eq!(config.monitor.ping_timeout, Duration::from_secs(5));
        assert_eq!(config.monitor.probe_every_chunks, 16);
    }

    #[test]
    fn test_config_serialization_sections() {
        let toml_str = toml::to_string_pretty(&Config::default()).expect("serialize");

        assert!(toml_str.contains("[chunk]"));
        assert!(toml_str.contains("[monitor.excellent]"));
        assert!(toml_str.contains("min_spacing = \"200ms\""));
        assert!(toml_str.contains("max_timeout = \"5m\""));
        assert!(toml_str.contains("compression = \"auto\""));
    }

    #[test]
    fn test_invalid_file_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[chunk]\nmin_chunk_size = 4096\nmax_chunk_size = 2048\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn test_duration_formats() {
        use humantime_serde::{format_duration, parse_duration};

        assert_eq!(parse_duration("200ms").unwrap(), Duration::from_millis(200));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert!(parse_duration("soon").is_err());

        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::from_secs(90)), "90s");
        assert_eq!(format_duration(Duration::from_secs(120)), "2m");
    }

    #[test]
    fn test_get_and_set_value() {
        let mut config = Config::default();

        assert_eq!(
            config.get_value("chunk.max_chunk_size").unwrap().as_deref(),
            Some("1048576")
        );
        assert_eq!(config.get_value("chunk").unwrap(), None);
        assert_eq!(config.get_value("nope.key").unwrap(), None);

        config.set_value("chunk.adaptation_rate", "0.3").unwrap();
        config.set_value("retry.fail_transfer_on_exhaustion", "true").unwrap();
        config.set_value("ack.min_spacing", "250ms").unwrap();

        assert!((config.chunk.adaptation_rate - 0.3).abs() < f64::EPSILON);
        assert!(config.retry.fail_transfer_on_exhaustion);
        assert_eq!(config.ack.min_spacing, Duration::from_millis(250));
    }

    #[test]
    fn test_keys_are_dotted_leaves() {
        let config = Config::default();
        let keys = config.keys().unwrap();

        assert!(keys.contains(&"chunk.max_chunk_size".to_string()));
        assert!(keys.contains(&"monitor.excellent.max_rtt".to_string()));
        assert!(keys.contains(&"retry.fail_transfer_on_exhaustion".to_string()));
        assert!(!keys.contains(&"chunk".to_string()));
        for key in &keys {
            assert!(config.get_value(key).unwrap().is_some(), "{key} unreadable");
        }
    }

    #[test]
    fn test_set_value_rejects_bad_input() {
        let mut config = Config::default();

        assert!(config.set_value("chunk.unknown", "1").is_err());
        assert!(config.set_value("chunk.max_chunk_size", "big").is_err());
        assert!(config.set_value("chunk.max_chunk_size", "1024").is_err());
        assert!(config.set_value("ack.min_spacing", "forever").is_err());

        assert_eq!(config, Config::default());
    }
}
