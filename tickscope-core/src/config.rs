//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/tickscope/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/tickscope/` (~/.config/tickscope/)
//! - Data: `$XDG_DATA_HOME/tickscope/` (~/.local/share/tickscope/)
//! - State/Logs: `$XDG_STATE_HOME/tickscope/` (~/.local/state/tickscope/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// HTTP / websocket listener
    #[serde(default)]
    pub server: ServerConfig,

    /// Where persisted state lives
    #[serde(default)]
    pub storage: StorageConfig,

    /// Live capture polling
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Frame cache budget
    #[serde(default)]
    pub cache: CacheConfig,

    /// Control channel buffering
    #[serde(default)]
    pub control: ControlConfig,

    /// Derivation jobs
    #[serde(default)]
    pub derive: DeriveConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Socket address to bind
    #[serde(default = "default_addr")]
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
        }
    }
}

fn default_addr() -> String {
    "127.0.0.1:8787".to_string()
}

/// Storage configuration
#[derive(Debug, Deserialize, Default, Clone)]
pub struct StorageConfig {
    /// Override for the data directory (database, uploads, plugins, derived outputs)
    pub data_dir: Option<PathBuf>,
}

/// Live stream polling configuration
#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Default delay between polls of an idle source
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Delay after a poll that made progress
    #[serde(default = "default_fast_poll_ms")]
    pub fast_poll_ms: u64,

    /// Idle limit as a multiple of the poll interval
    #[serde(default = "default_idle_multiplier")]
    pub idle_multiplier: u32,

    /// Idle limit never drops below this
    #[serde(default = "default_min_idle_floor_ms")]
    pub min_idle_floor_ms: u64,

    /// Extra patience for recoverable file errors, as a multiple of the idle limit
    #[serde(default = "default_error_patience_multiplier")]
    pub error_patience_multiplier: u32,

    /// Cap on lines parsed per poll
    #[serde(default = "default_max_lines_per_poll")]
    pub max_lines_per_poll: usize,

    /// Size of each read from a source
    #[serde(default = "default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,

    /// HTTP request timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            fast_poll_ms: default_fast_poll_ms(),
            idle_multiplier: default_idle_multiplier(),
            min_idle_floor_ms: default_min_idle_floor_ms(),
            error_patience_multiplier: default_error_patience_multiplier(),
            max_lines_per_poll: default_max_lines_per_poll(),
            read_chunk_bytes: default_read_chunk_bytes(),
            http_timeout_secs: default_http_timeout(),
        }
    }
}

impl IngestConfig {
    /// Idle limit for a stream polled at `poll_interval`.
    pub fn idle_limit(&self, poll_interval: Duration) -> Duration {
        let scaled = poll_interval.saturating_mul(self.idle_multiplier);
        scaled.max(Duration::from_millis(self.min_idle_floor_ms))
    }
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_fast_poll_ms() -> u64 {
    50
}

fn default_idle_multiplier() -> u32 {
    20
}

fn default_min_idle_floor_ms() -> u64 {
    10_000
}

fn default_error_patience_multiplier() -> u32 {
    3
}

fn default_max_lines_per_poll() -> usize {
    5_000
}

fn default_read_chunk_bytes() -> usize {
    64 * 1024
}

fn default_http_timeout() -> u64 {
    30
}

/// Frame cache configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Global byte budget shared by all active captures
    #[serde(default = "default_budget_bytes")]
    pub budget_bytes: u64,

    /// Upper bound on the full-resolution tail per capture
    #[serde(default = "default_tail_frames")]
    pub tail_frames: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: default_budget_bytes(),
            tail_frames: default_tail_frames(),
        }
    }
}

fn default_budget_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_tail_frames() -> usize {
    2_048
}

/// Control channel buffering configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ControlConfig {
    /// Queueable commands kept while no display is connected
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Buffered frames per capture while no display is connected
    #[serde(default = "default_frames_per_capture")]
    pub frames_per_capture: usize,

    /// Buffered frames across all captures
    #[serde(default = "default_frames_total")]
    pub frames_total: usize,

    /// Frames per `capture_append` message on replay
    #[serde(default = "default_replay_batch")]
    pub replay_batch: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            frames_per_capture: default_frames_per_capture(),
            frames_total: default_frames_total(),
            replay_batch: default_replay_batch(),
        }
    }
}

fn default_queue_capacity() -> usize {
    256
}

fn default_frames_per_capture() -> usize {
    5_000
}

fn default_frames_total() -> usize {
    50_000
}

fn default_replay_batch() -> usize {
    256
}

/// Derivation job configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DeriveConfig {
    /// Lines read per input call
    #[serde(default = "default_batch_lines")]
    pub batch_lines: usize,

    /// Moving-average window when a request omits one
    #[serde(default = "default_window")]
    pub default_window: usize,

    /// Delay between re-reads of an input that is still growing
    #[serde(default = "default_input_poll_ms")]
    pub input_poll_ms: u64,
}

impl Default for DeriveConfig {
    fn default() -> Self {
        Self {
            batch_lines: default_batch_lines(),
            default_window: default_window(),
            input_poll_ms: default_input_poll_ms(),
        }
    }
}

fn default_batch_lines() -> usize {
    2_048
}

fn default_window() -> usize {
    10
}

fn default_input_poll_ms() -> u64 {
    200
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,

    /// Mirror log lines to stdout
    #[serde(default)]
    pub stdout: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
            stdout: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall polling or starve the cache.
    pub fn validate(&self) -> Result<()> {
        if self.ingest.poll_interval_ms == 0 {
            return Err(Error::Config(
                "ingest.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.ingest.max_lines_per_poll == 0 || self.ingest.read_chunk_bytes == 0 {
            return Err(Error::Config(
                "ingest.max_lines_per_poll and ingest.read_chunk_bytes must be greater than 0"
                    .to_string(),
            ));
        }
        if self.cache.budget_bytes == 0 || self.cache.tail_frames == 0 {
            return Err(Error::Config(
                "cache.budget_bytes and cache.tail_frames must be greater than 0".to_string(),
            ));
        }
        if self.control.queue_capacity == 0
            || self.control.frames_per_capture == 0
            || self.control.frames_total == 0
            || self.control.replay_batch == 0
        {
            return Err(Error::Config(
                "control buffer capacities must be greater than 0".to_string(),
            ));
        }
        if self.derive.batch_lines == 0 || self.derive.default_window == 0 {
            return Err(Error::Config(
                "derive.batch_lines and derive.default_window must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/tickscope/config.toml` (~/.config/tickscope/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("tickscope").join("config.toml")
    }

    /// Returns the default data directory path
    ///
    /// `$XDG_DATA_HOME/tickscope/` (~/.local/share/tickscope/)
    pub fn default_data_dir() -> PathBuf {
        xdg_data_home().join("tickscope")
    }

    /// Data directory for this configuration (override or XDG default)
    pub fn data_dir(&self) -> PathBuf {
        self.storage
            .data_dir
            .clone()
            .unwrap_or_else(Self::default_data_dir)
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/tickscope/` (~/.local/state/tickscope/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("tickscope")
    }

    /// Returns the database file path
    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("tickscope.db")
    }

    /// Directory holding uploaded capture files (content-addressed)
    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir().join("uploads")
    }

    /// Directory holding plugin manifests (content-addressed)
    pub fn plugins_dir(&self) -> PathBuf {
        self.data_dir().join("plugins")
    }

    /// Directory holding derived capture outputs
    pub fn derived_dir(&self) -> PathBuf {
        self.data_dir().join("derived")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/tickscope/tickscope.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("tickscope.log")
    }

    /// A configuration rooted at `dir`, for tests and embedded use.
    pub fn with_data_dir(dir: impl Into<PathBuf>) -> Self {
        Config {
            storage: StorageConfig {
                data_dir: Some(dir.into()),
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.addr, "127.0.0.1:8787");
        assert_eq!(config.ingest.poll_interval_ms, 500);
        assert_eq!(config.control.queue_capacity, 256);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
addr = "0.0.0.0:9000"

[ingest]
poll_interval_ms = 250
idle_multiplier = 4

[cache]
budget_bytes = 1048576

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.server.addr, "0.0.0.0:9000");
        assert_eq!(config.ingest.poll_interval_ms, 250);
        assert_eq!(config.ingest.idle_multiplier, 4);
        assert_eq!(config.ingest.fast_poll_ms, 50);
        assert_eq!(config.cache.budget_bytes, 1_048_576);
        assert_eq!(config.cache.tail_frames, 2_048);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_idle_limit_respects_floor() {
        let ingest = IngestConfig::default();
        // 500ms * 20 = 10s, equal to the floor
        assert_eq!(
            ingest.idle_limit(Duration::from_millis(500)),
            Duration::from_secs(10)
        );
        // small intervals fall back to the floor
        assert_eq!(
            ingest.idle_limit(Duration::from_millis(10)),
            Duration::from_secs(10)
        );
        assert_eq!(
            ingest.idle_limit(Duration::from_secs(2)),
            Duration::from_secs(40)
        );
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let mut config = Config::default();
        config.ingest.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cache.budget_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.control.frames_total = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_data_dir_override() {
        let config = Config::with_data_dir("/tmp/ts-test");
        assert_eq!(config.data_dir(), PathBuf::from("/tmp/ts-test"));
        assert_eq!(
            config.database_path(),
            PathBuf::from("/tmp/ts-test/tickscope.db")
        );
        assert_eq!(
            config.plugins_dir(),
            PathBuf::from("/tmp/ts-test/plugins")
        );
    }
}
