//! Configuration management for openchamber-sync
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
///
/// Every section and field has a default, so an empty file (or no file)
/// yields a working configuration for a local OpenCode server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// OpenCode server location
    #[serde(default)]
    pub server: ServerConfig,
    /// Event stream lifecycle tuning
    #[serde(default)]
    pub stream: StreamConfig,
    /// Merge algorithm tuning
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    /// Activity phase timing
    #[serde(default)]
    pub activity: ActivityConfig,
    /// Pull-based resync tuning
    #[serde(default)]
    pub resync: ResyncConfig,
    /// Durable cursor storage
    #[serde(default)]
    pub storage: StorageConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// OpenCode server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server origin
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Path prefix the API is mounted under (e.g. `/api` behind a proxy)
    #[serde(default)]
    pub api_prefix: String,

    /// Only follow sessions in this working directory
    #[serde(default)]
    pub directory: Option<String>,

    /// Timeout for snapshot requests in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:4096".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_prefix: String::new(),
            directory: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Event stream lifecycle configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Inactivity window before a liveness probe (milliseconds)
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,

    /// How often staleness is checked (milliseconds)
    #[serde(default = "default_stale_check_interval_ms")]
    pub stale_check_interval_ms: u64,

    /// Debounce before pausing a hidden consumer (milliseconds)
    #[serde(default = "default_hidden_pause_delay_ms")]
    pub hidden_pause_delay_ms: u64,

    /// Number of attempts using the fast backoff regime
    #[serde(default = "default_fast_retry_attempts")]
    pub fast_retry_attempts: u32,

    /// First fast retry delay (milliseconds)
    #[serde(default = "default_fast_base_ms")]
    pub fast_base_ms: u64,

    /// Fast retry ceiling (milliseconds)
    #[serde(default = "default_fast_cap_ms")]
    pub fast_cap_ms: u64,

    /// First slow retry delay (milliseconds)
    #[serde(default = "default_slow_base_ms")]
    pub slow_base_ms: u64,

    /// Slow retry ceiling (milliseconds)
    #[serde(default = "default_slow_cap_ms")]
    pub slow_cap_ms: u64,

    /// Exclusive upper bound of reconnect jitter (milliseconds)
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
}

fn default_stale_after_ms() -> u64 {
    25_000
}

fn default_stale_check_interval_ms() -> u64 {
    5_000
}

fn default_hidden_pause_delay_ms() -> u64 {
    5_000
}

fn default_fast_retry_attempts() -> u32 {
    3
}

fn default_fast_base_ms() -> u64 {
    1_000
}

fn default_fast_cap_ms() -> u64 {
    8_000
}

fn default_slow_base_ms() -> u64 {
    2_000
}

fn default_slow_cap_ms() -> u64 {
    32_000
}

fn default_max_jitter_ms() -> u64 {
    250
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: default_stale_after_ms(),
            stale_check_interval_ms: default_stale_check_interval_ms(),
            hidden_pause_delay_ms: default_hidden_pause_delay_ms(),
            fast_retry_attempts: default_fast_retry_attempts(),
            fast_base_ms: default_fast_base_ms(),
            fast_cap_ms: default_fast_cap_ms(),
            slow_base_ms: default_slow_base_ms(),
            slow_cap_ms: default_slow_cap_ms(),
            max_jitter_ms: default_max_jitter_ms(),
        }
    }
}

/// Reconciliation configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// How many characters an assistant update may shrink by before it is
    /// treated as regressive
    #[serde(default = "default_shrink_tolerance_chars")]
    pub shrink_tolerance_chars: usize,

    /// Messages kept in memory per session before the oldest are evicted
    #[serde(default = "default_max_retained_messages")]
    pub max_retained_messages: usize,

    /// Minimum spacing of metadata refreshes per session (milliseconds)
    #[serde(default = "default_metadata_refresh_interval_ms")]
    pub metadata_refresh_interval_ms: u64,
}

fn default_shrink_tolerance_chars() -> usize {
    50
}

fn default_max_retained_messages() -> usize {
    500
}

fn default_metadata_refresh_interval_ms() -> u64 {
    3_000
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            shrink_tolerance_chars: default_shrink_tolerance_chars(),
            max_retained_messages: default_max_retained_messages(),
            metadata_refresh_interval_ms: default_metadata_refresh_interval_ms(),
        }
    }
}

/// Activity tracker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityConfig {
    /// How long `cooldown` lasts before reverting to `idle` (milliseconds)
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Minimum spacing of status polls (milliseconds)
    #[serde(default = "default_status_poll_min_interval_ms")]
    pub status_poll_min_interval_ms: u64,

    /// Period of the background status poll loop (milliseconds)
    #[serde(default = "default_status_poll_interval_ms")]
    pub status_poll_interval_ms: u64,
}

fn default_cooldown_ms() -> u64 {
    2_000
}

fn default_status_poll_min_interval_ms() -> u64 {
    1_500
}

fn default_status_poll_interval_ms() -> u64 {
    10_000
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: default_cooldown_ms(),
            status_poll_min_interval_ms: default_status_poll_min_interval_ms(),
            status_poll_interval_ms: default_status_poll_interval_ms(),
        }
    }
}

/// Resync coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncConfig {
    /// Minimum spacing of resyncs per session (milliseconds)
    #[serde(default = "default_resync_min_interval_ms")]
    pub min_interval_ms: u64,

    /// Window fetched while a session is actively streaming
    #[serde(default = "default_viewport_window")]
    pub viewport_window: usize,

    /// Window fetched for idle sessions
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// Extra messages fetched beyond the window
    #[serde(default = "default_fetch_buffer")]
    pub fetch_buffer: usize,

    /// Creation-time tolerance for matching a local user message to its
    /// server copy (milliseconds)
    #[serde(default = "default_fuzzy_match_tolerance_ms")]
    pub fuzzy_match_tolerance_ms: i64,
}

fn default_resync_min_interval_ms() -> u64 {
    750
}

fn default_viewport_window() -> usize {
    20
}

fn default_history_window() -> usize {
    100
}

fn default_fetch_buffer() -> usize {
    10
}

fn default_fuzzy_match_tolerance_ms() -> i64 {
    1_500
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_resync_min_interval_ms(),
            viewport_window: default_viewport_window(),
            history_window: default_history_window(),
            fetch_buffer: default_fetch_buffer(),
            fuzzy_match_tolerance_ms: default_fuzzy_match_tolerance_ms(),
        }
    }
}

/// Cursor storage configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Cursor database path; defaults to the platform data directory
    #[serde(default)]
    pub cursor_db: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json_format: bool,

    /// Also append logs to this file
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from file, environment, and CLI
    ///
    /// A missing file is not an error: defaults are used and a warning is
    /// logged. Environment variables override the file, CLI flags override
    /// both.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the YAML configuration file
    /// * `cli` - Parsed command-line arguments
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] if the file exists but cannot be read
    /// or parsed.
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("Failed to read config file: {}", e)))?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&contents)
            .map_err(|e| SyncError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(base_url) = std::env::var("OPENCHAMBER_SERVER_URL") {
            self.server.base_url = base_url;
        }

        if let Ok(prefix) = std::env::var("OPENCHAMBER_API_PREFIX") {
            self.server.api_prefix = prefix;
        }

        if let Ok(directory) = std::env::var("OPENCHAMBER_DIRECTORY") {
            self.server.directory = Some(directory).filter(|d| !d.is_empty());
        }

        if let Ok(timeout) = std::env::var("OPENCHAMBER_REQUEST_TIMEOUT_SECS") {
            if let Ok(value) = timeout.parse() {
                self.server.request_timeout_secs = value;
            } else {
                tracing::warn!("Invalid OPENCHAMBER_REQUEST_TIMEOUT_SECS: {}", timeout);
            }
        }

        if let Ok(stale) = std::env::var("OPENCHAMBER_STALE_AFTER_MS") {
            if let Ok(value) = stale.parse() {
                self.stream.stale_after_ms = value;
            } else {
                tracing::warn!("Invalid OPENCHAMBER_STALE_AFTER_MS: {}", stale);
            }
        }

        if let Ok(retained) = std::env::var("OPENCHAMBER_MAX_RETAINED_MESSAGES") {
            if let Ok(value) = retained.parse() {
                self.reconcile.max_retained_messages = value;
            } else {
                tracing::warn!("Invalid OPENCHAMBER_MAX_RETAINED_MESSAGES: {}", retained);
            }
        }

        if let Ok(path) = std::env::var("OPENCHAMBER_CURSOR_DB") {
            self.storage.cursor_db = Some(PathBuf::from(path));
        }

        if let Ok(level) = std::env::var("OPENCHAMBER_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(json) = std::env::var("OPENCHAMBER_LOG_JSON") {
            self.logging.json_format = matches!(json.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        if let Ok(file) = std::env::var("OPENCHAMBER_LOG_FILE") {
            self.logging.file_path = Some(PathBuf::from(file));
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if let Some(server) = &cli.server {
            self.server.base_url = server.clone();
        }
        if let Some(directory) = &cli.directory {
            self.server.directory = Some(directory.clone());
        }
        if cli.verbose {
            self.logging.level = "debug".to_string();
        }
        if cli.json_logs {
            self.logging.json_format = true;
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.server.base_url.trim().is_empty() {
            return Err(SyncError::Config("server.base_url cannot be empty".to_string()).into());
        }

        match url::Url::parse(&self.server.base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => {
                return Err(SyncError::Config(format!(
                    "server.base_url must use http or https, got {}",
                    url.scheme()
                ))
                .into());
            }
            Err(e) => {
                return Err(
                    SyncError::Config(format!("Invalid server.base_url: {}", e)).into(),
                );
            }
        }

        if self.server.request_timeout_secs == 0 {
            return Err(SyncError::Config(
                "server.request_timeout_secs must be greater than 0".to_string(),
            )
            .into());
        }

        let nonzero = [
            ("stream.stale_after_ms", self.stream.stale_after_ms),
            ("stream.stale_check_interval_ms", self.stream.stale_check_interval_ms),
            ("stream.fast_base_ms", self.stream.fast_base_ms),
            ("stream.slow_base_ms", self.stream.slow_base_ms),
            ("activity.cooldown_ms", self.activity.cooldown_ms),
            ("activity.status_poll_interval_ms", self.activity.status_poll_interval_ms),
            ("resync.viewport_window", self.resync.viewport_window as u64),
            ("resync.history_window", self.resync.history_window as u64),
            ("reconcile.max_retained_messages", self.reconcile.max_retained_messages as u64),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(SyncError::Config(format!("{} must be greater than 0", name)).into());
            }
        }

        if self.stream.fast_base_ms > self.stream.fast_cap_ms {
            return Err(SyncError::Config(
                "stream.fast_base_ms must not exceed stream.fast_cap_ms".to_string(),
            )
            .into());
        }

        if self.stream.slow_base_ms > self.stream.slow_cap_ms {
            return Err(SyncError::Config(
                "stream.slow_base_ms must not exceed stream.slow_cap_ms".to_string(),
            )
            .into());
        }

        if self.resync.viewport_window > self.resync.history_window {
            return Err(SyncError::Config(
                "resync.viewport_window must not exceed resync.history_window".to_string(),
            )
            .into());
        }

        if self.resync.fuzzy_match_tolerance_ms < 0 {
            return Err(SyncError::Config(
                "resync.fuzzy_match_tolerance_ms cannot be negative".to_string(),
            )
            .into());
        }

        Ok(())
    }
}
