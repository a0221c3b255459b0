//! Structured logging setup
//!
//! Provides JSON-formatted and human-readable logging with optional file
//! output. `RUST_LOG` takes precedence over the configured level.

use crate::config::LoggingConfig;
use anyhow::Result;
use directories::ProjectDirs;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// File name used for the default log file
pub const DEFAULT_LOG_FILE_NAME: &str = "openchamber-sync.log";

/// Default log file location inside the platform data directory
pub fn default_log_file() -> Option<PathBuf> {
    ProjectDirs::from("ai", "openchamber", "openchamber-sync")
        .map(|dirs| dirs.data_dir().join(DEFAULT_LOG_FILE_NAME))
}

/// Build the level filter: `RUST_LOG` if set, otherwise the configured level.
///
/// A bare level such as `debug` is scoped to this crate so dependencies
/// stay at `warn`.
pub fn build_env_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = if level.contains('=') || level.contains(',') {
        level.to_string()
    } else {
        format!("warn,openchamber_sync={}", level)
    };
    Ok(EnvFilter::try_new(directive)?)
}

/// Initialize logging based on configuration.
///
/// # Arguments
///
/// * `config` - Logging configuration
///
/// # Returns
///
/// Returns success or error if logging initialization fails
///
/// # Examples
///
/// ```no_run
/// use openchamber_sync::config::LoggingConfig;
/// use openchamber_sync::logging::init_logging;
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     json_format: true,
///     file_path: None,
/// };
///
/// init_logging(&config).unwrap();
/// ```
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = build_env_filter(&config.level)?;
    let registry = tracing_subscriber::registry().with(env_filter);

    let file = match &config.file_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Some(Arc::new(
                OpenOptions::new().create(true).append(true).open(path)?,
            ))
        }
        None => None,
    };

    if config.json_format {
        let stdout_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(std::io::stderr);

        if let Some(file) = file {
            let file_layer = fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(file);
            registry.with(stdout_layer).with(file_layer).try_init()?;
        } else {
            registry.with(stdout_layer).try_init()?;
        }
    } else {
        let stdout_layer = fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_writer(std::io::stderr);

        if let Some(file) = file {
            let file_layer = fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .with_writer(file);
            registry.with(stdout_layer).with(file_layer).try_init()?;
        } else {
            registry.with(stdout_layer).try_init()?;
        }
    }

    Ok(())
}
