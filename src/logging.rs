//! Tracing initialization.
//!
//! Library code only emits `tracing` events and spans; binaries call [`init`] once
//! at startup. `RUST_LOG` takes precedence over the configured level.
//!
//! ```no_run
//! use scope_automation::logging::{self, LogConfig};
//!
//! logging::init(&LogConfig::default()).ok();
//! tracing::info!(component = "engine", "Application started");
//! ```

use crate::error::{AppResult, AutomationError};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Output format for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Pretty-printed format with colors (for development)
    Pretty,
    /// Compact single-line format
    #[default]
    Compact,
    /// JSON format for log aggregation
    Json,
}

/// Tracing configuration options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive (trace, debug, info, warn, error or a full directive)
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Whether to enable ANSI colors
    pub with_ansi: bool,
    /// Whether to include the event target
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            with_ansi: true,
            with_target: false,
        }
    }
}

impl LogConfig {
    /// Checks that `level` parses as a filter directive.
    pub fn validate(&self) -> AppResult<()> {
        EnvFilter::try_new(&self.level).map(|_| ()).map_err(|e| {
            AutomationError::Configuration(format!("Invalid log level '{}': {}", self.level, e))
        })
    }
}

/// Install the global tracing subscriber.
///
/// # Errors
///
/// Fails if the level is not a valid filter or a global subscriber is already set.
pub fn init(config: &LogConfig) -> AppResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            AutomationError::Configuration(format!("Invalid log level '{}': {}", config.level, e))
        })?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.with_ansi)
        .with_target(config.with_target);

    let result = match config.format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    result.map_err(|e| AutomationError::Configuration(format!("Failed to initialize tracing: {}", e)))
}

/// Initialize with defaults, ignoring an already-installed subscriber.
pub fn init_default() {
    let _ = init(&LogConfig::default());
}
