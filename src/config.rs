//! Configuration System using Figment
//!
//! Configuration is layered from:
//! 1. Built-in defaults
//! 2. An optional TOML file (`scope_automation.toml` by default)
//! 3. Environment variables (prefixed with `SCOPE_AUTOMATION_`)
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated with a double underscore:
//!
//! ```text
//! SCOPE_AUTOMATION_ENGINE__POLL_INTERVAL=20ms
//! SCOPE_AUTOMATION_RETRY__MAX_ATTEMPTS=5
//! SCOPE_AUTOMATION_LOGGING__LEVEL=debug
//! ```
//!
//! # Example
//!
//! ```no_run
//! use scope_automation::config::AutomationConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AutomationConfig::load()?;
//! println!("Poll interval: {:?}", config.engine.poll_interval);
//! # Ok(())
//! # }
//! ```

use crate::error::{AppResult, AutomationError};
use crate::error_recovery::RetryPolicy;
use crate::logging::LogConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Default configuration file looked up by [`AutomationConfig::load`].
pub const DEFAULT_CONFIG_FILE: &str = "scope_automation.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    /// Run queue and worker settings
    pub engine: EngineConfig,
    /// Retry policy for transient driver failures
    pub retry: RetryPolicy,
    /// Channel synchronization settings
    pub sync: SyncConfig,
    /// Script runtime limits
    pub script: ScriptConfig,
    /// Instrument capability limits used for timing validation
    pub limits: InstrumentLimits,
    /// Instrument command templates
    pub commands: CommandTemplates,
    /// Tracing output settings
    pub logging: LogConfig,
}

/// Run queue and worker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interval at which blocking waits re-check hardware state and cancellation
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Number of finished runs retained in the result history
    pub history_capacity: usize,
    /// Capacity of the progress event broadcast channel
    pub event_capacity: usize,
    /// Upper bound on steps dispatched by one sequence run, bounding branch loops
    pub max_dispatched_steps: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            history_capacity: 64,
            event_capacity: 1024,
            max_dispatched_steps: 10_000,
        }
    }
}

/// Channel synchronization settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Offset at which sync quality reaches 0.0
    #[serde(with = "humantime_serde")]
    pub max_offset: Duration,
    /// Bound on waiting for a group acquisition to complete
    #[serde(with = "humantime_serde")]
    pub completion_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_offset: Duration::from_micros(100),
            completion_timeout: Duration::from_secs(5),
        }
    }
}

/// Script runtime limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Maximum number of Rhai operations per script run
    pub max_operations: u64,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            max_operations: 100_000,
        }
    }
}

/// Instrument capability limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentLimits {
    /// Number of analog channels, numbered from 1
    pub channel_count: u8,
    /// Maximum sample rate in samples per second
    pub max_sample_rate: f64,
    /// Maximum record length in samples
    pub max_record_length: usize,
    /// Smallest timebase in seconds per division
    pub min_timebase: f64,
    /// Largest timebase in seconds per division
    pub max_timebase: f64,
}

impl Default for InstrumentLimits {
    fn default() -> Self {
        Self {
            channel_count: 4,
            max_sample_rate: 2.5e9,
            max_record_length: 20_000_000,
            min_timebase: 1e-9,
            max_timebase: 50.0,
        }
    }
}

/// Instrument command templates, rendered with `strfmt`.
///
/// Available placeholders are listed per field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandTemplates {
    /// `{target}`, `{value}`
    pub set_parameter: String,
    /// `{mode}`
    pub sync_mode: String,
    /// `{channel}`, `{sample_rate}`, `{record_length}`, `{timebase}`, `{delay}`, `{pretrigger}`, `{acquisition}`
    pub configure_timing: String,
    /// `{channel}`, `{reference}`
    pub follow_reference: String,
    /// `{channel}`
    pub arm_channel: String,
    /// `{channel}`
    pub stop_channel: String,
    /// `{channel}`; a trimmed response of `1` means the acquisition finished
    pub acquisition_complete: String,
}

impl Default for CommandTemplates {
    fn default() -> Self {
        Self {
            set_parameter: "{target} {value}".to_string(),
            sync_mode: "SYNC:MODE {mode}".to_string(),
            configure_timing: "CHAN{channel}:TIM {timebase};CHAN{channel}:SRAT {sample_rate};CHAN{channel}:POIN {record_length};CHAN{channel}:DEL {delay};CHAN{channel}:PRET {pretrigger};CHAN{channel}:ACQ {acquisition}".to_string(),
            follow_reference: "CHAN{channel}:SYNC:SOUR CHAN{reference}".to_string(),
            arm_channel: "CHAN{channel}:ARM".to_string(),
            stop_channel: "CHAN{channel}:STOP".to_string(),
            acquisition_complete: "CHAN{channel}:ACQ:COMP?".to_string(),
        }
    }
}

/// Renders a command template, failing on unknown placeholders.
pub fn render_command(template: &str, vars: &HashMap<String, String>) -> AppResult<String> {
    strfmt::strfmt(template, vars).map_err(|e| {
        AutomationError::Configuration(format!("Invalid command template '{}': {}", template, e))
    })
}

impl AutomationConfig {
    /// Load configuration from the default file (if present) and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load configuration from a specific file (if present) and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The layered figment used for loading, exposed for callers adding providers.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("SCOPE_AUTOMATION_").split("__"))
    }

    /// Renders the configuration as a TOML document that `load_from` accepts.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| AutomationError::Configuration(format!("Failed to render configuration: {}", e)))
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns a descriptive [`AutomationError::Configuration`] for the first invalid value.
    pub fn validate(&self) -> AppResult<()> {
        if self.engine.poll_interval.is_zero() {
            return Err(AutomationError::Configuration(
                "engine.poll_interval must be greater than zero".to_string(),
            ));
        }
        if self.engine.history_capacity == 0 {
            return Err(AutomationError::Configuration(
                "engine.history_capacity must be at least 1".to_string(),
            ));
        }
        if self.engine.event_capacity == 0 {
            return Err(AutomationError::Configuration(
                "engine.event_capacity must be at least 1".to_string(),
            ));
        }
        if self.engine.max_dispatched_steps == 0 {
            return Err(AutomationError::Configuration(
                "engine.max_dispatched_steps must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(AutomationError::Configuration(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(self.retry.backoff_multiplier >= 1.0) {
            return Err(AutomationError::Configuration(format!(
                "retry.backoff_multiplier must be >= 1.0, got {}",
                self.retry.backoff_multiplier
            )));
        }
        if self.sync.max_offset.is_zero() {
            return Err(AutomationError::Configuration(
                "sync.max_offset must be greater than zero".to_string(),
            ));
        }
        if self.script.max_operations == 0 {
            return Err(AutomationError::Configuration(
                "script.max_operations must be at least 1".to_string(),
            ));
        }
        let limits = &self.limits;
        if limits.channel_count == 0 {
            return Err(AutomationError::Configuration(
                "limits.channel_count must be at least 1".to_string(),
            ));
        }
        if !(limits.max_sample_rate > 0.0) || limits.max_record_length == 0 {
            return Err(AutomationError::Configuration(
                "limits.max_sample_rate and limits.max_record_length must be positive".to_string(),
            ));
        }
        if !(limits.min_timebase > 0.0 && limits.min_timebase <= limits.max_timebase) {
            return Err(AutomationError::Configuration(format!(
                "limits timebase range [{}, {}] is invalid",
                limits.min_timebase, limits.max_timebase
            )));
        }
        self.logging.validate()?;
        Ok(())
    }
}
