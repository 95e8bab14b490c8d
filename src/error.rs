//! Custom error types for the automation core.
//!
//! This module defines the primary error type, `AutomationError`, shared by every
//! component of the crate. Using the `thiserror` crate, it provides a centralized
//! and consistent way to report failures, from lost instrument connectivity to
//! rejected trigger trees and unsupported persisted documents.
//!
//! ## Error Hierarchy
//!
//! - **`DriverUnavailable`**: connectivity to the instrument was lost or refused. This is
//!   the only transient kind; step execution retries it according to the configured
//!   [`RetryPolicy`](crate::error_recovery::RetryPolicy) before escalating.
//! - **`StepTimeout`**: a trigger wait or acquisition wait exceeded its bound.
//! - **`InvalidGroupConfiguration`**: a channel group was rejected at creation time.
//! - **`ParameterValidation`**: script parameters did not match the declared schema.
//! - **`UnsupportedVersion`**: a persisted document carries an unknown schema version.
//! - **`CyclicCondition`**: a trigger tree references itself.
//!
//! The remaining variants cover configuration, I/O and serialization failures, script
//! runtime errors and misuse of the engine API. Each variant maps onto an [`ErrorKind`],
//! the serializable classification recorded in an execution result.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, AutomationError>;

/// Errors raised anywhere in the automation core.
#[derive(Error, Debug)]
pub enum AutomationError {
    /// Transient loss of the instrument; the only error retried with backoff.
    #[error("Instrument driver unavailable: {0}")]
    DriverUnavailable(String),

    /// A trigger wait or acquisition exceeded its timeout.
    #[error("Step timed out after {0:?}")]
    StepTimeout(Duration),

    #[error("Invalid channel group configuration: {0}")]
    InvalidGroupConfiguration(String),

    #[error("Parameter validation error: {0}")]
    ParameterValidation(String),

    #[error("Unsupported schema version {found} (supported: {supported})")]
    UnsupportedVersion {
        /// Version stored in the document.
        found: u32,
        /// Version this build reads and writes.
        supported: u32,
    },

    /// A trigger tree node reachable from itself, identified by node index.
    #[error("Cyclic trigger condition: node {0} is reachable from itself")]
    CyclicCondition(usize),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Figment could not extract the configuration.
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] figment::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The instrument rejected a command or returned unusable data.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// A record could not be analyzed.
    #[error("Data processing error: {0}")]
    Processing(String),

    /// A branch condition referenced a missing operand.
    #[error("Expression error: {0}")]
    Expression(String),

    /// Rhai compile or runtime failure, including the operation limit.
    #[error("Script error: {0}")]
    Script(String),

    #[error("Unknown run: {0}")]
    UnknownRun(String),

    #[error("Unknown channel group: {0}")]
    UnknownGroup(String),

    /// Operation not allowed in the current run or group state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl AutomationError {
    /// Classification of this error for execution results and progress events.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AutomationError::DriverUnavailable(_) => ErrorKind::DriverUnavailable,
            AutomationError::StepTimeout(_) => ErrorKind::StepTimeout,
            AutomationError::InvalidGroupConfiguration(_) => ErrorKind::InvalidGroupConfiguration,
            AutomationError::ParameterValidation(_) => ErrorKind::ParameterValidation,
            AutomationError::UnsupportedVersion { .. } => ErrorKind::UnsupportedVersion,
            AutomationError::CyclicCondition(_) => ErrorKind::CyclicCondition,
            AutomationError::Configuration(_) | AutomationError::ConfigLoad(_) => {
                ErrorKind::Configuration
            }
            AutomationError::Io(_) => ErrorKind::Io,
            AutomationError::Serialization(_) => ErrorKind::Serialization,
            AutomationError::Instrument(_) => ErrorKind::Instrument,
            AutomationError::Processing(_) => ErrorKind::Processing,
            AutomationError::Expression(_) => ErrorKind::Expression,
            AutomationError::Script(_) => ErrorKind::Script,
            AutomationError::UnknownRun(_) => ErrorKind::UnknownRun,
            AutomationError::UnknownGroup(_) => ErrorKind::UnknownGroup,
            AutomationError::InvalidState(_) => ErrorKind::InvalidState,
            AutomationError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, AutomationError::DriverUnavailable(_))
    }
}

/// Serializable error classification stored in execution results.
///
/// One variant per [`AutomationError`] variant, except that figment load errors
/// report as `Configuration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DriverUnavailable,
    StepTimeout,
    InvalidGroupConfiguration,
    ParameterValidation,
    UnsupportedVersion,
    CyclicCondition,
    Configuration,
    Io,
    Serialization,
    Instrument,
    Processing,
    Expression,
    Script,
    UnknownRun,
    UnknownGroup,
    InvalidState,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::DriverUnavailable => "driver_unavailable",
            ErrorKind::StepTimeout => "step_timeout",
            ErrorKind::InvalidGroupConfiguration => "invalid_group_configuration",
            ErrorKind::ParameterValidation => "parameter_validation",
            ErrorKind::UnsupportedVersion => "unsupported_version",
            ErrorKind::CyclicCondition => "cyclic_condition",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Io => "io",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Instrument => "instrument",
            ErrorKind::Processing => "processing",
            ErrorKind::Expression => "expression",
            ErrorKind::Script => "script",
            ErrorKind::UnknownRun => "unknown_run",
            ErrorKind::UnknownGroup => "unknown_group",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}
