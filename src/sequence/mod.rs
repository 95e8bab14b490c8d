//! Measurement sequences.
//!
//! A [`Sequence`] is an ordered list of [`Step`]s, each wrapped in a [`StepSpec`]
//! carrying per-step options. `Branch` steps jump to another index (or to
//! `steps.len()`, the end of the sequence) depending on an [`Expr`].
//!
//! ```rust
//! use scope_automation::analysis::MeasurementKind;
//! use scope_automation::instrument::ChannelId;
//! use scope_automation::sequence::{Sequence, Step};
//! use std::time::Duration;
//!
//! let sequence = Sequence::new("rms check")
//!     .with_step(Step::Delay { duration: Duration::from_millis(5) })
//!     .with_step(Step::Measure { kind: MeasurementKind::Rms, channel: ChannelId(1), store_as: None });
//! assert!(sequence.validate().is_ok());
//! ```

pub mod expr;

pub use expr::{Bindings, Expr, Operand};

use crate::analysis::MeasurementKind;
use crate::error::{AppResult, AutomationError};
use crate::instrument::ChannelId;
use crate::trigger::TriggerTree;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// A scalar value used for variables, parameters and script arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParameterValue {
    /// Numeric view of `Int` and `Float` values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Int(v) => Some(*v as f64),
            ParameterValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ParameterValue::Bool(_) => "bool",
            ParameterValue::Int(_) => "int",
            ParameterValue::Float(_) => "float",
            ParameterValue::Text(_) => "string",
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Bool(v) => write!(f, "{}", v),
            ParameterValue::Int(v) => write!(f, "{}", v),
            ParameterValue::Float(v) => write!(f, "{}", v),
            ParameterValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        ParameterValue::Float(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        ParameterValue::Int(v)
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        ParameterValue::Bool(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        ParameterValue::Text(v.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(v: String) -> Self {
        ParameterValue::Text(v)
    }
}

/// Trigger used by a `WaitForTrigger` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerRef {
    /// Name or id of a definition registered with the engine.
    Named(String),
    /// A tree evaluated in normal mode.
    Inline(TriggerTree),
}

/// One automation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// Reads a channel record and computes a measurement on it.
    Measure {
        kind: MeasurementKind,
        channel: ChannelId,
        /// Result key; defaults to `{kind}_{channel}`, e.g. `rms_ch1`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        store_as: Option<String>,
    },
    Delay {
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
    /// Writes an instrument setting through the `set_parameter` command template.
    SetParameter { target: String, value: ParameterValue },
    WaitForTrigger {
        trigger: TriggerRef,
        #[serde(with = "humantime_serde")]
        timeout: Duration,
    },
    /// Acquires the channels, through their channel group when one matches exactly.
    Acquire { channels: Vec<ChannelId> },
    Branch {
        condition: Expr,
        then_index: usize,
        else_index: usize,
    },
}

impl Step {
    /// Short human-readable description used in outcomes and progress events.
    pub fn label(&self) -> String {
        match self {
            Step::Measure { kind, channel, .. } => format!("measure {} {}", kind, channel),
            Step::Delay { duration } => format!("delay {:?}", duration),
            Step::SetParameter { target, value } => format!("set {} = {}", target, value),
            Step::WaitForTrigger { trigger, timeout } => match trigger {
                TriggerRef::Named(name) => format!("wait for trigger '{}' ({:?})", name, timeout),
                TriggerRef::Inline(_) => format!("wait for trigger ({:?})", timeout),
            },
            Step::Acquire { channels } => format!(
                "acquire {}",
                channels
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",")
            ),
            Step::Branch {
                then_index,
                else_index,
                ..
            } => format!("branch -> {} / {}", then_index, else_index),
        }
    }

    /// Key under which a `Measure` step stores its value.
    pub fn measurement_key(&self) -> Option<String> {
        match self {
            Step::Measure {
                kind,
                channel,
                store_as,
            } => Some(
                store_as
                    .clone()
                    .unwrap_or_else(|| format!("{}_{}", kind.as_str(), channel)),
            ),
            _ => None,
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// A step plus its execution options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub step: Step,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Disabled steps are recorded as skipped.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Extra attempts for transient driver failures on top of the global policy.
    #[serde(default)]
    pub retry_count: u32,
}

impl From<Step> for StepSpec {
    fn from(step: Step) -> Self {
        Self {
            step,
            description: None,
            enabled: true,
            retry_count: 0,
        }
    }
}

impl StepSpec {
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// What happens after a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    AbortOnFirstFailure,
    ContinueOnFailure,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// An ordered, possibly branching list of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    pub steps: Vec<StepSpec>,
    /// Initial run variables.
    #[serde(default)]
    pub variables: BTreeMap<String, ParameterValue>,
}

impl Sequence {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            version: default_version(),
            failure_policy: FailurePolicy::default(),
            steps: Vec::new(),
            variables: BTreeMap::new(),
        }
    }

    pub fn with_step(self, step: Step) -> Self {
        self.with_spec(step.into())
    }

    pub fn with_spec(mut self, spec: StepSpec) -> Self {
        self.steps.push(spec);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Structural checks run at submission time.
    pub fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(AutomationError::Configuration(
                "Sequence name must not be empty".to_string(),
            ));
        }
        let end = self.steps.len();
        for (index, spec) in self.steps.iter().enumerate() {
            match &spec.step {
                Step::Branch {
                    then_index,
                    else_index,
                    ..
                } => {
                    if let Some(bad) = [*then_index, *else_index].into_iter().find(|i| *i > end) {
                        return Err(AutomationError::Configuration(format!(
                            "Step {} branches to {} but the sequence has {} steps",
                            index, bad, end
                        )));
                    }
                }
                Step::Measure {
                    store_as: Some(key),
                    ..
                } if key.trim().is_empty() => {
                    return Err(AutomationError::Configuration(format!(
                        "Step {} stores its measurement under an empty name",
                        index
                    )));
                }
                Step::Acquire { channels } if channels.is_empty() => {
                    return Err(AutomationError::Configuration(format!(
                        "Step {} acquires no channels",
                        index
                    )));
                }
                Step::SetParameter { target, .. } if target.trim().is_empty() => {
                    return Err(AutomationError::Configuration(format!(
                        "Step {} sets a parameter without a target",
                        index
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}
