//! Rhai script runtime.
//!
//! A [`Script`] is Rhai source plus a declared parameter schema. Running one goes
//! through three stages, all of which happen before anything is queued:
//!
//! 1. [`validate_parameters`] checks the caller's values against the schema, fills
//!    defaults and normalizes channels.
//! 2. The source is compiled once; a syntax error fails the call immediately.
//! 3. The resulting [`PreparedScript`] is submitted to the [`SequenceEngine`], which
//!    runs it on a blocking thread under the same driver lease as sequences.
//!
//! Scripts see a fixed set of instrument functions (see [`bridge`]) and every
//! validated parameter as a constant of the same name.
//!
//! [`SequenceEngine`]: crate::engine::SequenceEngine

pub(crate) mod bridge;
pub mod runtime;
pub mod template;

pub use runtime::{compile, PreparedScript, ScriptRuntime};
pub use template::TemplateLibrary;

use crate::error::{AppResult, AutomationError};
use crate::instrument::ChannelId;
use crate::sequence::ParameterValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Broad purpose of a script, used to filter template listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptKind {
    Measurement,
    Analysis,
    Automation,
    Calibration,
    Testing,
    #[default]
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    Int,
    Float,
    Bool,
    String,
    /// A channel number; `"ch2"` and `2` are both accepted and normalized to `2`.
    Channel,
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParameterType::Int => "int",
            ParameterType::Float => "float",
            ParameterType::Bool => "bool",
            ParameterType::String => "string",
            ParameterType::Channel => "channel",
        };
        f.write_str(name)
    }
}

fn default_required() -> bool {
    true
}

/// One declared script parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParameterType,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ParameterValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<ParameterValue>,
    #[serde(default = "default_required")]
    pub required: bool,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, kind: ParameterType) -> Self {
        Self {
            name: name.into(),
            kind,
            description: String::new(),
            default: None,
            min: None,
            max: None,
            choices: Vec::new(),
            required: true,
        }
    }

    pub fn with_default(mut self, value: impl Into<ParameterValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn with_choices<V: Into<ParameterValue>>(mut self, choices: impl IntoIterator<Item = V>) -> Self {
        self.choices = choices.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Converts `value` to this parameter's type, or explains why it cannot be.
    fn coerce(&self, value: &ParameterValue) -> Result<ParameterValue, String> {
        let mismatch = || {
            format!(
                "Parameter '{}' must be of type {}, got {} ({})",
                self.name,
                self.kind,
                value.type_name(),
                value
            )
        };
        match (self.kind, value) {
            (ParameterType::Int, ParameterValue::Int(_))
            | (ParameterType::Float, ParameterValue::Float(_))
            | (ParameterType::Bool, ParameterValue::Bool(_))
            | (ParameterType::String, ParameterValue::Text(_)) => Ok(value.clone()),
            (ParameterType::Float, ParameterValue::Int(v)) => Ok(ParameterValue::Float(*v as f64)),
            (ParameterType::Channel, ParameterValue::Int(v)) => u8::try_from(*v)
                .ok()
                .filter(|n| *n > 0)
                .map(|n| ParameterValue::Int(i64::from(n)))
                .ok_or_else(mismatch),
            (ParameterType::Channel, ParameterValue::Text(text)) => text
                .parse::<ChannelId>()
                .map(|ch| ParameterValue::Int(i64::from(ch.number())))
                .map_err(|_| mismatch()),
            _ => Err(mismatch()),
        }
    }

    /// Validates one provided or defaulted value.
    fn check(&self, value: &ParameterValue, channel_count: u8) -> Result<ParameterValue, String> {
        let value = self.coerce(value)?;
        if let Some(number) = value.as_f64() {
            if let Some(min) = self.min.filter(|min| number < *min) {
                return Err(format!("Parameter '{}' must be >= {}, got {}", self.name, min, value));
            }
            if let Some(max) = self.max.filter(|max| number > *max) {
                return Err(format!("Parameter '{}' must be <= {}, got {}", self.name, max, value));
            }
        }
        if self.kind == ParameterType::Channel && value.as_f64().is_some_and(|n| n > f64::from(channel_count)) {
            return Err(format!(
                "Parameter '{}' names channel {} but the instrument has {} channels",
                self.name, value, channel_count
            ));
        }
        if !self.choices.is_empty() {
            let allowed = self
                .choices
                .iter()
                .filter_map(|choice| self.coerce(choice).ok())
                .any(|choice| same_value(&choice, &value));
            if !allowed {
                let choices: Vec<String> = self.choices.iter().map(ToString::to_string).collect();
                return Err(format!(
                    "Parameter '{}' must be one of [{}], got {}",
                    self.name,
                    choices.join(", "),
                    value
                ));
            }
        }
        Ok(value)
    }
}

fn same_value(a: &ParameterValue, b: &ParameterValue) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x - y).abs() <= f64::EPSILON * x.abs().max(y.abs()).max(1.0),
        _ => a == b,
    }
}

/// Checks `values` against `specs`.
///
/// Unknown names, type mismatches, out-of-range values, values outside the declared
/// choices and missing required parameters are all reported together. On success the
/// returned map holds every provided value (coerced to its declared type) plus the
/// defaults of parameters the caller left out.
///
/// # Errors
///
/// [`AutomationError::ParameterValidation`] listing every problem found.
pub fn validate_parameters(
    specs: &[ParameterSpec],
    values: &BTreeMap<String, ParameterValue>,
    channel_count: u8,
) -> AppResult<BTreeMap<String, ParameterValue>> {
    let mut errors = Vec::new();
    let mut validated = BTreeMap::new();

    for name in values.keys() {
        if !specs.iter().any(|spec| &spec.name == name) {
            errors.push(format!("Unknown parameter '{}'", name));
        }
    }

    for spec in specs {
        let provided = values.get(&spec.name).or(spec.default.as_ref());
        match provided {
            Some(value) => match spec.check(value, channel_count) {
                Ok(value) => {
                    validated.insert(spec.name.clone(), value);
                }
                Err(message) => errors.push(message),
            },
            None if spec.required => {
                errors.push(format!("Required parameter '{}' is not set", spec.name));
            }
            None => {}
        }
    }

    if errors.is_empty() {
        Ok(validated)
    } else {
        Err(AutomationError::ParameterValidation(errors.join("; ")))
    }
}

fn default_version() -> String {
    "1.0".to_string()
}

/// A Rhai script with its parameter schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: ScriptKind,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    pub source: String,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Script {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            kind: ScriptKind::default(),
            version: default_version(),
            author: String::new(),
            source: source.into(),
            parameters: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, parameter: ParameterSpec) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_kind(mut self, kind: ScriptKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tags<S: Into<String>>(mut self, tags: impl IntoIterator<Item = S>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }
}
