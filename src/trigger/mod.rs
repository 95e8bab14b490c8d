//! Compound trigger conditions.
//!
//! Conditions are stored in an arena ([`TriggerTree`]) and refer to their operands by
//! index. Construction validates the arena once (index bounds, operand counts,
//! protocol support, acyclicity), so evaluation never has to guard against
//! malformed trees.
//!
//! ```rust
//! use scope_automation::instrument::ChannelId;
//! use scope_automation::trigger::{Comparator, LogicOperator, Slope, TreeBuilder, TriggerCondition};
//!
//! let mut builder = TreeBuilder::new();
//! let edge = builder.add(TriggerCondition::Edge { channel: ChannelId(1), slope: Slope::Rising, level: 0.5 });
//! let level = builder.add(TriggerCondition::Level {
//!     channel: ChannelId(2),
//!     threshold: 1.0,
//!     comparator: Comparator::Greater,
//! });
//! let root = builder.add(TriggerCondition::Logic { operator: LogicOperator::And, operands: vec![edge, level] });
//! let tree = builder.build(root).unwrap();
//! assert_eq!(tree.channels().len(), 2);
//! ```

pub mod evaluator;
pub mod pattern;
pub mod protocol;
pub mod tree;

pub use evaluator::{
    evaluate, monitor, monitor_definition, ChannelSnapshot, MonitorControl, TriggerEvaluator, TriggerHit,
};
pub use pattern::BitPattern;
pub use protocol::{I2cRule, Parity, ProtocolKind, ProtocolRule, SpiRule, UartRule};
pub use tree::{NodeId, TreeBuilder, TriggerTree};

use crate::instrument::ChannelId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Edge direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slope {
    Rising,
    Falling,
    Either,
}

/// Pulse polarity for pulse-width conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    #[default]
    Positive,
    Negative,
}

/// Comparison operator shared by level conditions and branch expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
    Equal,
    NotEqual,
}

impl Comparator {
    /// Tolerance for `Equal`/`NotEqual` on floating point values.
    pub const EPSILON: f64 = 1e-9;

    pub fn compare(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Greater => value > threshold,
            Comparator::GreaterOrEqual => value >= threshold,
            Comparator::Less => value < threshold,
            Comparator::LessOrEqual => value <= threshold,
            Comparator::Equal => (value - threshold).abs() <= Self::EPSILON,
            Comparator::NotEqual => (value - threshold).abs() > Self::EPSILON,
        }
    }
}

/// Boolean operator of a [`TriggerCondition::Logic`] node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicOperator {
    And,
    Or,
    Xor,
    Nand,
    Nor,
}

impl LogicOperator {
    /// Combines operand results.
    pub fn combine(self, results: &[bool]) -> bool {
        let any = results.iter().any(|r| *r);
        let all = results.iter().all(|r| *r);
        match self {
            LogicOperator::And => all,
            LogicOperator::Or => any,
            LogicOperator::Xor => results.iter().filter(|r| **r).count() == 1,
            LogicOperator::Nand => !all,
            LogicOperator::Nor => !any,
        }
    }
}

/// Default logic threshold (volts) for digital interpretation of analog samples.
pub fn default_logic_threshold() -> f64 {
    1.5
}

/// A trigger predicate over channel data.
///
/// `Logic` and `Sequence` refer to other nodes of the owning [`TriggerTree`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerCondition {
    /// Adjacent samples cross `level` in the `slope` direction.
    Edge {
        channel: ChannelId,
        slope: Slope,
        level: f64,
    },
    /// A sample satisfies `comparator` against `threshold`.
    Level {
        channel: ChannelId,
        threshold: f64,
        comparator: Comparator,
    },
    /// The most recently closed pulse lasted between `min` and `max`.
    PulseWidth {
        channel: ChannelId,
        #[serde(with = "humantime_serde")]
        min: Duration,
        #[serde(with = "humantime_serde")]
        max: Duration,
        #[serde(default)]
        level: f64,
        #[serde(default)]
        polarity: Polarity,
    },
    /// Logic levels of several channels match a bit pattern with wildcards.
    Pattern {
        pattern: BitPattern,
        #[serde(default = "default_logic_threshold")]
        threshold: f64,
    },
    /// Boolean combination of operand nodes, evaluated on the same snapshot.
    Logic {
        operator: LogicOperator,
        operands: Vec<NodeId>,
    },
    /// Operand nodes must become true in order, each within `per_step_timeout`.
    Sequence {
        steps: Vec<NodeId>,
        #[serde(with = "humantime_serde")]
        per_step_timeout: Duration,
    },
    /// A decoded serial bus frame matches a rule.
    Protocol { rule: ProtocolRule },
}

impl TriggerCondition {
    /// Child node ids.
    pub fn children(&self) -> &[NodeId] {
        match self {
            TriggerCondition::Logic { operands, .. } => operands,
            TriggerCondition::Sequence { steps, .. } => steps,
            _ => &[],
        }
    }

    /// Channels read directly by this node (children excluded).
    pub fn channels(&self) -> Vec<ChannelId> {
        match self {
            TriggerCondition::Edge { channel, .. }
            | TriggerCondition::Level { channel, .. }
            | TriggerCondition::PulseWidth { channel, .. } => vec![*channel],
            TriggerCondition::Pattern { pattern, .. } => pattern.channels().to_vec(),
            TriggerCondition::Protocol { rule } => rule.channels(),
            TriggerCondition::Logic { .. } | TriggerCondition::Sequence { .. } => Vec::new(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            TriggerCondition::Edge { .. } => "edge",
            TriggerCondition::Level { .. } => "level",
            TriggerCondition::PulseWidth { .. } => "pulse_width",
            TriggerCondition::Pattern { .. } => "pattern",
            TriggerCondition::Logic { .. } => "logic",
            TriggerCondition::Sequence { .. } => "sequence",
            TriggerCondition::Protocol { .. } => "protocol",
        }
    }
}

/// Acquisition behavior when a trigger is used to wait for data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Fires on its own when no event arrives before the wait times out.
    Auto,
    /// Only a real trigger event satisfies the wait.
    #[default]
    Normal,
    /// Fires once, then a monitor stops.
    Single,
}

/// A named, persisted trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub mode: TriggerMode,
    /// Minimum time between two reported hits.
    #[serde(default, with = "humantime_serde")]
    pub holdoff: Duration,
    pub tree: TriggerTree,
}

impl TriggerDefinition {
    pub fn new(name: impl Into<String>, tree: TriggerTree) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            mode: TriggerMode::Normal,
            holdoff: Duration::ZERO,
            tree,
        }
    }

    pub fn with_mode(mut self, mode: TriggerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_holdoff(mut self, holdoff: Duration) -> Self {
        self.holdoff = holdoff;
        self
    }
}

/// A named collection of trigger definitions, persisted as one document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TriggerSet {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub triggers: Vec<TriggerDefinition>,
}

impl TriggerSet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            triggers: Vec::new(),
        }
    }

    /// Adds or replaces (by name) a definition.
    pub fn insert(&mut self, definition: TriggerDefinition) {
        self.triggers.retain(|t| t.name != definition.name);
        self.triggers.push(definition);
    }

    /// Looks a definition up by name or by id.
    pub fn get(&self, key: &str) -> Option<&TriggerDefinition> {
        self.triggers
            .iter()
            .find(|t| t.name == key || t.id.to_string() == key)
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }
}
