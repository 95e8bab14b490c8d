//! Side-effect-free branch conditions.
use super::ParameterValue;
use crate::error::{AppResult, AutomationError};
use crate::trigger::Comparator;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A value referenced by a branch condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    /// A measurement recorded earlier in the run, by key (e.g. `rms_ch1`).
    Measurement(String),
    /// A run variable.
    Variable(String),
    Literal(ParameterValue),
}

/// Boolean expression over measurements, variables and literals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Expr {
    Compare {
        left: Operand,
        comparator: Comparator,
        right: Operand,
    },
    And {
        all: Vec<Expr>,
    },
    Or {
        any: Vec<Expr>,
    },
    Not {
        expr: Box<Expr>,
    },
}

/// Values visible to an expression.
pub struct Bindings<'a> {
    pub measurements: &'a BTreeMap<String, f64>,
    pub variables: &'a BTreeMap<String, ParameterValue>,
}

impl Expr {
    pub fn compare(left: Operand, comparator: Comparator, right: Operand) -> Self {
        Expr::Compare {
            left,
            comparator,
            right,
        }
    }

    /// Evaluates the expression. Every sub-expression is evaluated, so an unknown
    /// name is reported even when the result would already be decided.
    pub fn evaluate(&self, bindings: &Bindings<'_>) -> AppResult<bool> {
        match self {
            Expr::Compare {
                left,
                comparator,
                right,
            } => compare(&resolve(left, bindings)?, *comparator, &resolve(right, bindings)?),
            Expr::And { all } => {
                let results = all
                    .iter()
                    .map(|e| e.evaluate(bindings))
                    .collect::<AppResult<Vec<bool>>>()?;
                Ok(results.into_iter().all(|r| r))
            }
            Expr::Or { any } => {
                let results = any
                    .iter()
                    .map(|e| e.evaluate(bindings))
                    .collect::<AppResult<Vec<bool>>>()?;
                Ok(results.into_iter().any(|r| r))
            }
            Expr::Not { expr } => Ok(!expr.evaluate(bindings)?),
        }
    }
}

fn resolve(operand: &Operand, bindings: &Bindings<'_>) -> AppResult<ParameterValue> {
    match operand {
        Operand::Measurement(key) => bindings
            .measurements
            .get(key)
            .map(|v| ParameterValue::Float(*v))
            .ok_or_else(|| AutomationError::Expression(format!("Unknown measurement '{}'", key))),
        Operand::Variable(name) => bindings
            .variables
            .get(name)
            .cloned()
            .ok_or_else(|| AutomationError::Expression(format!("Unknown variable '{}'", name))),
        Operand::Literal(value) => Ok(value.clone()),
    }
}

fn compare(left: &ParameterValue, comparator: Comparator, right: &ParameterValue) -> AppResult<bool> {
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return Ok(comparator.compare(a, b));
    }
    let equal = match (left, right) {
        (ParameterValue::Text(a), ParameterValue::Text(b)) => a == b,
        (ParameterValue::Bool(a), ParameterValue::Bool(b)) => a == b,
        _ => {
            return Err(AutomationError::Expression(format!(
                "Cannot compare {} with {}",
                left, right
            )))
        }
    };
    match comparator {
        Comparator::Equal => Ok(equal),
        Comparator::NotEqual => Ok(!equal),
        other => Err(AutomationError::Expression(format!(
            "{:?} is not defined for {} and {}",
            other, left, right
        ))),
    }
}
