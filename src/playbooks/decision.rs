use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use tracing::debug;

use super::context::ExecutionContext;
use super::error::ConditionError;
use crate::models::{ComparisonOperator, Condition, DecisionSpec, LogicalOperator, RiskLevel};

/// Score at or above which an indicator is high risk
pub const HIGH_RISK_SCORE: f64 = 70.0;

/// Score at or above which an indicator is medium risk
pub const MEDIUM_RISK_SCORE: f64 = 40.0;

/// Evaluates conditions against an execution context.
///
/// Evaluation is pure: it reads the context and never mutates it. Anything that cannot be
/// evaluated (missing field, wrong type) is `false`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecisionEvaluator;

impl DecisionEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(&self, condition: &Condition, context: &ExecutionContext) -> bool {
        match self.try_evaluate(condition, context) {
            Ok(result) => result,
            Err(err) => {
                debug!(error = %err, "Condition evaluated to false");
                false
            }
        }
    }

    /// Evaluate, reporting why a leaf could not be evaluated
    pub fn try_evaluate(
        &self,
        condition: &Condition,
        context: &ExecutionContext,
    ) -> Result<bool, ConditionError> {
        match condition {
            Condition::Simple {
                field,
                operator,
                value,
            } => {
                let actual = context
                    .resolve(field)
                    .ok_or_else(|| ConditionError::MissingField(field.clone()))?;
                compare(field, actual, *operator, value)
            }
            Condition::Compound {
                operator,
                conditions,
            } => Ok(match operator {
                LogicalOperator::And => conditions.iter().all(|c| self.evaluate(c, context)),
                LogicalOperator::Or => conditions.iter().any(|c| self.evaluate(c, context)),
            }),
            Condition::Risk {
                level,
                field,
                threshold,
            } => {
                let actual = context
                    .resolve(field)
                    .ok_or_else(|| ConditionError::MissingField(field.clone()))?;
                let score = as_number(actual).ok_or_else(|| ConditionError::TypeMismatch {
                    field: field.clone(),
                    expected: "numeric",
                })?;
                classify(*level, score, *threshold)
            }
        }
    }

    /// Pick the branch for a decision node: first matching branch, else the default
    pub fn choose_branch<'a>(
        &self,
        decision: &'a DecisionSpec,
        context: &ExecutionContext,
    ) -> Option<&'a str> {
        decision
            .branches
            .iter()
            .find(|branch| self.evaluate(&branch.condition, context))
            .map(|branch| branch.id.as_str())
            .or(decision.default_branch.as_deref())
    }
}

fn classify(level: RiskLevel, score: f64, threshold: Option<f64>) -> Result<bool, ConditionError> {
    Ok(match level {
        RiskLevel::HighRisk => score >= HIGH_RISK_SCORE,
        RiskLevel::MediumRisk => (MEDIUM_RISK_SCORE..HIGH_RISK_SCORE).contains(&score),
        RiskLevel::LowRisk => score < MEDIUM_RISK_SCORE,
        RiskLevel::AboveThreshold => score > threshold.ok_or(ConditionError::MissingThreshold(level))?,
        RiskLevel::BelowThreshold => score < threshold.ok_or(ConditionError::MissingThreshold(level))?,
    })
}

fn compare(
    field: &str,
    actual: &JsonValue,
    operator: ComparisonOperator,
    expected: &JsonValue,
) -> Result<bool, ConditionError> {
    match operator {
        ComparisonOperator::Equals => Ok(values_equal(actual, expected)),
        ComparisonOperator::NotEquals => Ok(!values_equal(actual, expected)),
        ComparisonOperator::GreaterThan => order(field, actual, expected).map(|o| o == Ordering::Greater),
        ComparisonOperator::LessThan => order(field, actual, expected).map(|o| o == Ordering::Less),
        ComparisonOperator::GreaterOrEqual => {
            order(field, actual, expected).map(|o| o != Ordering::Less)
        }
        ComparisonOperator::LessOrEqual => {
            order(field, actual, expected).map(|o| o != Ordering::Greater)
        }
        ComparisonOperator::Contains => contains(field, actual, expected),
        ComparisonOperator::NotContains => contains(field, actual, expected).map(|c| !c),
        ComparisonOperator::In => member_of(field, actual, expected),
        ComparisonOperator::NotIn => member_of(field, actual, expected).map(|c| !c),
    }
}

fn as_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn values_equal(a: &JsonValue, b: &JsonValue) -> bool {
    match (a, b) {
        (JsonValue::String(x), JsonValue::String(y)) => x == y,
        (JsonValue::Number(_), _) | (_, JsonValue::Number(_)) => {
            match (as_number(a), as_number(b)) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            }
        }
        _ => a == b,
    }
}

fn order(field: &str, actual: &JsonValue, expected: &JsonValue) -> Result<Ordering, ConditionError> {
    if let (Some(x), Some(y)) = (as_number(actual), as_number(expected)) {
        return x.partial_cmp(&y).ok_or_else(|| ConditionError::TypeMismatch {
            field: field.to_string(),
            expected: "comparable",
        });
    }
    match (actual, expected) {
        (JsonValue::String(x), JsonValue::String(y)) => Ok(x.cmp(y)),
        _ => Err(ConditionError::TypeMismatch {
            field: field.to_string(),
            expected: "numeric",
        }),
    }
}

fn contains(field: &str, haystack: &JsonValue, needle: &JsonValue) -> Result<bool, ConditionError> {
    match haystack {
        JsonValue::String(s) => Ok(match needle {
            JsonValue::String(n) => s.contains(n.as_str()),
            other => s.contains(&other.to_string()),
        }),
        JsonValue::Array(items) => Ok(items.iter().any(|item| values_equal(item, needle))),
        JsonValue::Object(map) => Ok(needle.as_str().map(|k| map.contains_key(k)).unwrap_or(false)),
        _ => Err(ConditionError::TypeMismatch {
            field: field.to_string(),
            expected: "a string, list or object",
        }),
    }
}

/// List membership only; use `contains` for substring checks
fn member_of(field: &str, value: &JsonValue, set: &JsonValue) -> Result<bool, ConditionError> {
    match set {
        JsonValue::Array(items) => Ok(items.iter().any(|item| values_equal(value, item))),
        _ => Err(ConditionError::TypeMismatch {
            field: field.to_string(),
            expected: "comparable to a list",
        }),
    }
}
