use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use validator::Validate;

use super::actions::ActionHandlerRegistry;
use crate::error::{AppError, Result};
use crate::models::{Condition, Playbook, PlaybookAction};

/// Conditions nested deeper than this are flagged as hard to maintain
const MAX_CONDITION_DEPTH: usize = 5;

/// Longest budget a single action may ask for (seven days)
pub const MAX_ACTION_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Error,
    Warning,
}

/// A structural problem found in a playbook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: IssueSeverity,
    pub action_id: Option<String>,
    pub message: String,
}

impl ValidationIssue {
    fn error(action_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Error,
            action_id: action_id.map(str::to_string),
            message: message.into(),
        }
    }

    fn warning(action_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            severity: IssueSeverity::Warning,
            action_id: action_id.map(str::to_string),
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == IssueSeverity::Error
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.action_id {
            Some(id) => write!(f, "[{}] {}", id, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Reject playbooks with structural errors; warnings are ignored
pub fn validate_playbook(playbook: &Playbook, registry: Option<&ActionHandlerRegistry>) -> Result<()> {
    let errors: Vec<String> = collect_issues(playbook, registry)
        .into_iter()
        .filter(ValidationIssue::is_error)
        .map(|issue| issue.to_string())
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "playbook '{}' is invalid: {}",
            playbook.name,
            errors.join("; ")
        )))
    }
}

/// Every error and warning found in a playbook
pub fn collect_issues(
    playbook: &Playbook,
    registry: Option<&ActionHandlerRegistry>,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if let Err(e) = playbook.validate() {
        issues.push(ValidationIssue::error(None, e.to_string()));
    }
    if !playbook.enabled {
        issues.push(ValidationIssue::warning(None, "playbook is disabled"));
    }
    if playbook.requires_upfront_approval() && playbook.approval_roles().is_empty() {
        issues.push(ValidationIssue::warning(
            None,
            "approval is required but no approval roles are set; any principal may approve",
        ));
    }
    for condition in &playbook.trigger_conditions {
        check_condition(None, condition, &mut issues);
    }

    let actions = playbook.ordered_actions();
    let mut ids = HashSet::new();
    let mut orders = HashSet::new();
    let mut declared_branches: HashSet<&str> = HashSet::new();
    let mut branch_members: HashMap<&str, usize> = HashMap::new();

    for action in &actions {
        let id = Some(action.id.as_str());

        if let Err(e) = action.validate() {
            issues.push(ValidationIssue::error(id, e.to_string()));
        }
        if !ids.insert(action.id.as_str()) {
            issues.push(ValidationIssue::error(id, "duplicate action id"));
        }
        if !orders.insert(action.order) {
            issues.push(ValidationIssue::error(
                id,
                format!("order {} is used by more than one action", action.order),
            ));
        }

        if let Some(branch) = &action.branch {
            if !declared_branches.contains(branch.as_str()) {
                issues.push(ValidationIssue::error(
                    id,
                    format!("branch '{}' is not declared by an earlier decision node", branch),
                ));
            }
            *branch_members.entry(branch.as_str()).or_default() += 1;
        }

        if let Some(condition) = &action.condition {
            check_condition(id, condition, &mut issues);
        }

        if let Some(decision) = &action.decision {
            if decision.branches.is_empty() && decision.default_branch.is_none() {
                issues.push(ValidationIssue::error(
                    id,
                    "decision node declares no branches",
                ));
            }
            let mut seen = HashSet::new();
            for branch in &decision.branches {
                if !seen.insert(branch.id.as_str()) {
                    issues.push(ValidationIssue::error(
                        id,
                        format!("branch '{}' is declared twice", branch.id),
                    ));
                }
                check_condition(id, &branch.condition, &mut issues);
                declared_branches.insert(branch.id.as_str());
            }
            if let Some(default) = &decision.default_branch {
                declared_branches.insert(default.as_str());
            }
        }

        if action.timeout_secs.is_some_and(|secs| secs > MAX_ACTION_TIMEOUT_SECS) {
            issues.push(ValidationIssue::error(
                id,
                format!("timeout exceeds the {} second limit", MAX_ACTION_TIMEOUT_SECS),
            ));
        }

        if action.retry.enabled && action.retry.max_attempts == Some(1) {
            issues.push(ValidationIssue::warning(
                id,
                "retry is enabled with a single attempt",
            ));
        }

        if let Some(registry) = registry {
            check_handler(action, registry, &mut issues);
        }
    }

    for branch in declared_branches {
        if !branch_members.contains_key(branch) {
            issues.push(ValidationIssue::warning(
                None,
                format!("branch '{}' has no actions", branch),
            ));
        }
    }

    issues
}

fn check_condition(action_id: Option<&str>, condition: &Condition, issues: &mut Vec<ValidationIssue>) {
    if condition.depth() > MAX_CONDITION_DEPTH {
        issues.push(ValidationIssue::warning(
            action_id,
            format!("condition nesting depth {} is hard to follow", condition.depth()),
        ));
    }
    walk_condition(action_id, condition, issues);
}

fn walk_condition(action_id: Option<&str>, condition: &Condition, issues: &mut Vec<ValidationIssue>) {
    match condition {
        Condition::Simple { field, .. } if field.trim().is_empty() => {
            issues.push(ValidationIssue::error(action_id, "condition field is empty"));
        }
        Condition::Risk {
            level, threshold, ..
        } if level.needs_threshold() && threshold.is_none() => {
            issues.push(ValidationIssue::error(
                action_id,
                format!("risk level {} requires a threshold", level),
            ));
        }
        Condition::Compound { conditions, .. } => {
            for child in conditions {
                walk_condition(action_id, child, issues);
            }
        }
        _ => {}
    }
}

fn check_handler(action: &PlaybookAction, registry: &ActionHandlerRegistry, issues: &mut Vec<ValidationIssue>) {
    let id = Some(action.id.as_str());
    let Some(handler) = registry.get(action.action_type) else {
        issues.push(ValidationIssue::error(
            id,
            format!("no handler registered for {}", action.action_type),
        ));
        return;
    };

    // templated values are only known at run time; count them as present
    let parameters: Map<String, JsonValue> = action
        .parameters
        .iter()
        .map(|(k, v)| {
            let value = match v {
                JsonValue::String(s) if s.contains("{{") => JsonValue::String("<templated>".to_string()),
                other => other.clone(),
            };
            (k.clone(), value)
        })
        .collect();

    if let Err(e) = handler.validate_parameters(&parameters) {
        issues.push(ValidationIssue::error(id, e.to_string()));
    }
}
