use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::time::Duration;
use strum::{Display, EnumIter, EnumString};
use uuid::Uuid;
use validator::Validate;

/// Playbook defines an automated response workflow.
///
/// Playbooks are read-only inputs to the engine: an execution takes a snapshot at start, so
/// later edits to the source definition never affect an in-flight run.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Playbook {
    /// Generated when a definition file leaves it out
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    #[validate(length(min = 1, max = 255))]
    pub name: String,

    #[validate(length(min = 1, max = 64))]
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub owner: String,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,

    /// Variables seeded into every execution context
    #[serde(default)]
    pub variables: HashMap<String, JsonValue>,

    /// Conditions a trigger payload must satisfy for automatic matching
    #[serde(default)]
    pub trigger_conditions: Vec<Condition>,

    /// Ordered list of actions
    #[validate(length(min = 1))]
    pub actions: Vec<PlaybookAction>,

    /// Approval requirement shared by every gate of this playbook
    #[serde(default)]
    pub approval: Option<ApprovalRequirement>,

    /// Whether the playbook is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Tags for organization
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Playbook {
    /// Create an enabled playbook with a fresh id
    pub fn new(name: impl Into<String>, actions: Vec<PlaybookAction>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            version: default_version(),
            description: String::new(),
            owner: String::new(),
            created_at: now,
            updated_at: now,
            variables: HashMap::new(),
            trigger_conditions: Vec::new(),
            actions,
            approval: None,
            enabled: true,
            tags: Vec::new(),
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    pub fn with_approval(mut self, approval: ApprovalRequirement) -> Self {
        self.approval = Some(approval);
        self
    }

    /// Actions sorted by their `order` index
    pub fn ordered_actions(&self) -> Vec<PlaybookAction> {
        let mut actions = self.actions.clone();
        actions.sort_by_key(|a| a.order);
        actions
    }

    /// Find an action by id
    pub fn action(&self, id: &str) -> Option<&PlaybookAction> {
        self.actions.iter().find(|a| a.id == id)
    }

    /// Roles allowed to resolve approval gates of this playbook
    pub fn approval_roles(&self) -> Vec<String> {
        self.approval
            .as_ref()
            .map(|a| a.approval_roles.clone())
            .unwrap_or_default()
    }

    /// Whether the playbook requires approval before its first dispatched action
    pub fn requires_upfront_approval(&self) -> bool {
        self.approval.as_ref().map(|a| a.required).unwrap_or(false)
    }

    /// Number of decision branches declared across all decision nodes
    pub fn branch_count(&self) -> usize {
        self.actions
            .iter()
            .filter_map(|a| a.decision.as_ref())
            .map(|d| d.branches.len())
            .sum()
    }
}

/// One typed, parameterized step of a playbook
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PlaybookAction {
    #[validate(length(min = 1, max = 128))]
    pub id: String,

    #[serde(default)]
    pub name: String,

    pub action_type: ActionType,

    #[serde(default)]
    pub parameters: HashMap<String, JsonValue>,

    /// Explicit position in the playbook
    pub order: u32,

    /// Per-action timeout covering every attempt (seconds)
    #[validate(range(min = 1))]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub on_error: OnErrorPolicy,

    /// Action runs only when this evaluates to true
    #[serde(default)]
    pub condition: Option<Condition>,

    #[serde(default)]
    pub requires_approval: bool,

    /// Present on decision nodes
    #[serde(default)]
    pub decision: Option<DecisionSpec>,

    /// Branch this action belongs to; it runs only if that branch was chosen
    #[serde(default)]
    pub branch: Option<String>,
}

impl PlaybookAction {
    pub fn new(id: impl Into<String>, action_type: ActionType, order: u32) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            action_type,
            parameters: HashMap::new(),
            order,
            timeout_secs: None,
            retry: RetryConfig::default(),
            on_error: OnErrorPolicy::default(),
            condition: None,
            requires_approval: false,
            decision: None,
            branch: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_on_error(mut self, policy: OnErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_decision(mut self, decision: DecisionSpec) -> Self {
        self.decision = Some(decision);
        self
    }

    pub fn in_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn requiring_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    /// Whether reaching this action suspends the execution for approval
    pub fn needs_approval(&self) -> bool {
        self.requires_approval || self.action_type == ActionType::Approval
    }

    pub fn is_decision_node(&self) -> bool {
        self.decision.is_some()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// The closed set of built-in action kinds
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionType {
    BlockIp,
    IsolateEndpoint,
    ResetCredentials,
    SendNotification,
    CreateTicket,
    CollectEvidence,
    RunScan,
    UpdateFirewall,
    QuerySiem,
    EnrichIoc,
    CustomApi,
    Wait,
    Approval,
}

/// Per-action retry settings; unset fields fall back to the engine defaults
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RetryConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Attempts including the first one
    #[serde(default)]
    pub max_attempts: Option<u32>,

    #[serde(default)]
    pub backoff_base_ms: Option<u64>,

    #[serde(default)]
    pub backoff_multiplier: Option<f64>,

    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
}

impl RetryConfig {
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            enabled: true,
            max_attempts: Some(max_attempts),
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, base_ms: u64, multiplier: f64) -> Self {
        self.backoff_base_ms = Some(base_ms);
        self.backoff_multiplier = Some(multiplier);
        self
    }
}

/// Execution-level impact of an action that failed after all retries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OnErrorPolicy {
    #[default]
    Fail,
    Continue,
    Skip,
}

/// Condition evaluated by the decision evaluator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Simple {
        field: String,
        operator: ComparisonOperator,
        #[serde(default)]
        value: JsonValue,
    },
    Compound {
        operator: LogicalOperator,
        conditions: Vec<Condition>,
    },
    Risk {
        level: RiskLevel,
        #[serde(default = "default_score_field")]
        field: String,
        #[serde(default)]
        threshold: Option<f64>,
    },
}

impl Condition {
    pub fn simple(field: impl Into<String>, operator: ComparisonOperator, value: JsonValue) -> Self {
        Condition::Simple {
            field: field.into(),
            operator,
            value,
        }
    }

    pub fn all(conditions: Vec<Condition>) -> Self {
        Condition::Compound {
            operator: LogicalOperator::And,
            conditions,
        }
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Condition::Compound {
            operator: LogicalOperator::Or,
            conditions,
        }
    }

    pub fn risk(level: RiskLevel) -> Self {
        Condition::Risk {
            level,
            field: default_score_field(),
            threshold: None,
        }
    }

    pub fn threshold(level: RiskLevel, field: impl Into<String>, threshold: f64) -> Self {
        Condition::Risk {
            level,
            field: field.into(),
            threshold: Some(threshold),
        }
    }

    /// Nesting depth of the condition tree
    pub fn depth(&self) -> usize {
        match self {
            Condition::Compound { conditions, .. } => {
                1 + conditions.iter().map(|c| c.depth()).max().unwrap_or(0)
            }
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ComparisonOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    Contains,
    NotContains,
    In,
    NotIn,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogicalOperator {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RiskLevel {
    HighRisk,
    MediumRisk,
    LowRisk,
    AboveThreshold,
    BelowThreshold,
}

impl RiskLevel {
    pub fn needs_threshold(&self) -> bool {
        matches!(self, RiskLevel::AboveThreshold | RiskLevel::BelowThreshold)
    }
}

/// Branch point attached to a decision node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionSpec {
    /// Evaluated in order; the first branch whose condition holds is taken
    pub branches: Vec<DecisionBranch>,

    /// Branch taken when no condition holds
    #[serde(default)]
    pub default_branch: Option<String>,
}

impl DecisionSpec {
    pub fn new(branches: Vec<DecisionBranch>) -> Self {
        Self {
            branches,
            default_branch: None,
        }
    }

    pub fn with_default(mut self, branch: impl Into<String>) -> Self {
        self.default_branch = Some(branch.into());
        self
    }

    pub fn declares(&self, branch: &str) -> bool {
        self.branches.iter().any(|b| b.id == branch)
            || self.default_branch.as_deref() == Some(branch)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionBranch {
    pub id: String,
    pub condition: Condition,
}

impl DecisionBranch {
    pub fn new(id: impl Into<String>, condition: Condition) -> Self {
        Self {
            id: id.into(),
            condition,
        }
    }
}

/// Human approval requirement of a playbook
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ApprovalRequirement {
    /// Gate the first dispatched action
    #[serde(default)]
    pub required: bool,

    /// Roles allowed to resolve a gate; empty means any principal
    #[serde(default)]
    pub approval_roles: Vec<String>,

    /// Auto-reject deadline overriding the engine default (seconds)
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_score_field() -> String {
    "score".to_string()
}
