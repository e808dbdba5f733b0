use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use strum::{Display, EnumString};
use uuid::Uuid;

use super::playbook::{ActionType, Playbook, PlaybookAction};
use crate::error::{AppError, Result};

/// How actions are dispatched for an execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionMode {
    /// Invoke real connectors
    Live,
    /// Synthetic outputs, flagged as a test run
    Test,
    /// Synthetic outputs, full engine semantics
    Simulation,
}

impl ExecutionMode {
    /// Whether handlers must produce synthetic output instead of calling connectors
    pub fn is_synthetic(&self) -> bool {
        !matches!(self, ExecutionMode::Live)
    }
}

/// Execution state machine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Running,
    AwaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    /// Terminal, or suspended until an external decision arrives
    pub fn is_settled(&self) -> bool {
        self.is_terminal() || *self == ExecutionStatus::AwaitingApproval
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Queued, Running) => true,
            (Running, Running) => true,
            (Running, AwaitingApproval) => true,
            (AwaitingApproval, Running) => true,
            (AwaitingApproval, Failed) => true,
            (Running, Failed) => true,
            (Running, Completed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Lifecycle of a single action within an execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Completed | ActionStatus::Failed | ActionStatus::Skipped
        )
    }
}

/// What started an execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerDescriptor {
    /// Originating system (e.g. "siem", "analyst", "ioc-feed")
    pub source: String,

    /// Trigger kind (e.g. "manual", "alert", "ioc_match")
    pub trigger_type: String,

    /// Payload seeded into the execution context
    #[serde(default)]
    pub payload: JsonValue,

    pub received_at: DateTime<Utc>,
}

impl TriggerDescriptor {
    pub fn new(source: impl Into<String>, trigger_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            source: source.into(),
            trigger_type: trigger_type.into(),
            payload,
            received_at: Utc::now(),
        }
    }

    pub fn manual(payload: JsonValue) -> Self {
        Self::new("manual", "manual", payload)
    }
}

/// Audit record of one action
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionResult {
    pub action_id: String,
    pub action_type: ActionType,
    pub order: u32,
    pub status: ActionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub output: Option<JsonValue>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub skip_reason: Option<String>,
}

impl ActionResult {
    /// Create a pending result for an action the orchestrator just reached
    pub fn pending(action: &PlaybookAction) -> Self {
        Self {
            action_id: action.id.clone(),
            action_type: action.action_type,
            order: action.order,
            status: ActionStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            output: None,
            error: None,
            retry_count: 0,
            skip_reason: None,
        }
    }

    fn ensure_mutable(&self, next: ActionStatus) -> Result<()> {
        if self.status.is_terminal() {
            return Err(AppError::InvalidStateTransition(format!(
                "action {} is already {} and cannot become {}",
                self.action_id, self.status, next
            )));
        }
        Ok(())
    }

    fn finish(&mut self, status: ActionStatus) {
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.duration_ms = self
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0));
    }

    pub fn start(&mut self) -> Result<()> {
        if self.status != ActionStatus::Pending {
            return Err(AppError::InvalidStateTransition(format!(
                "action {} cannot start from {}",
                self.action_id, self.status
            )));
        }
        self.status = ActionStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete(&mut self, output: JsonValue, retry_count: u32) -> Result<()> {
        self.ensure_mutable(ActionStatus::Completed)?;
        self.output = Some(output);
        self.retry_count = retry_count;
        self.finish(ActionStatus::Completed);
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>, retry_count: u32) -> Result<()> {
        self.ensure_mutable(ActionStatus::Failed)?;
        self.error = Some(error.into());
        self.retry_count = retry_count;
        self.finish(ActionStatus::Failed);
        Ok(())
    }

    /// Skip the action; `error` is kept when a failed action is downgraded by the `skip` policy
    pub fn skip(&mut self, reason: impl Into<String>, error: Option<String>) -> Result<()> {
        self.ensure_mutable(ActionStatus::Skipped)?;
        self.skip_reason = Some(reason.into());
        self.error = error;
        self.finish(ActionStatus::Skipped);
        Ok(())
    }

    /// Record the attempts made so far without finishing the action
    pub fn set_retry_count(&mut self, retry_count: u32) {
        self.retry_count = retry_count;
    }
}

/// A branch choice made by a decision node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionRecord {
    pub node_id: String,
    pub branch: String,
    pub decided_at: DateTime<Utc>,
}

/// State of one approval gate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRecord {
    pub action_id: String,
    pub required: bool,
    pub approval_roles: Vec<String>,
    pub requested_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub approved: Option<bool>,
    pub approver: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

impl ApprovalRecord {
    pub fn is_pending(&self) -> bool {
        self.approved.is_none()
    }
}

/// One recorded state machine transition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusTransition {
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// One run of a playbook against a trigger.
///
/// Owned and mutated only by the orchestrator worker driving it; every other component sees
/// persisted copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub playbook_id: Uuid,
    pub playbook_version: String,

    /// Read-only snapshot taken at start, actions sorted by `order`
    pub playbook: Playbook,

    pub trigger: TriggerDescriptor,
    pub mode: ExecutionMode,
    pub status: ExecutionStatus,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,

    pub action_results: Vec<ActionResult>,
    pub total_actions: u32,
    pub successful_actions: u32,
    pub failed_actions: u32,
    pub skipped_actions: u32,

    /// Branch ids in the order they were taken
    pub decision_path: Vec<String>,
    pub decisions: Vec<DecisionRecord>,

    pub approvals: Vec<ApprovalRecord>,

    pub errors: Vec<String>,

    /// Index of the next action to resolve
    pub cursor: usize,

    /// Action whose approval gate was granted and which has not been dispatched yet
    pub approved_action: Option<String>,

    /// Context snapshot (variables, trigger payload, namespaced action outputs)
    pub context: HashMap<String, JsonValue>,

    pub status_history: Vec<StatusTransition>,
}

impl Execution {
    /// Create a queued execution from a playbook snapshot
    pub fn new(playbook: &Playbook, trigger: TriggerDescriptor, mode: ExecutionMode) -> Self {
        let mut snapshot = playbook.clone();
        snapshot.actions = playbook.ordered_actions();

        Self {
            id: Uuid::new_v4(),
            playbook_id: playbook.id,
            playbook_version: playbook.version.clone(),
            total_actions: snapshot.actions.len() as u32,
            playbook: snapshot,
            trigger,
            mode,
            status: ExecutionStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            action_results: Vec::new(),
            successful_actions: 0,
            failed_actions: 0,
            skipped_actions: 0,
            decision_path: Vec::new(),
            decisions: Vec::new(),
            approvals: Vec::new(),
            errors: Vec::new(),
            cursor: 0,
            approved_action: None,
            context: HashMap::new(),
            status_history: Vec::new(),
        }
    }

    /// Move the state machine, rejecting transitions the engine does not allow
    pub fn transition_to(&mut self, next: ExecutionStatus, reason: impl Into<String>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::InvalidStateTransition(format!(
                "execution {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }

        if self.status == next {
            return Ok(());
        }

        let now = Utc::now();
        self.status_history.push(StatusTransition {
            from: self.status,
            to: next,
            at: now,
            reason: reason.into(),
        });
        self.status = next;

        if next == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }

        if next.is_terminal() {
            self.completed_at = Some(now);
            let started = self.started_at.unwrap_or(self.created_at);
            self.duration_ms = Some((now - started).num_milliseconds().max(0));
        }

        Ok(())
    }

    /// Action at the cursor, if any remain
    pub fn current_action(&self) -> Option<&PlaybookAction> {
        self.playbook.actions.get(self.cursor)
    }

    pub fn result(&self, action_id: &str) -> Option<&ActionResult> {
        self.action_results.iter().find(|r| r.action_id == action_id)
    }

    pub fn result_mut(&mut self, action_id: &str) -> Option<&mut ActionResult> {
        self.action_results.iter_mut().find(|r| r.action_id == action_id)
    }

    /// Return the result for `action`, creating a pending one when the action is reached first
    pub fn reach(&mut self, action: &PlaybookAction) -> &mut ActionResult {
        let position = match self.action_results.iter().position(|r| r.action_id == action.id) {
            Some(position) => position,
            None => {
                self.action_results.push(ActionResult::pending(action));
                self.action_results.len() - 1
            }
        };
        &mut self.action_results[position]
    }

    /// Recompute aggregate counters from the action results
    pub fn refresh_counters(&mut self) {
        let count = |status: ActionStatus| {
            self.action_results
                .iter()
                .filter(|r| r.status == status)
                .count() as u32
        };
        self.successful_actions = count(ActionStatus::Completed);
        self.failed_actions = count(ActionStatus::Failed);
        self.skipped_actions = count(ActionStatus::Skipped);
    }

    /// `successful + failed + skipped == total`
    pub fn counters_balanced(&self) -> bool {
        self.successful_actions + self.failed_actions + self.skipped_actions == self.total_actions
    }

    pub fn record_decision(&mut self, node_id: &str, branch: &str) {
        self.decision_path.push(branch.to_string());
        self.decisions.push(DecisionRecord {
            node_id: node_id.to_string(),
            branch: branch.to_string(),
            decided_at: Utc::now(),
        });
    }

    pub fn branch_taken(&self, branch: &str) -> bool {
        self.decision_path.iter().any(|b| b == branch)
    }

    /// The gate currently awaiting a decision
    pub fn pending_approval(&self) -> Option<&ApprovalRecord> {
        self.approvals.last().filter(|a| a.is_pending())
    }

    pub fn pending_approval_mut(&mut self) -> Option<&mut ApprovalRecord> {
        self.approvals.last_mut().filter(|a| a.is_pending())
    }

    /// Most recent approval record
    pub fn approval(&self) -> Option<&ApprovalRecord> {
        self.approvals.last()
    }
}
