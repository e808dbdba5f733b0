use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use strum::{Display, EnumString};
use tracing::{info, warn};
use uuid::Uuid;

use super::actions::{create_default_registry, ActionDispatcher};
use super::approval::{AllowAllAuthorizer, ApprovalDecision, ApprovalGate};
use super::orchestrator::Orchestrator;
use super::validation::{collect_issues, ValidationIssue};
use crate::config::{Config, HarnessConfig};
use crate::connectors::NoopConnectorRegistry;
use crate::error::{AppError, Result};
use crate::models::{
    ActionStatus, ActionType, Execution, ExecutionMode, ExecutionStatus, Playbook,
    TriggerDescriptor,
};
use crate::state::create_in_memory_store;

/// How deeply the harness exercises a playbook
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HarnessMode {
    /// Structure plus handler parameter checks, nothing dispatched
    DryRun,
    /// Structure checks only
    Validation,
    /// Full orchestrated run with synthetic outputs
    Simulation,
    /// Simulation plus timing and complexity analysis
    Performance,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    /// Classify by action count and branching factor (decision branches plus conditional actions)
    pub fn classify(playbook: &Playbook) -> Self {
        let actions = playbook.actions.len();
        let branching = branching_factor(playbook);

        if actions > 15 || branching > 6 {
            Complexity::High
        } else if actions <= 5 && branching <= 2 {
            Complexity::Low
        } else {
            Complexity::Medium
        }
    }
}

fn branching_factor(playbook: &Playbook) -> usize {
    playbook.branch_count() + playbook.actions.iter().filter(|a| a.condition.is_some()).count()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionTiming {
    pub action_id: String,
    pub action_type: ActionType,
    pub status: ActionStatus,
    pub duration_ms: i64,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceReport {
    pub wall_clock_ms: u128,
    pub execution_duration_ms: Option<i64>,
    pub action_count: usize,
    pub branching_factor: usize,
    pub complexity: Complexity,
    pub mean_action_ms: f64,
    pub timings: Vec<ActionTiming>,
    /// Actions slower than the configured multiple of the mean
    pub bottlenecks: Vec<ActionTiming>,
    pub total_retries: u32,
}

/// Outcome of one harness run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessReport {
    pub playbook_id: Uuid,
    pub playbook_name: String,
    pub mode: HarnessMode,
    pub passed: bool,
    pub issues: Vec<ValidationIssue>,
    /// Action ids in dispatch order
    pub plan: Vec<String>,
    pub execution: Option<Execution>,
    pub approvals_granted: u32,
    pub performance: Option<PerformanceReport>,
}

impl HarnessReport {
    fn new(playbook: &Playbook, mode: HarnessMode, issues: Vec<ValidationIssue>) -> Self {
        Self {
            playbook_id: playbook.id,
            playbook_name: playbook.name.clone(),
            mode,
            passed: !issues.iter().any(ValidationIssue::is_error),
            issues,
            plan: playbook.ordered_actions().into_iter().map(|a| a.id).collect(),
            execution: None,
            approvals_granted: 0,
            performance: None,
        }
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.is_error())
    }
}

/// Exercises playbooks without live side effects.
///
/// Simulation runs go through the regular orchestrator; approval gates are resolved
/// automatically by the configured harness principal.
pub struct TestHarness {
    orchestrator: Arc<Orchestrator>,
    config: HarnessConfig,
}

impl TestHarness {
    pub fn new(orchestrator: Arc<Orchestrator>, config: HarnessConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Harness over a private in-memory engine with no connectors and an allow-all authorizer
    pub fn in_memory(config: &Config) -> Self {
        let registry = create_default_registry(Arc::new(NoopConnectorRegistry), &config.engine);
        let gate = ApprovalGate::new(Arc::new(AllowAllAuthorizer), config.approval.timeout());
        let stores = create_in_memory_store();
        let orchestrator = Orchestrator::new(
            Arc::new(ActionDispatcher::new(registry)),
            Arc::new(gate),
            stores.executions,
            config,
        );
        Self::new(Arc::new(orchestrator), config.harness.clone())
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub async fn run(
        &self,
        playbook: &Playbook,
        trigger: TriggerDescriptor,
        mode: HarnessMode,
    ) -> Result<HarnessReport> {
        info!(playbook = %playbook.name, mode = %mode, "Running playbook harness");

        match mode {
            HarnessMode::Validation => Ok(self.validate(playbook)),
            HarnessMode::DryRun => Ok(self.dry_run(playbook)),
            HarnessMode::Simulation => self.simulate(playbook, trigger).await,
            HarnessMode::Performance => self.performance(playbook, trigger).await,
        }
    }

    pub fn validate(&self, playbook: &Playbook) -> HarnessReport {
        HarnessReport::new(
            playbook,
            HarnessMode::Validation,
            collect_issues(playbook, None),
        )
    }

    pub fn dry_run(&self, playbook: &Playbook) -> HarnessReport {
        let registry = self.orchestrator.dispatcher().registry();
        HarnessReport::new(
            playbook,
            HarnessMode::DryRun,
            collect_issues(playbook, Some(registry)),
        )
    }

    pub async fn simulate(
        &self,
        playbook: &Playbook,
        trigger: TriggerDescriptor,
    ) -> Result<HarnessReport> {
        let mut report = self.dry_run(playbook);
        report.mode = HarnessMode::Simulation;
        if !report.passed {
            return Ok(report);
        }

        let (execution, approvals) = self.drive_to_completion(playbook, trigger).await?;
        report.passed = execution.status == ExecutionStatus::Completed;
        report.approvals_granted = approvals;
        report.execution = Some(execution);
        Ok(report)
    }

    pub async fn performance(
        &self,
        playbook: &Playbook,
        trigger: TriggerDescriptor,
    ) -> Result<HarnessReport> {
        let started = Instant::now();
        let mut report = self.simulate(playbook, trigger).await?;
        report.mode = HarnessMode::Performance;

        if let Some(execution) = &report.execution {
            let performance =
                analyze(playbook, execution, self.config.bottleneck_factor, started.elapsed().as_millis());
            if !performance.bottlenecks.is_empty() {
                warn!(
                    playbook = %playbook.name,
                    bottlenecks = performance.bottlenecks.len(),
                    "Slow actions detected"
                );
            }
            report.performance = Some(performance);
        }
        Ok(report)
    }

    async fn drive_to_completion(
        &self,
        playbook: &Playbook,
        trigger: TriggerDescriptor,
    ) -> Result<(Execution, u32)> {
        let mut execution = self
            .orchestrator
            .execute(playbook, trigger, ExecutionMode::Simulation)
            .await?;
        let mut approvals = 0u32;

        while execution.status == ExecutionStatus::AwaitingApproval {
            if approvals as usize > playbook.actions.len() {
                return Err(AppError::Internal(format!(
                    "execution {} requested more approvals than it has actions",
                    execution.id
                )));
            }

            let decision = ApprovalDecision::approve(&self.config.approver)
                .with_reason("auto-approved by test harness");
            self.orchestrator.resume(execution.id, decision).await?;
            approvals += 1;
            execution = self.orchestrator.wait_until_settled(execution.id).await?;
        }

        Ok((execution, approvals))
    }
}

fn analyze(
    playbook: &Playbook,
    execution: &Execution,
    bottleneck_factor: f64,
    wall_clock_ms: u128,
) -> PerformanceReport {
    let timings: Vec<ActionTiming> = execution
        .action_results
        .iter()
        .filter(|r| r.started_at.is_some())
        .map(|r| ActionTiming {
            action_id: r.action_id.clone(),
            action_type: r.action_type,
            status: r.status,
            duration_ms: r.duration_ms.unwrap_or(0),
            retry_count: r.retry_count,
        })
        .collect();

    let mean_action_ms = if timings.is_empty() {
        0.0
    } else {
        timings.iter().map(|t| t.duration_ms as f64).sum::<f64>() / timings.len() as f64
    };

    let bottlenecks = timings
        .iter()
        .filter(|t| t.duration_ms > 0 && t.duration_ms as f64 > mean_action_ms * bottleneck_factor)
        .cloned()
        .collect();

    PerformanceReport {
        wall_clock_ms,
        execution_duration_ms: execution.duration_ms,
        action_count: playbook.actions.len(),
        branching_factor: branching_factor(playbook),
        complexity: Complexity::classify(playbook),
        mean_action_ms,
        total_retries: timings.iter().map(|t| t.retry_count).sum(),
        timings,
        bottlenecks,
    }
}
