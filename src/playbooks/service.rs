use futures::future::join_all;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::connectors::ConnectorRegistry;
use crate::error::{AppError, Result};
use crate::models::{Execution, ExecutionMode, ExecutionStatus, Playbook, TriggerDescriptor};
use crate::playbooks::{
    create_default_registry, load_playbook_dir, validate_playbook, ActionDispatcher,
    AllowAllAuthorizer, ApprovalDecision, ApprovalGate, Authorizer, DecisionEvaluator,
    ExecutionContext, ExecutionHandle, Orchestrator, StaticRoleAuthorizer,
};
use crate::state::{create_store, ExecutionFilter, ExecutionStore, PlaybookStore};

/// Playbook service manages playbook storage and execution
pub struct PlaybookService {
    orchestrator: Arc<Orchestrator>,

    /// Versioned playbook definitions
    playbooks: Arc<dyn PlaybookStore>,

    evaluator: DecisionEvaluator,

    /// Background approval sweeper, aborted when the service is dropped
    sweeper: Option<JoinHandle<()>>,
}

impl PlaybookService {
    pub fn new(orchestrator: Arc<Orchestrator>, playbooks: Arc<dyn PlaybookStore>) -> Self {
        Self {
            orchestrator,
            playbooks,
            evaluator: DecisionEvaluator::new(),
            sweeper: None,
        }
    }

    /// Expire overdue approval gates every `interval` until the service is dropped.
    ///
    /// Replaces a sweeper that is already running. Must be called inside a Tokio runtime.
    pub fn start_background_tasks(&mut self, interval: Duration) {
        if let Some(previous) = self.sweeper.take() {
            previous.abort();
        }
        info!(interval_secs = interval.as_secs_f64(), "Starting approval sweeper");
        self.sweeper = Some(self.orchestrator.spawn_approval_sweeper(interval));
    }

    /// Wire stores, handlers, approval gate and orchestrator from configuration
    pub fn from_config(config: &Config, connectors: Arc<dyn ConnectorRegistry>) -> Result<Self> {
        let stores = create_store(&config.state)?;

        let authorizer: Arc<dyn Authorizer> = if config.approval.principals.is_empty() {
            warn!("No approval principals configured; every principal may resolve role-restricted gates");
            Arc::new(AllowAllAuthorizer)
        } else {
            Arc::new(StaticRoleAuthorizer::from_map(&config.approval.principals))
        };

        let registry = create_default_registry(connectors, &config.engine);
        let orchestrator = Orchestrator::new(
            Arc::new(ActionDispatcher::new(registry)),
            Arc::new(ApprovalGate::new(authorizer, config.approval.timeout())),
            stores.executions,
            config,
        );

        let mut service = Self::new(Arc::new(orchestrator), stores.playbooks);
        match (config.approval.sweep_interval(), Handle::try_current()) {
            (Some(interval), Ok(_)) => service.start_background_tasks(interval),
            (Some(_), Err(_)) => {
                warn!("No Tokio runtime available; approval gates expire only when swept explicitly")
            }
            (None, _) => info!("Approval sweeper disabled"),
        }
        Ok(service)
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn executions(&self) -> &Arc<dyn ExecutionStore> {
        self.orchestrator.store()
    }

    // ==================== Playbooks ====================

    /// Validate and store a playbook version
    pub async fn register_playbook(&self, playbook: Playbook) -> Result<()> {
        validate_playbook(&playbook, Some(self.orchestrator.dispatcher().registry()))?;

        info!(
            playbook_id = %playbook.id,
            playbook_name = %playbook.name,
            version = %playbook.version,
            "Registering playbook"
        );

        self.playbooks.save_playbook(&playbook).await
    }

    /// Register every playbook found in a directory
    pub async fn load_playbooks_from_dir(&self, dir: impl AsRef<Path>) -> Result<Vec<Uuid>> {
        let mut ids = Vec::new();
        for playbook in load_playbook_dir(dir)? {
            let id = playbook.id;
            self.register_playbook(playbook).await?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Get a playbook version, or the latest one
    pub async fn get_playbook(&self, id: &Uuid, version: Option<&str>) -> Result<Playbook> {
        self.playbooks
            .get_playbook(id, version)
            .await?
            .ok_or_else(|| match version {
                Some(v) => AppError::NotFound(format!("Playbook {} version {} not found", id, v)),
                None => AppError::NotFound(format!("Playbook {} not found", id)),
            })
    }

    pub async fn list_playbooks(&self) -> Result<Vec<Playbook>> {
        self.playbooks.list_playbooks().await
    }

    pub async fn delete_playbook(&self, id: &Uuid) -> Result<()> {
        self.playbooks.delete_playbook(id).await
    }

    /// Enabled playbooks whose trigger conditions all hold for a trigger.
    ///
    /// Playbooks without trigger conditions only run when started explicitly.
    pub async fn find_matching_playbooks(&self, trigger: &TriggerDescriptor) -> Result<Vec<Playbook>> {
        let matching = self
            .playbooks
            .list_playbooks()
            .await?
            .into_iter()
            .filter(|playbook| playbook.enabled && !playbook.trigger_conditions.is_empty())
            .filter(|playbook| {
                let context = ExecutionContext::seed(playbook, trigger);
                playbook
                    .trigger_conditions
                    .iter()
                    .all(|condition| self.evaluator.evaluate(condition, &context))
            })
            .collect();
        Ok(matching)
    }

    // ==================== Executions ====================

    /// Start an execution on a background worker
    pub async fn start_execution(
        &self,
        playbook_id: Uuid,
        version: Option<&str>,
        trigger: TriggerDescriptor,
        mode: ExecutionMode,
    ) -> Result<ExecutionHandle> {
        let playbook = self.get_playbook(&playbook_id, version).await?;

        info!(
            playbook_id = %playbook_id,
            version = %playbook.version,
            trigger_source = %trigger.source,
            mode = %mode,
            "Starting playbook execution"
        );

        self.orchestrator.start(&playbook, trigger, mode).await
    }

    /// Run an execution on the calling task until it completes or suspends
    pub async fn run_execution(
        &self,
        playbook_id: Uuid,
        version: Option<&str>,
        trigger: TriggerDescriptor,
        mode: ExecutionMode,
    ) -> Result<Execution> {
        let playbook = self.get_playbook(&playbook_id, version).await?;
        self.orchestrator.execute(&playbook, trigger, mode).await
    }

    /// Start every matching playbook for a trigger
    pub async fn auto_execute(
        &self,
        trigger: &TriggerDescriptor,
        mode: ExecutionMode,
    ) -> Result<Vec<ExecutionHandle>> {
        let matching = self.find_matching_playbooks(trigger).await?;

        if matching.is_empty() {
            info!(
                trigger_source = %trigger.source,
                trigger_type = %trigger.trigger_type,
                "No matching playbooks found for trigger"
            );
            return Ok(Vec::new());
        }

        info!(
            trigger_source = %trigger.source,
            playbook_count = matching.len(),
            "Found matching playbooks for auto-execution"
        );

        let started = join_all(
            matching
                .iter()
                .map(|playbook| self.orchestrator.start(playbook, trigger.clone(), mode)),
        )
        .await;

        let mut handles = Vec::new();
        for (playbook, result) in matching.iter().zip(started) {
            match result {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!(
                        playbook_id = %playbook.id,
                        error = %e,
                        "Failed to auto-execute playbook"
                    );
                }
            }
        }

        Ok(handles)
    }

    pub async fn get_execution(&self, id: Uuid) -> Result<Execution> {
        self.orchestrator.get_status(id).await
    }

    pub async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<Execution>> {
        self.executions().list_executions(filter).await
    }

    pub async fn wait_for_execution(&self, id: Uuid) -> Result<Execution> {
        self.orchestrator.wait_until_settled(id).await
    }

    pub async fn cancel_execution(&self, id: Uuid) -> Result<()> {
        self.orchestrator.cancel(id).await
    }

    /// Approve or reject the pending gate of an execution
    pub async fn resolve_approval(
        &self,
        id: Uuid,
        approved: bool,
        approver: impl Into<String>,
        reason: Option<String>,
    ) -> Result<Execution> {
        let decision = ApprovalDecision {
            approved,
            approver: approver.into(),
            reason,
        };
        self.orchestrator.resume(id, decision).await
    }

    /// Get service statistics
    pub async fn get_stats(&self) -> Result<PlaybookServiceStats> {
        let playbooks = self.playbooks.list_playbooks().await?;
        let executions = self
            .executions()
            .list_executions(&ExecutionFilter::default())
            .await?;

        let count = |status: ExecutionStatus| executions.iter().filter(|e| e.status == status).count();

        Ok(PlaybookServiceStats {
            total_playbooks: playbooks.len(),
            enabled_playbooks: playbooks.iter().filter(|p| p.enabled).count(),
            total_executions: executions.len(),
            successful_executions: count(ExecutionStatus::Completed),
            failed_executions: count(ExecutionStatus::Failed),
            cancelled_executions: count(ExecutionStatus::Cancelled),
            awaiting_approval: count(ExecutionStatus::AwaitingApproval),
            active_workers: self.orchestrator.active_workers(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaybookServiceStats {
    pub total_playbooks: usize,
    pub enabled_playbooks: usize,
    pub total_executions: usize,
    pub successful_executions: usize,
    pub failed_executions: usize,
    pub cancelled_executions: usize,
    pub awaiting_approval: usize,
    pub active_workers: usize,
}

impl Drop for PlaybookService {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

/// Build a trigger from a raw alert payload, reading `source` and `type` fields when present
pub fn trigger_from_payload(payload: JsonValue) -> TriggerDescriptor {
    let source = payload
        .get("source")
        .and_then(|v| v.as_str())
        .unwrap_or("api")
        .to_string();
    let trigger_type = payload
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("alert")
        .to_string();
    TriggerDescriptor::new(source, trigger_type, payload)
}
