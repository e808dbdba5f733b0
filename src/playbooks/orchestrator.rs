use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::actions::{ActionDispatcher, DispatchRequest};
use super::approval::{ApprovalDecision, ApprovalGate, PendingApproval};
use super::context::ExecutionContext;
use super::decision::DecisionEvaluator;
use super::error::ActionError;
use super::events::{ExecutionEvent, ExecutionEventBus};
use super::retry::RetryPolicy;
use super::validation::validate_playbook;
use crate::config::{Config, EngineConfig};
use crate::error::{AppError, Result};
use crate::metrics::{
    ACTIONS_TOTAL, ACTION_DURATION_SECONDS, ACTION_RETRIES_TOTAL, APPROVALS_RESOLVED_TOTAL,
    ERRORS_TOTAL, EXECUTIONS_ACTIVE, EXECUTIONS_TOTAL, EXECUTION_DURATION_SECONDS,
};
use crate::models::{
    ActionStatus, ActionType, ApprovalRecord, Execution, ExecutionMode, ExecutionStatus,
    OnErrorPolicy, Playbook, PlaybookAction, TriggerDescriptor,
};
use crate::state::{ExecutionFilter, ExecutionStore};

/// Caller-side view of a started execution
pub struct ExecutionHandle {
    execution_id: Uuid,
    status: watch::Receiver<ExecutionStatus>,
}

impl ExecutionHandle {
    pub fn id(&self) -> Uuid {
        self.execution_id
    }

    /// Last status published by the worker
    pub fn status(&self) -> ExecutionStatus {
        *self.status.borrow()
    }

    /// Wait until the execution is terminal or suspended for approval
    pub async fn settled(&mut self) -> ExecutionStatus {
        loop {
            let current = *self.status.borrow_and_update();
            if current.is_settled() {
                return current;
            }
            if self.status.changed().await.is_err() {
                return *self.status.borrow();
            }
        }
    }
}

/// What `recover` did with unfinished executions found in the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Queued executions handed to a new worker
    pub resumed: Vec<Uuid>,
    /// Executions that were running when the engine stopped; now failed
    pub interrupted: Vec<Uuid>,
    /// Approval gates re-registered from their records
    pub restored_approvals: Vec<Uuid>,
}

/// Drives executions through their actions.
///
/// Every execution has at most one worker at a time. A worker claims the execution, walks the
/// actions from the cursor, and releases the claim when the execution is terminal or suspended
/// at an approval gate. Each step is persisted before the next one starts.
pub struct Orchestrator {
    dispatcher: Arc<ActionDispatcher>,
    gate: Arc<ApprovalGate>,
    store: Arc<dyn ExecutionStore>,
    evaluator: DecisionEvaluator,
    retry: RetryPolicy,
    events: ExecutionEventBus,
    engine: EngineConfig,
    workers: DashMap<Uuid, CancellationToken>,
    watchers: DashMap<Uuid, watch::Sender<ExecutionStatus>>,
}

impl Orchestrator {
    pub fn new(
        dispatcher: Arc<ActionDispatcher>,
        gate: Arc<ApprovalGate>,
        store: Arc<dyn ExecutionStore>,
        config: &Config,
    ) -> Self {
        Self {
            dispatcher,
            gate,
            store,
            evaluator: DecisionEvaluator::new(),
            retry: RetryPolicy::new(config.retry.clone()),
            events: ExecutionEventBus::new(config.engine.event_bus_capacity),
            engine: config.engine.clone(),
            workers: DashMap::new(),
            watchers: DashMap::new(),
        }
    }

    pub fn dispatcher(&self) -> &Arc<ActionDispatcher> {
        &self.dispatcher
    }

    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    /// Executions currently owned by a worker
    pub fn active_workers(&self) -> usize {
        self.workers.len()
    }

    // ==================== Entry Points ====================

    /// Create an execution and drive it on a background task
    pub async fn start(
        self: &Arc<Self>,
        playbook: &Playbook,
        trigger: TriggerDescriptor,
        mode: ExecutionMode,
    ) -> Result<ExecutionHandle> {
        let (execution, token) = self.prepare(playbook, trigger, mode).await?;
        let handle = self.handle_for(&execution);

        self.spawn_worker(execution, token);
        Ok(handle)
    }

    /// Create an execution and drive it on the calling task until it settles
    pub async fn execute(
        &self,
        playbook: &Playbook,
        trigger: TriggerDescriptor,
        mode: ExecutionMode,
    ) -> Result<Execution> {
        let (execution, token) = self.prepare(playbook, trigger, mode).await?;
        Ok(self.drive(execution, token).await)
    }

    /// Resolve the approval gate of a suspended execution.
    ///
    /// Approval hands the execution to a new worker; rejection fails it. Returns the execution
    /// as it stood right after the decision was recorded.
    pub async fn resume(
        self: &Arc<Self>,
        execution_id: Uuid,
        decision: ApprovalDecision,
    ) -> Result<Execution> {
        let token = self.claim(execution_id)?;

        let execution = match self.apply_decision(execution_id, &decision).await {
            Ok(execution) => execution,
            Err(err) => {
                self.release(execution_id);
                return Err(err);
            }
        };

        if execution.status == ExecutionStatus::Running {
            self.watchers
                .entry(execution_id)
                .or_insert_with(|| watch::channel(execution.status).0)
                .send_replace(execution.status);

            self.spawn_worker(execution.clone(), token);
        }

        Ok(execution)
    }

    /// Request cancellation.
    ///
    /// A running worker observes the request at its next action boundary or retry backoff.
    /// Executions with no worker (queued or awaiting approval) are cancelled immediately.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<()> {
        if self.signal_worker(execution_id) {
            return Ok(());
        }

        if self.claim(execution_id).is_err() {
            // a worker claimed it in the meantime
            self.signal_worker(execution_id);
            return Ok(());
        }

        let result = self.cancel_idle(execution_id).await;
        if result.is_err() {
            self.release(execution_id);
        }
        result
    }

    pub async fn get_status(&self, execution_id: Uuid) -> Result<Execution> {
        self.load(execution_id).await
    }

    /// Wait until an execution is terminal or awaiting approval, then return it
    pub async fn wait_until_settled(&self, execution_id: Uuid) -> Result<Execution> {
        let receiver = self.watchers.get(&execution_id).map(|tx| tx.subscribe());

        if let Some(mut rx) = receiver {
            loop {
                if rx.borrow_and_update().is_settled() {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }

        self.load(execution_id).await
    }

    /// Fail every execution whose approval deadline has passed
    pub async fn sweep_approval_timeouts(&self) -> Vec<Uuid> {
        let mut expired = Vec::new();

        for pending in self.gate.take_expired(Utc::now()) {
            let id = pending.execution_id;
            if self.claim(id).is_err() {
                debug!(execution_id = %id, "Skipping expired gate of a busy execution");
                continue;
            }

            match self.expire_claimed(id).await {
                Ok(true) => expired.push(id),
                Ok(false) => self.release(id),
                Err(err) => {
                    self.release(id);
                    error!(execution_id = %id, error = %err, "Failed to expire approval gate");
                }
            }
        }

        expired
    }

    /// Run the approval sweeper on a fixed interval until the task is aborted
    pub fn spawn_approval_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let expired = this.sweep_approval_timeouts().await;
                if !expired.is_empty() {
                    info!(count = expired.len(), "Approval gates expired");
                }
            }
        })
    }

    /// Pick up unfinished executions after a restart
    pub async fn recover(self: &Arc<Self>) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for mut execution in self.store.list_executions(&ExecutionFilter::unfinished()).await? {
            let id = execution.id;
            if self.workers.contains_key(&id) {
                continue;
            }
            self.watchers
                .entry(id)
                .or_insert_with(|| watch::channel(execution.status).0);

            let status = execution.status;
            match status {
                ExecutionStatus::AwaitingApproval => match pending_from_record(&execution) {
                    Some(pending) => {
                        self.gate.restore(pending);
                        report.restored_approvals.push(id);
                    }
                    None => warn!(execution_id = %id, "Suspended execution has no pending approval record"),
                },
                ExecutionStatus::Queued => {
                    let token = self.claim(id)?;
                    self.spawn_worker(execution, token);
                    report.resumed.push(id);
                }
                ExecutionStatus::Running => {
                    self.claim(id)?;
                    execution
                        .errors
                        .push("interrupted by engine restart".to_string());
                    self.finish(&mut execution, ExecutionStatus::Failed, "interrupted by engine restart")
                        .await?;
                    report.interrupted.push(id);
                }
                _ => {}
            }
        }

        info!(
            resumed = report.resumed.len(),
            interrupted = report.interrupted.len(),
            restored_approvals = report.restored_approvals.len(),
            "Recovery complete"
        );
        Ok(report)
    }

    // ==================== Worker ====================

    async fn prepare(
        &self,
        playbook: &Playbook,
        trigger: TriggerDescriptor,
        mode: ExecutionMode,
    ) -> Result<(Execution, CancellationToken)> {
        validate_playbook(playbook, Some(self.dispatcher.registry()))?;
        if mode == ExecutionMode::Live && !playbook.enabled {
            return Err(AppError::Validation(format!(
                "playbook '{}' is disabled",
                playbook.name
            )));
        }

        let mut execution = Execution::new(playbook, trigger, mode);
        execution.context = ExecutionContext::seed(&execution.playbook, &execution.trigger).snapshot();
        self.store.create_execution(&execution).await?;

        self.watchers
            .insert(execution.id, watch::channel(execution.status).0);
        let token = self.claim(execution.id)?;

        info!(
            execution_id = %execution.id,
            playbook_id = %playbook.id,
            playbook = %playbook.name,
            mode = %mode,
            "Execution queued"
        );
        Ok((execution, token))
    }

    /// Drive an execution on a background task that fails it if the worker panics
    fn spawn_worker(self: &Arc<Self>, execution: Execution, token: CancellationToken) {
        let this = Arc::clone(self);
        let execution_id = execution.id;
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(this.drive(execution, token))
                .catch_unwind()
                .await;
            if outcome.is_err() {
                this.abandon(execution_id).await;
            }
        });
    }

    /// Fail an execution from its last persisted state after its worker panicked
    async fn abandon(&self, execution_id: Uuid) {
        error!(execution_id = %execution_id, "Execution worker panicked");
        ERRORS_TOTAL
            .with_label_values(&["INTERNAL_ERROR", "orchestrator"])
            .inc();

        let failed = match self.load(execution_id).await {
            Ok(mut execution) if !execution.status.is_settled() => {
                execution.errors.push("engine error: worker panicked".to_string());
                let picked_up = if execution.status == ExecutionStatus::Queued {
                    execution.transition_to(ExecutionStatus::Running, "picked up by worker")
                } else {
                    Ok(())
                };
                match picked_up {
                    Ok(()) => {
                        self.finish(&mut execution, ExecutionStatus::Failed, "worker panicked")
                            .await
                    }
                    Err(err) => Err(err),
                }
            }
            Ok(_) => Ok(()),
            Err(err) => Err(err),
        };

        if let Err(err) = failed {
            error!(execution_id = %execution_id, error = %err, "Failed to record panicked execution");
        }
        self.release(execution_id);
        // dropping the sender wakes anyone still waiting on the execution
        self.watchers.remove(&execution_id);
    }

    async fn drive(&self, mut execution: Execution, token: CancellationToken) -> Execution {
        if let Err(err) = self.advance(&mut execution, &token).await {
            error!(execution_id = %execution.id, error = %err, "Execution aborted by engine error");
            ERRORS_TOTAL
                .with_label_values(&[err.error_code(), "orchestrator"])
                .inc();

            if !execution.status.is_settled() {
                execution.errors.push(format!("engine error: {}", err));
                if let Err(finish_err) = self
                    .finish(&mut execution, ExecutionStatus::Failed, "engine error")
                    .await
                {
                    error!(
                        execution_id = %execution.id,
                        error = %finish_err,
                        "Failed to record execution failure"
                    );
                    self.release(execution.id);
                    self.notify(&execution);
                }
            }
        }
        execution
    }

    async fn advance(&self, execution: &mut Execution, token: &CancellationToken) -> Result<()> {
        if execution.status == ExecutionStatus::Queued {
            if token.is_cancelled() {
                return self
                    .finish(execution, ExecutionStatus::Cancelled, "cancelled before start")
                    .await;
            }
            execution.transition_to(ExecutionStatus::Running, "picked up by worker")?;
            self.persist(execution).await?;
            self.events.publish(ExecutionEvent::Started {
                execution_id: execution.id,
                playbook_id: execution.playbook_id,
                mode: execution.mode,
            });
            info!(execution_id = %execution.id, "Execution started");
        }

        let mut context = ExecutionContext::from_snapshot(&execution.context)?;

        while let Some(action) = execution.current_action().cloned() {
            if token.is_cancelled() {
                return self
                    .finish(
                        execution,
                        ExecutionStatus::Cancelled,
                        "cancellation observed between actions",
                    )
                    .await;
            }

            if let Some(reason) = self.skip_reason(execution, &action, &context) {
                debug!(
                    execution_id = %execution.id,
                    action_id = %action.id,
                    reason = %reason,
                    "Skipping action"
                );
                execution.reach(&action).skip(reason, None)?;
                observe_action(action.action_type, ActionStatus::Skipped);
                self.step(execution, &context).await?;
                continue;
            }

            if self.needs_gate(execution, &action) {
                return self.suspend(execution, &action).await;
            }

            if !self.dispatch_action(execution, &action, &mut context, token).await? {
                return Ok(());
            }
            self.step(execution, &context).await?;
        }

        self.finish(execution, ExecutionStatus::Completed, "all actions resolved")
            .await
    }

    /// Dispatch one action with retries and apply its on-error policy.
    ///
    /// Returns `false` when the execution was finished and the worker must stop.
    async fn dispatch_action(
        &self,
        execution: &mut Execution,
        action: &PlaybookAction,
        context: &mut ExecutionContext,
        token: &CancellationToken,
    ) -> Result<bool> {
        let approval = execution
            .approvals
            .last()
            .filter(|a| a.action_id == action.id && a.approved == Some(true))
            .cloned();
        execution.approved_action = None;
        execution.reach(action).start()?;
        self.persist(execution).await?;

        let started = Instant::now();
        let budget = action
            .timeout()
            .unwrap_or_else(|| self.engine.default_action_timeout());
        let execution_id = execution.id;
        let mode = execution.mode;
        let dispatcher: &ActionDispatcher = &self.dispatcher;
        let ctx: &ExecutionContext = context;
        let approval_ref = approval.as_ref();

        let outcome = self
            .retry
            .invoke(
                move |attempt| {
                    dispatcher.dispatch(DispatchRequest {
                        execution_id,
                        action,
                        context: ctx,
                        mode,
                        attempt,
                        approval: approval_ref,
                    })
                },
                &action.retry,
                budget,
                token,
            )
            .await;

        let retry_count = outcome.retry_count();
        let type_label = action.action_type.to_string();
        ACTION_DURATION_SECONDS
            .with_label_values(&[&type_label])
            .observe(started.elapsed().as_secs_f64());
        if retry_count > 0 {
            ACTION_RETRIES_TOTAL
                .with_label_values(&[&type_label])
                .inc_by(f64::from(retry_count));
        }

        match outcome.result {
            Ok(output) => {
                context.record_output(&action.id, output.clone())?;
                execution.reach(action).complete(output, retry_count)?;
                observe_action(action.action_type, ActionStatus::Completed);
                info!(
                    execution_id = %execution.id,
                    action_id = %action.id,
                    retries = retry_count,
                    "Action completed"
                );

                if let Some(decision) = &action.decision {
                    match self.evaluator.choose_branch(decision, context) {
                        Some(branch) => {
                            info!(
                                execution_id = %execution.id,
                                node = %action.id,
                                branch = %branch,
                                "Decision branch taken"
                            );
                            execution.record_decision(&action.id, branch);
                        }
                        None => debug!(
                            execution_id = %execution.id,
                            node = %action.id,
                            "No decision branch matched"
                        ),
                    }
                }
                Ok(true)
            }
            Err(ActionError::Cancelled) => {
                execution
                    .reach(action)
                    .fail("cancelled while waiting to retry", retry_count)?;
                observe_action(action.action_type, ActionStatus::Failed);
                self.finish(
                    execution,
                    ExecutionStatus::Cancelled,
                    "cancellation observed during retry backoff",
                )
                .await?;
                Ok(false)
            }
            Err(err) => {
                let message = format!("action {} failed: {}", action.id, err);
                warn!(
                    execution_id = %execution.id,
                    action_id = %action.id,
                    on_error = %action.on_error,
                    retries = retry_count,
                    error = %err,
                    "Action failed"
                );

                match action.on_error {
                    OnErrorPolicy::Fail => {
                        execution.reach(action).fail(err.to_string(), retry_count)?;
                        observe_action(action.action_type, ActionStatus::Failed);
                        execution.errors.push(message);
                        self.finish(
                            execution,
                            ExecutionStatus::Failed,
                            &format!("action {} failed", action.id),
                        )
                        .await?;
                        Ok(false)
                    }
                    OnErrorPolicy::Continue => {
                        execution.reach(action).fail(err.to_string(), retry_count)?;
                        observe_action(action.action_type, ActionStatus::Failed);
                        execution.errors.push(message);
                        Ok(true)
                    }
                    OnErrorPolicy::Skip => {
                        let result = execution.reach(action);
                        result.set_retry_count(retry_count);
                        result.skip("failed with on_error=skip", Some(err.to_string()))?;
                        observe_action(action.action_type, ActionStatus::Skipped);
                        Ok(true)
                    }
                }
            }
        }
    }

    fn skip_reason(
        &self,
        execution: &Execution,
        action: &PlaybookAction,
        context: &ExecutionContext,
    ) -> Option<String> {
        if let Some(branch) = &action.branch {
            if !execution.branch_taken(branch) {
                return Some(format!("branch '{}' not taken", branch));
            }
        }
        if let Some(condition) = &action.condition {
            if !self.evaluator.evaluate(condition, context) {
                return Some("condition not met".to_string());
            }
        }
        None
    }

    fn needs_gate(&self, execution: &Execution, action: &PlaybookAction) -> bool {
        if execution.approved_action.as_deref() == Some(action.id.as_str()) {
            return false;
        }
        if action.needs_approval() {
            return true;
        }
        execution.playbook.requires_upfront_approval()
            && !execution.approvals.iter().any(|a| a.approved == Some(true))
    }

    async fn suspend(&self, execution: &mut Execution, action: &PlaybookAction) -> Result<()> {
        let roles = execution.playbook.approval_roles();
        let timeout = execution
            .playbook
            .approval
            .as_ref()
            .and_then(|a| a.timeout_secs)
            .map(Duration::from_secs);

        let pending = self
            .gate
            .request_approval(execution.id, &action.id, roles.clone(), timeout);

        execution.reach(action);
        execution.approvals.push(ApprovalRecord {
            action_id: action.id.clone(),
            required: true,
            approval_roles: roles.clone(),
            requested_at: pending.requested_at,
            deadline: pending.deadline,
            approved: None,
            approver: None,
            decided_at: None,
            reason: None,
        });
        execution.transition_to(
            ExecutionStatus::AwaitingApproval,
            format!("action {} requires approval", action.id),
        )?;
        execution.refresh_counters();

        info!(
            execution_id = %execution.id,
            action_id = %action.id,
            roles = ?roles,
            "Execution awaiting approval"
        );
        self.settle(execution).await?;

        self.events.publish(ExecutionEvent::ApprovalRequested {
            execution_id: execution.id,
            action_id: action.id.clone(),
            roles,
            deadline: pending.deadline,
        });
        Ok(())
    }

    async fn step(&self, execution: &mut Execution, context: &ExecutionContext) -> Result<()> {
        execution.cursor += 1;
        execution.context = context.snapshot();
        execution.refresh_counters();
        self.persist(execution).await
    }

    /// Move to a terminal state, recording every unresolved action as skipped
    async fn finish(
        &self,
        execution: &mut Execution,
        status: ExecutionStatus,
        reason: &str,
    ) -> Result<()> {
        if status != ExecutionStatus::Completed {
            let unreached = format!("not reached: execution {}", status);
            for result in execution.action_results.iter_mut() {
                match result.status {
                    ActionStatus::Pending => result.skip(unreached.clone(), None)?,
                    ActionStatus::Running => {
                        let retries = result.retry_count;
                        result.fail("interrupted", retries)?;
                    }
                    _ => {}
                }
            }

            let remaining: Vec<PlaybookAction> = execution
                .playbook
                .actions
                .iter()
                .filter(|a| execution.result(&a.id).is_none())
                .cloned()
                .collect();
            for action in &remaining {
                execution.reach(action).skip(unreached.clone(), None)?;
            }
        }

        execution.refresh_counters();
        execution.transition_to(status, reason)?;
        self.gate.withdraw(execution.id);

        let mode = execution.mode.to_string();
        EXECUTIONS_TOTAL
            .with_label_values(&[&mode, &status.to_string()])
            .inc();
        if let Some(ms) = execution.duration_ms {
            EXECUTION_DURATION_SECONDS
                .with_label_values(&[&mode])
                .observe(ms as f64 / 1000.0);
        }

        info!(
            execution_id = %execution.id,
            status = %status,
            successful = execution.successful_actions,
            failed = execution.failed_actions,
            skipped = execution.skipped_actions,
            duration_ms = ?execution.duration_ms,
            "Execution finished"
        );

        let settled = self.settle(execution).await;
        self.events.publish(ExecutionEvent::finished(execution));
        settled
    }

    // ==================== Approvals ====================

    async fn apply_decision(
        &self,
        execution_id: Uuid,
        decision: &ApprovalDecision,
    ) -> Result<Execution> {
        let mut execution = self.load(execution_id).await?;
        if execution.status != ExecutionStatus::AwaitingApproval {
            return Err(AppError::InvalidStateTransition(format!(
                "execution {} is {}, not awaiting approval",
                execution_id, execution.status
            )));
        }

        if self.gate.get(execution_id).is_none() {
            if let Some(pending) = pending_from_record(&execution) {
                self.gate.restore(pending);
            }
        }

        let resolution = match self.gate.resolve(execution_id, decision) {
            Ok(resolution) => resolution,
            Err(AppError::ApprovalTimeout(msg)) => {
                self.expire(&mut execution).await?;
                return Err(AppError::ApprovalTimeout(msg));
            }
            Err(err) => return Err(err),
        };

        if let Some(record) = execution.pending_approval_mut() {
            record.approved = Some(decision.approved);
            record.approver = Some(decision.approver.clone());
            record.decided_at = Some(resolution.decided_at);
            record.reason = decision.reason.clone();
        }

        let action_id = resolution.pending.action_id;
        if decision.approved {
            APPROVALS_RESOLVED_TOTAL.with_label_values(&["approved"]).inc();
            execution.approved_action = Some(action_id.clone());
            execution.transition_to(
                ExecutionStatus::Running,
                format!("approval for {} granted by {}", action_id, decision.approver),
            )?;
            self.persist(&execution).await?;
        } else {
            APPROVALS_RESOLVED_TOTAL.with_label_values(&["rejected"]).inc();
            let message = match &decision.reason {
                Some(reason) => format!(
                    "approval for action {} rejected by {}: {}",
                    action_id, decision.approver, reason
                ),
                None => format!(
                    "approval for action {} rejected by {}",
                    action_id, decision.approver
                ),
            };
            if let Some(result) = execution.result_mut(&action_id) {
                if !result.status.is_terminal() {
                    result.fail(message.clone(), 0)?;
                }
            }
            execution.errors.push(message);
            self.finish(&mut execution, ExecutionStatus::Failed, "approval rejected")
                .await?;
        }

        Ok(execution)
    }

    /// Expire the gate of a claimed execution; `false` if it was no longer suspended
    async fn expire_claimed(&self, execution_id: Uuid) -> Result<bool> {
        let mut execution = self.load(execution_id).await?;
        if execution.status != ExecutionStatus::AwaitingApproval {
            return Ok(false);
        }
        self.expire(&mut execution).await?;
        Ok(true)
    }

    async fn expire(&self, execution: &mut Execution) -> Result<()> {
        APPROVALS_RESOLVED_TOTAL.with_label_values(&["expired"]).inc();

        let action_id = execution
            .pending_approval()
            .map(|a| a.action_id.clone())
            .unwrap_or_default();
        if let Some(record) = execution.pending_approval_mut() {
            record.approved = Some(false);
            record.decided_at = Some(Utc::now());
            record.reason = Some("approval timed out".to_string());
        }

        let message = format!("approval for action {} timed out", action_id);
        if let Some(result) = execution.result_mut(&action_id) {
            if !result.status.is_terminal() {
                result.fail(message.clone(), 0)?;
            }
        }
        execution.errors.push(message);

        warn!(execution_id = %execution.id, action_id = %action_id, "Approval timed out");
        self.finish(execution, ExecutionStatus::Failed, "approval timed out")
            .await
    }

    async fn cancel_idle(&self, execution_id: Uuid) -> Result<()> {
        let mut execution = self.load(execution_id).await?;
        if execution.status.is_terminal() {
            return Err(AppError::InvalidStateTransition(format!(
                "execution {} is already {}",
                execution_id, execution.status
            )));
        }

        if let Some(record) = execution.pending_approval_mut() {
            record.approved = Some(false);
            record.decided_at = Some(Utc::now());
            record.reason = Some("execution cancelled".to_string());
        }

        info!(execution_id = %execution_id, "Cancelling idle execution");
        self.finish(&mut execution, ExecutionStatus::Cancelled, "cancelled by request")
            .await
    }

    // ==================== Bookkeeping ====================

    fn claim(&self, execution_id: Uuid) -> Result<CancellationToken> {
        match self.workers.entry(execution_id) {
            Entry::Occupied(_) => Err(AppError::InvalidStateTransition(format!(
                "execution {} is already being driven by a worker",
                execution_id
            ))),
            Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(token.clone());
                EXECUTIONS_ACTIVE.inc();
                Ok(token)
            }
        }
    }

    fn release(&self, execution_id: Uuid) {
        if self.workers.remove(&execution_id).is_some() {
            EXECUTIONS_ACTIVE.dec();
        }
    }

    fn signal_worker(&self, execution_id: Uuid) -> bool {
        let token = self
            .workers
            .get(&execution_id)
            .map(|entry| entry.value().clone());
        match token {
            Some(token) => {
                token.cancel();
                info!(execution_id = %execution_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    fn handle_for(&self, execution: &Execution) -> ExecutionHandle {
        let status = match self.watchers.get(&execution.id) {
            Some(tx) => tx.subscribe(),
            None => watch::channel(execution.status).1,
        };
        ExecutionHandle {
            execution_id: execution.id,
            status,
        }
    }

    async fn load(&self, execution_id: Uuid) -> Result<Execution> {
        self.store
            .get_execution(&execution_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Execution {} not found", execution_id)))
    }

    async fn persist(&self, execution: &Execution) -> Result<()> {
        self.store.update_execution(execution).await?;
        self.notify(execution);
        Ok(())
    }

    /// Persist a terminal or suspended execution and give up the worker claim
    async fn settle(&self, execution: &Execution) -> Result<()> {
        let stored = self.store.update_execution(execution).await;
        self.release(execution.id);
        self.notify(execution);
        stored
    }

    fn notify(&self, execution: &Execution) {
        if execution.status.is_terminal() {
            if let Some((_, tx)) = self.watchers.remove(&execution.id) {
                tx.send_replace(execution.status);
            }
        } else if let Some(tx) = self.watchers.get(&execution.id) {
            tx.send_replace(execution.status);
        }
    }
}

fn pending_from_record(execution: &Execution) -> Option<PendingApproval> {
    execution.pending_approval().map(|record| PendingApproval {
        execution_id: execution.id,
        action_id: record.action_id.clone(),
        roles: record.approval_roles.clone(),
        requested_at: record.requested_at,
        deadline: record.deadline,
    })
}

fn observe_action(action_type: ActionType, status: ActionStatus) {
    ACTIONS_TOTAL
        .with_label_values(&[&action_type.to_string(), &status.to_string()])
        .inc();
}
