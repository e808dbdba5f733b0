mod common;

use common::*;
use serde_json::json;
use soar_engine::{
    models::{
        ActionStatus, ActionType, ApprovalRequirement, ExecutionMode, ExecutionStatus, Playbook,
        PlaybookAction, TriggerDescriptor,
    },
    playbooks::{ApprovalDecision, StaticRoleAuthorizer},
    AppError,
};
use std::sync::Arc;
use std::time::Duration;

fn gated_playbook() -> Playbook {
    Playbook::new(
        "Gated Containment",
        vec![ticket(1), block(2).requiring_approval(), notify(3)],
    )
}

#[tokio::test]
async fn test_execution_suspends_at_gate() {
    let connectors = ScriptedConnectors::new();
    let engine = engine(connectors.clone());

    let execution = engine
        .execute(&gated_playbook(), TriggerDescriptor::manual(alert_payload()), ExecutionMode::Live)
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::AwaitingApproval);
    assert_eq!(execution.result("ticket").unwrap().status, ActionStatus::Completed);
    assert_eq!(execution.result("block").unwrap().status, ActionStatus::Pending);
    assert!(execution.pending_approval().is_some());
    assert_eq!(engine.gate().pending_count(), 1);
    assert_eq!(connectors.call_count("block_ip"), 0);
    assert_eq!(engine.active_workers(), 0);
}

#[tokio::test]
async fn test_approved_gate_resumes_execution() {
    let connectors = ScriptedConnectors::new();
    let engine = engine(connectors.clone());

    let suspended = engine
        .execute(&gated_playbook(), TriggerDescriptor::manual(alert_payload()), ExecutionMode::Live)
        .await
        .unwrap();

    let resumed = engine
        .resume(suspended.id, ApprovalDecision::approve("alice"))
        .await
        .unwrap();
    assert_eq!(resumed.status, ExecutionStatus::Running);

    let execution = engine.wait_until_settled(suspended.id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.successful_actions, 3);
    assert_eq!(connectors.call_count("block_ip"), 1);
    assert_eq!(connectors.call_count("create_ticket"), 1);

    let record = &execution.approvals[0];
    assert_eq!(record.approved, Some(true));
    assert_eq!(record.approver.as_deref(), Some("alice"));
    assert!(record.decided_at.is_some());
    assert_eq!(engine.gate().pending_count(), 0);
}

#[tokio::test]
async fn test_rejected_gate_fails_execution() {
    let connectors = ScriptedConnectors::new();
    let engine = engine(connectors.clone());

    let suspended = engine
        .execute(&gated_playbook(), TriggerDescriptor::manual(alert_payload()), ExecutionMode::Live)
        .await
        .unwrap();

    let execution = engine
        .resume(
            suspended.id,
            ApprovalDecision::reject("bob", "customer-facing host"),
        )
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let block = execution.result("block").unwrap();
    assert_eq!(block.status, ActionStatus::Failed);
    assert!(block.error.as_deref().unwrap().contains("rejected by bob"));
    assert!(execution.errors[0].contains("customer-facing host"));
    assert_eq!(execution.result("notify").unwrap().status, ActionStatus::Skipped);
    assert!(execution.counters_balanced());
    assert_eq!(connectors.call_count("block_ip"), 0);
}

#[tokio::test]
async fn test_approver_needs_required_role() {
    let authorizer = Arc::new(StaticRoleAuthorizer::new());
    authorizer.grant("carol", "soc_lead");
    let engine = engine_with(ScriptedConnectors::new(), authorizer, &fast_config());

    let playbook = gated_playbook().with_approval(ApprovalRequirement {
        required: false,
        approval_roles: vec!["soc_lead".to_string()],
        timeout_secs: None,
    });
    let suspended = engine
        .execute(&playbook, TriggerDescriptor::manual(alert_payload()), ExecutionMode::Live)
        .await
        .unwrap();
    assert_eq!(suspended.approvals[0].approval_roles, vec!["soc_lead".to_string()]);

    let denied = engine
        .resume(suspended.id, ApprovalDecision::approve("mallory"))
        .await;
    assert!(matches!(denied, Err(AppError::Authorization(_))));

    // the gate survives an unauthorized attempt
    let still = engine.get_status(suspended.id).await.unwrap();
    assert_eq!(still.status, ExecutionStatus::AwaitingApproval);

    engine
        .resume(suspended.id, ApprovalDecision::approve("carol"))
        .await
        .unwrap();
    let execution = engine.wait_until_settled(suspended.id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_expired_gate_is_swept() {
    let engine = engine(ScriptedConnectors::new());
    let playbook = gated_playbook().with_approval(ApprovalRequirement {
        required: false,
        approval_roles: Vec::new(),
        timeout_secs: Some(0),
    });

    let suspended = engine
        .execute(&playbook, TriggerDescriptor::manual(alert_payload()), ExecutionMode::Live)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let expired = engine.sweep_approval_timeouts().await;
    assert_eq!(expired, vec![suspended.id]);

    let execution = engine.get_status(suspended.id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.errors[0].contains("timed out"));
    assert_eq!(execution.approvals[0].approved, Some(false));
    assert!(engine.sweep_approval_timeouts().await.is_empty());
}

#[tokio::test]
async fn test_late_resolution_reports_timeout() {
    let engine = engine(ScriptedConnectors::new());
    let playbook = gated_playbook().with_approval(ApprovalRequirement {
        required: false,
        approval_roles: Vec::new(),
        timeout_secs: Some(0),
    });

    let suspended = engine
        .execute(&playbook, TriggerDescriptor::manual(alert_payload()), ExecutionMode::Live)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let late = engine
        .resume(suspended.id, ApprovalDecision::approve("alice"))
        .await;
    assert!(matches!(late, Err(AppError::ApprovalTimeout(_))));

    let execution = engine.get_status(suspended.id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.result("block").unwrap().status, ActionStatus::Failed);
}

#[tokio::test]
async fn test_cancel_while_awaiting_approval() {
    let engine = engine(ScriptedConnectors::new());
    let suspended = engine
        .execute(&gated_playbook(), TriggerDescriptor::manual(alert_payload()), ExecutionMode::Live)
        .await
        .unwrap();

    engine.cancel(suspended.id).await.unwrap();

    let execution = engine.get_status(suspended.id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Cancelled);
    assert_eq!(execution.result("block").unwrap().status, ActionStatus::Skipped);
    assert_eq!(engine.gate().pending_count(), 0);
    assert!(engine
        .resume(suspended.id, ApprovalDecision::approve("alice"))
        .await
        .is_err());
}

#[tokio::test]
async fn test_playbook_level_approval_gates_first_action() {
    let connectors = ScriptedConnectors::new();
    let engine = engine(connectors.clone());
    let playbook = Playbook::new("Upfront Approval", vec![ticket(1), block(2), notify(3)])
        .with_approval(ApprovalRequirement {
            required: true,
            approval_roles: Vec::new(),
            timeout_secs: None,
        });

    let suspended = engine
        .execute(&playbook, TriggerDescriptor::manual(alert_payload()), ExecutionMode::Live)
        .await
        .unwrap();
    assert_eq!(suspended.status, ExecutionStatus::AwaitingApproval);
    assert_eq!(suspended.approvals[0].action_id, "ticket");
    assert!(connectors.calls().is_empty());

    engine
        .resume(suspended.id, ApprovalDecision::approve("alice"))
        .await
        .unwrap();
    let execution = engine.wait_until_settled(suspended.id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.approvals.len(), 1);
    assert_eq!(connectors.calls().len(), 3);
}

#[tokio::test]
async fn test_approval_action_records_decision() {
    let engine = engine(ScriptedConnectors::new());
    let playbook = Playbook::new(
        "Approval Step",
        vec![
            ticket(1),
            PlaybookAction::new("sign_off", ActionType::Approval, 2),
            block(3),
        ],
    );

    let suspended = engine
        .execute(&playbook, TriggerDescriptor::manual(alert_payload()), ExecutionMode::Simulation)
        .await
        .unwrap();
    assert_eq!(suspended.status, ExecutionStatus::AwaitingApproval);
    assert_eq!(suspended.approvals[0].action_id, "sign_off");

    engine
        .resume(
            suspended.id,
            ApprovalDecision::approve("alice").with_reason("confirmed by phone"),
        )
        .await
        .unwrap();
    let execution = engine.wait_until_settled(suspended.id).await.unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    let output = execution.result("sign_off").unwrap().output.clone().unwrap();
    assert_eq!(output["approved"], json!(true));
    assert_eq!(output["approver"], json!("alice"));
    assert_eq!(output["reason"], json!("confirmed by phone"));
}

#[tokio::test]
async fn test_resolving_unsuspended_execution_fails() {
    let engine = engine(ScriptedConnectors::new());
    let execution = engine
        .execute(
            &three_step_playbook(soar_engine::models::OnErrorPolicy::Fail),
            TriggerDescriptor::manual(alert_payload()),
            ExecutionMode::Simulation,
        )
        .await
        .unwrap();

    let result = engine
        .resume(execution.id, ApprovalDecision::approve("alice"))
        .await;
    assert!(matches!(result, Err(AppError::InvalidStateTransition(_))));
}
