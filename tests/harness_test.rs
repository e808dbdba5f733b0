use serde_json::json;
use soar_engine::{
    config::Config,
    models::{ActionStatus, ExecutionStatus, TriggerDescriptor},
    playbooks::{parse_playbook, Complexity, HarnessMode, PlaybookFormat, TestHarness},
};

const RANSOMWARE_PLAYBOOK: &str = r#"
name: Ransomware Containment
version: "3.0"
owner: soc
approval:
  required: false
  approval_roles: [incident_commander]
actions:
  - id: enrich
    action_type: enrich_ioc
    order: 1
    parameters:
      indicator: "{{file_hash}}"
    decision:
      branches:
        - id: contain
          condition: { type: risk, level: high_risk }
      default_branch: observe
  - id: isolate
    action_type: isolate_endpoint
    order: 2
    branch: contain
    requires_approval: true
    parameters:
      hostname: "{{hostname}}"
  - id: evidence
    action_type: collect_evidence
    order: 3
    branch: contain
    parameters:
      target: "{{hostname}}"
  - id: watch
    action_type: query_siem
    order: 4
    branch: observe
    parameters:
      query: "host={{hostname}}"
  - id: ticket
    action_type: create_ticket
    order: 5
    parameters:
      title: "Ransomware activity on {{hostname}}"
"#;

fn trigger(score: u32) -> TriggerDescriptor {
    TriggerDescriptor::new(
        "edr",
        "alert",
        json!({"hostname": "fin-ws-042", "file_hash": "9f86d081884c7d65", "score": score}),
    )
}

fn harness() -> TestHarness {
    TestHarness::in_memory(&Config::default())
}

#[tokio::test]
async fn test_validation_mode_reports_structure_only() {
    let playbook = parse_playbook(RANSOMWARE_PLAYBOOK, PlaybookFormat::Yaml).unwrap();
    let report = harness()
        .run(&playbook, trigger(90), HarnessMode::Validation)
        .await
        .unwrap();

    assert!(report.passed);
    assert_eq!(report.errors().count(), 0);
    assert!(report.execution.is_none());
    assert_eq!(report.plan, vec!["enrich", "isolate", "evidence", "watch", "ticket"]);
}

#[tokio::test]
async fn test_dry_run_flags_missing_parameters() {
    let broken = RANSOMWARE_PLAYBOOK.replace(
        "    branch: contain\n    parameters:\n      target: \"{{hostname}}\"\n",
        "    branch: contain\n",
    );
    assert_ne!(broken, RANSOMWARE_PLAYBOOK);
    let playbook = parse_playbook(&broken, PlaybookFormat::Yaml).unwrap();
    let harness = harness();

    let validation = harness.run(&playbook, trigger(90), HarnessMode::Validation).await.unwrap();
    assert!(validation.passed);

    let dry_run = harness.run(&playbook, trigger(90), HarnessMode::DryRun).await.unwrap();
    assert!(!dry_run.passed);
    assert!(dry_run
        .errors()
        .any(|issue| issue.action_id.as_deref() == Some("evidence")));

    let simulation = harness.run(&playbook, trigger(90), HarnessMode::Simulation).await.unwrap();
    assert!(!simulation.passed);
    assert!(simulation.execution.is_none());
}

#[tokio::test]
async fn test_simulation_auto_approves_gates() {
    let playbook = parse_playbook(RANSOMWARE_PLAYBOOK, PlaybookFormat::Yaml).unwrap();
    let report = harness()
        .run(&playbook, trigger(90), HarnessMode::Simulation)
        .await
        .unwrap();

    assert!(report.passed);
    assert_eq!(report.approvals_granted, 1);

    let execution = report.execution.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.decision_path, vec!["contain".to_string()]);
    assert_eq!(execution.result("isolate").unwrap().status, ActionStatus::Completed);
    assert_eq!(execution.result("watch").unwrap().status, ActionStatus::Skipped);
    assert_eq!(execution.approvals[0].approver.as_deref(), Some("playbook-test-harness"));
}

#[tokio::test]
async fn test_simulation_takes_default_branch() {
    let playbook = parse_playbook(RANSOMWARE_PLAYBOOK, PlaybookFormat::Yaml).unwrap();
    let report = harness()
        .run(&playbook, trigger(15), HarnessMode::Simulation)
        .await
        .unwrap();

    assert!(report.passed);
    assert_eq!(report.approvals_granted, 0);
    let execution = report.execution.unwrap();
    assert_eq!(execution.decision_path, vec!["observe".to_string()]);
    assert_eq!(execution.result("watch").unwrap().status, ActionStatus::Completed);
    assert_eq!(execution.skipped_actions, 2);
}

#[tokio::test]
async fn test_performance_mode_analyzes_run() {
    let playbook = parse_playbook(RANSOMWARE_PLAYBOOK, PlaybookFormat::Yaml).unwrap();
    let report = harness()
        .run(&playbook, trigger(90), HarnessMode::Performance)
        .await
        .unwrap();

    assert!(report.passed);
    let performance = report.performance.unwrap();
    assert_eq!(performance.action_count, 5);
    assert_eq!(performance.branching_factor, 1);
    assert_eq!(performance.complexity, Complexity::Low);
    // watch is skipped and never timed
    assert_eq!(performance.timings.len(), 4);
    assert_eq!(performance.total_retries, 0);
}
