pub mod actions;
pub mod approval;
pub mod context;
pub mod decision;
pub mod error;
pub mod events;
pub mod harness;
pub mod loader;
pub mod orchestrator;
pub mod retry;
pub mod service;
pub mod validation;

pub use actions::{
    create_default_registry, ActionDispatcher, ActionHandler, ActionHandlerRegistry,
    ActionInvocation, DispatchRequest,
};
pub use approval::{
    AllowAllAuthorizer, ApprovalDecision, ApprovalGate, ApprovalResolution, Authorizer,
    PendingApproval, StaticRoleAuthorizer,
};
pub use context::ExecutionContext;
pub use decision::DecisionEvaluator;
pub use error::{ActionError, ConditionError};
pub use events::{ExecutionEvent, ExecutionEventBus};
pub use harness::{Complexity, HarnessMode, HarnessReport, PerformanceReport, TestHarness};
pub use loader::{load_playbook_dir, load_playbook_file, parse_playbook, PlaybookFormat};
pub use orchestrator::{ExecutionHandle, Orchestrator, RecoveryReport};
pub use retry::{RetryOutcome, RetryPlan, RetryPolicy};
pub use service::{trigger_from_payload, PlaybookService, PlaybookServiceStats};
pub use validation::{collect_issues, validate_playbook, IssueSeverity, ValidationIssue};
