use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

use super::{ActionHandler, ActionInvocation};
use crate::models::ActionType;
use crate::playbooks::error::ActionError;

/// Pauses the execution for `duration_seconds`
pub struct WaitActionHandler {
    max_wait: Duration,
}

impl WaitActionHandler {
    pub fn new(max_wait: Duration) -> Self {
        Self { max_wait }
    }

    fn requested(&self, invocation: &ActionInvocation<'_>) -> Result<Duration, ActionError> {
        let value = invocation
            .param("duration_seconds")
            .or_else(|| invocation.param("duration"))
            .ok_or_else(|| {
                ActionError::InvalidParameters("'duration_seconds' parameter required".to_string())
            })?;

        let secs = match value {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .filter(|s| s.is_finite() && *s >= 0.0)
        .ok_or_else(|| {
            ActionError::InvalidParameters(format!("invalid wait duration: {}", value))
        })?;

        Duration::try_from_secs_f64(secs).map_err(|e| {
            ActionError::InvalidParameters(format!("invalid wait duration {}: {}", value, e))
        })
    }
}

#[async_trait]
impl ActionHandler for WaitActionHandler {
    fn action_type(&self) -> ActionType {
        ActionType::Wait
    }

    fn required_parameters(&self) -> &'static [&'static str] {
        &["duration_seconds|duration"]
    }

    async fn execute(&self, invocation: &ActionInvocation<'_>) -> Result<JsonValue, ActionError> {
        let requested = self.requested(invocation)?;
        let waited = requested.min(self.max_wait);
        info!(
            action_id = %invocation.action.id,
            wait_secs = waited.as_secs_f64(),
            "Waiting"
        );
        sleep(waited).await;

        Ok(json!({
            "waited_seconds": waited.as_secs_f64(),
            "capped": waited < requested,
        }))
    }

    async fn simulate(&self, invocation: &ActionInvocation<'_>) -> Result<JsonValue, ActionError> {
        let requested = self.requested(invocation)?;
        let waited = requested.min(self.max_wait);
        Ok(json!({
            "waited_seconds": waited.as_secs_f64(),
            "capped": waited < requested,
        }))
    }
}

/// Completes once the gate in front of it has been approved
pub struct ApprovalActionHandler;

impl ApprovalActionHandler {
    fn granted(invocation: &ActionInvocation<'_>) -> Result<JsonValue, ActionError> {
        match invocation.approval {
            Some(record) if record.approved == Some(true) => Ok(json!({
                "approved": true,
                "approver": record.approver,
                "reason": record.reason,
                "decided_at": record.decided_at,
            })),
            _ => Err(ActionError::Failed(format!(
                "approval action {} dispatched without a granted approval",
                invocation.action.id
            ))),
        }
    }
}

#[async_trait]
impl ActionHandler for ApprovalActionHandler {
    fn action_type(&self) -> ActionType {
        ActionType::Approval
    }

    async fn execute(&self, invocation: &ActionInvocation<'_>) -> Result<JsonValue, ActionError> {
        Self::granted(invocation)
    }

    async fn simulate(&self, invocation: &ActionInvocation<'_>) -> Result<JsonValue, ActionError> {
        Self::granted(invocation)
    }
}
