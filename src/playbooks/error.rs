//! Error types for playbook execution

use std::time::Duration;

use crate::connectors::ConnectorError;
use crate::models::{ActionType, RiskLevel};

/// Failure of a single action dispatch.
///
/// These never escape the orchestrator: they are recorded on the action result and fed to the
/// action's on-error policy.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActionError {
    /// Handler or connector reported a failure
    #[error("{0}")]
    Failed(String),

    /// Connector call failed
    #[error("Connector error: {0}")]
    Connector(String),

    /// Per-action timeout elapsed
    #[error("Action timed out after {0:?}")]
    Timeout(Duration),

    /// Resolved parameters are unusable
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Cancellation observed while waiting to retry
    #[error("Cancelled while retrying")]
    Cancelled,

    /// No handler registered for the action type
    #[error("No handler registered for action type: {0}")]
    Unsupported(ActionType),
}

impl ActionError {
    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ActionError::Failed(_) | ActionError::Connector(_) | ActionError::Timeout(_)
        )
    }
}

impl From<ConnectorError> for ActionError {
    fn from(err: ConnectorError) -> Self {
        ActionError::Connector(err.to_string())
    }
}

/// Why a condition could not be evaluated; always treated as `false`
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
    #[error("Field '{0}' not found in execution context")]
    MissingField(String),

    #[error("Field '{field}' is not {expected}")]
    TypeMismatch { field: String, expected: &'static str },

    #[error("Risk level {0} requires a threshold")]
    MissingThreshold(RiskLevel),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(ActionError::Failed("boom".to_string()).is_retryable());
        assert!(ActionError::Connector("503".to_string()).is_retryable());
        assert!(ActionError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!ActionError::InvalidParameters("ip".to_string()).is_retryable());
        assert!(!ActionError::Cancelled.is_retryable());
        assert!(!ActionError::Unsupported(ActionType::Wait).is_retryable());
    }
}
