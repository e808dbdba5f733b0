use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed playbook or action specification
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Principal is not allowed to perform the operation
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// Approval gate was not resolved before its deadline
    #[error("Approval timed out: {0}")]
    ApprovalTimeout(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Integration errors
    #[error("Integration error ({integration_source}): {message}")]
    Integration { integration_source: String, message: String },

    /// Invalid state transition
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),
}

impl AppError {
    /// Get error code string
    pub fn error_code(&self) -> &str {
        match self {
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Authorization(_) => "AUTHORIZATION_ERROR",
            AppError::ApprovalTimeout(_) => "APPROVAL_TIMEOUT",
            AppError::Configuration(_) => "CONFIGURATION_ERROR",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
            AppError::Integration { .. } => "INTEGRATION_ERROR",
            AppError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
        }
    }

    /// Whether the error was caused by the caller rather than the engine
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AppError::NotFound(_)
                | AppError::Validation(_)
                | AppError::Authorization(_)
                | AppError::InvalidStateTransition(_)
                | AppError::ApprovalTimeout(_)
        )
    }
}

/// Conversion from serde_json::Error
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

/// Conversion from serde_yaml::Error
impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

/// Conversion from validator::ValidationErrors
impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Validation(err.to_string())
    }
}

/// Conversion from config::ConfigError
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration(err.to_string())
    }
}

impl From<sled::Error> for AppError {
    fn from(err: sled::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            AppError::NotFound("test".to_string()).error_code(),
            "NOT_FOUND"
        );
        assert_eq!(
            AppError::Validation("test".to_string()).error_code(),
            "VALIDATION_ERROR"
        );
        assert_eq!(
            AppError::ApprovalTimeout("exec".to_string()).error_code(),
            "APPROVAL_TIMEOUT"
        );
        assert_eq!(
            AppError::InvalidStateTransition("exec".to_string()).error_code(),
            "INVALID_STATE_TRANSITION"
        );
    }

    #[test]
    fn test_client_errors() {
        assert!(AppError::Validation("bad".to_string()).is_client_error());
        assert!(AppError::Authorization("nope".to_string()).is_client_error());
        assert!(!AppError::Database("down".to_string()).is_client_error());
        assert!(!AppError::Internal("bug".to_string()).is_client_error());
    }

    #[test]
    fn test_conversion_from_serde_json() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let app: AppError = err.into();
        assert_eq!(app.error_code(), "SERIALIZATION_ERROR");
    }
}
