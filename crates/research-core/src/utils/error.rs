use thiserror::Error;

use crate::models::ConversationId;

/// Coarse error taxonomy used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected synchronously, never retried automatically.
    Validation,
    /// LLM, persistence or vector-store failure.
    Upstream,
    /// Data-integrity problem, fatal to the single operation.
    Consistency,
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conversation {0} already has a turn in progress")]
    ConversationBusy(ConversationId),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Turn timed out after {0}s")]
    Timeout(u64),

    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::NotFound(_) | Self::ConversationBusy(_) => {
                ErrorKind::Validation
            }
            Self::ConsistencyViolation(_) => ErrorKind::Consistency,
            Self::LlmError(_) | Self::DatabaseError(_) | Self::Timeout(_) | Self::Internal(_) => {
                ErrorKind::Upstream
            }
        }
    }

    /// Short machine-readable code, used in activity logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::ConversationBusy(_) => "conversation_busy",
            Self::LlmError(_) => "llm_error",
            Self::DatabaseError(_) => "database_error",
            Self::Timeout(_) => "timeout",
            Self::ConsistencyViolation(_) => "consistency_violation",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => CoreError::NotFound("row not found".to_string()),
            other => CoreError::DatabaseError(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError(format!("migration failed: {}", err))
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        CoreError::LlmError(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Internal(format!("serialization failed: {}", err))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(CoreError::Validation("empty".into()).kind(), ErrorKind::Validation);
        assert_eq!(CoreError::ConversationBusy(7).kind(), ErrorKind::Validation);
        assert_eq!(CoreError::LlmError("down".into()).kind(), ErrorKind::Upstream);
        assert_eq!(CoreError::Timeout(30).kind(), ErrorKind::Upstream);
        assert_eq!(
            CoreError::ConsistencyViolation("both sources".into()).kind(),
            ErrorKind::Consistency
        );
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: CoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
