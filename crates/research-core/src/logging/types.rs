use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::models::ConversationId;
use crate::utils::error::CoreError;

/// Activity type categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    ConversationCreated,
    MessageReceived,
    PromptTrimmed,
    ResponseCompleted,
    TurnFailed,
    TurnRejected,
    StaleTurnReleased,
    MetadataUpdated,
    ProjectDeleted,
    EntityTracked,
    SourceScanned,
    GraphBuilt,
    GraphFailed,
}

impl ActivityType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ConversationCreated => "conversation_created",
            Self::MessageReceived => "message_received",
            Self::PromptTrimmed => "prompt_trimmed",
            Self::ResponseCompleted => "response_completed",
            Self::TurnFailed => "turn_failed",
            Self::TurnRejected => "turn_rejected",
            Self::StaleTurnReleased => "stale_turn_released",
            Self::MetadataUpdated => "metadata_updated",
            Self::ProjectDeleted => "project_deleted",
            Self::EntityTracked => "entity_tracked",
            Self::SourceScanned => "source_scanned",
            Self::GraphBuilt => "graph_built",
            Self::GraphFailed => "graph_failed",
        }
    }
}

/// Activity status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    Success,
    Error,
    Warning,
    Info,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }
}

/// One row of the activity audit trail.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    pub user_id: Option<Uuid>,
    pub conversation_id: Option<ConversationId>,

    pub activity_type: ActivityType,
    pub activity_status: ActivityStatus,

    pub message: Option<String>,
    pub error_code: Option<String>,
    pub duration_ms: Option<i64>,

    pub metadata: Option<Map<String, Value>>,
    pub created_at: DateTime<Utc>,
}

impl ActivityLog {
    /// Create builder for fluent API
    pub fn builder(activity_type: ActivityType) -> ActivityLogBuilder {
        ActivityLogBuilder::new(activity_type)
    }
}

/// Builder pattern for ActivityLog
pub struct ActivityLogBuilder {
    log: ActivityLog,
}

impl ActivityLogBuilder {
    pub fn new(activity_type: ActivityType) -> Self {
        Self {
            log: ActivityLog {
                user_id: None,
                conversation_id: None,
                activity_type,
                activity_status: ActivityStatus::Success,
                message: None,
                error_code: None,
                duration_ms: None,
                metadata: None,
                created_at: Utc::now(),
            },
        }
    }

    pub fn status(mut self, status: ActivityStatus) -> Self {
        self.log.activity_status = status;
        self
    }

    pub fn user(mut self, user_id: Uuid) -> Self {
        self.log.user_id = Some(user_id);
        self
    }

    pub fn conversation(mut self, conversation_id: ConversationId) -> Self {
        self.log.conversation_id = Some(conversation_id);
        self
    }

    pub fn message(mut self, content: impl Into<String>) -> Self {
        self.log.message = Some(content.into());
        self
    }

    pub fn duration_ms(mut self, ms: u128) -> Self {
        self.log.duration_ms = Some(i64::try_from(ms).unwrap_or(i64::MAX));
        self
    }

    pub fn error(mut self, err: &CoreError) -> Self {
        self.log.message = Some(err.to_string());
        self.log.error_code = Some(err.code().to_string());
        self.log.activity_status = ActivityStatus::Error;
        self
    }

    /// Add custom key-value data
    pub fn custom(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.log
            .metadata
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value.into());
        self
    }

    pub fn build(self) -> ActivityLog {
        self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_records_error() {
        let log = ActivityLog::builder(ActivityType::TurnFailed)
            .conversation(12)
            .custom("step", "llm_stream")
            .error(&CoreError::Timeout(30))
            .build();

        assert_eq!(log.activity_status, ActivityStatus::Error);
        assert_eq!(log.error_code.as_deref(), Some("timeout"));
        assert_eq!(log.conversation_id, Some(12));
        assert_eq!(log.metadata.unwrap()["step"], "llm_stream");
    }
}
