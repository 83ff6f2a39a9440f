use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::{
    Conversation, ConversationMetadata, EntityMention, EntityType, Message, SourceRef,
    TrackedEntity,
};
use crate::utils::error::CoreError;

#[derive(Debug, Clone, FromRow)]
pub struct ConversationRow {
    pub id: i64,
    pub project_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: Json<ConversationMetadata>,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Self {
            id: row.id,
            project_id: row.project_id,
            name: row.name,
            created_at: row.created_at,
            updated_at: row.updated_at,
            metadata: row.metadata.0,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct MessageRow {
    pub id: i64,
    pub conversation_id: i64,
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Json<Map<String, Value>>,
}

impl TryFrom<MessageRow> for Message {
    type Error = CoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let role = row.role.parse().map_err(|_| {
            CoreError::ConsistencyViolation(format!(
                "message {} has unknown role '{}'",
                row.id, row.role
            ))
        })?;

        Ok(Self {
            id: row.id,
            conversation_id: row.conversation_id,
            role,
            content: row.content,
            timestamp: row.timestamp,
            metadata: row.metadata.0,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct EntityRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub name_lower: String,
    pub entity_type: String,
    pub created_at: DateTime<Utc>,
    pub metadata: Json<Map<String, Value>>,
}

impl From<EntityRow> for TrackedEntity {
    fn from(row: EntityRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            name_lower: row.name_lower,
            entity_type: EntityType::from(row.entity_type),
            created_at: row.created_at,
            metadata: row.metadata.0,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct MentionRow {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub user_id: Uuid,
    pub document_id: Option<Uuid>,
    pub news_article_id: Option<Uuid>,
    pub chunk_id: String,
    pub context: String,
    pub timestamp: DateTime<Utc>,
}

impl TryFrom<MentionRow> for EntityMention {
    type Error = CoreError;

    fn try_from(row: MentionRow) -> Result<Self, Self::Error> {
        let source = SourceRef::from_parts(row.document_id, row.news_article_id)?;

        Ok(Self {
            id: row.id,
            entity_id: row.entity_id,
            user_id: row.user_id,
            source,
            chunk_id: row.chunk_id,
            context: row.context,
            timestamp: row.timestamp,
        })
    }
}
