use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use tracing::debug;
use uuid::Uuid;

use super::models::{ConversationRow, EntityRow, MentionRow, MessageRow};
use super::store::{ConversationStore, EntityStore};
use super::DbPool;
use crate::models::{
    Conversation, ConversationId, ConversationMetadata, EntityMention, Message, NewEntity,
    NewMention, NewMessage, SourceRef, TrackedEntity,
};
use crate::utils::error::{CoreError, CoreResult};

const CONVERSATION_COLUMNS: &str = "id, project_id, name, created_at, updated_at, metadata";
const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, timestamp, metadata";
const ENTITY_COLUMNS: &str = "id, user_id, name, name_lower, entity_type, created_at, metadata";
const MENTION_COLUMNS: &str =
    "id, entity_id, user_id, document_id, news_article_id, chunk_id, context, timestamp";

/// Postgres-backed store for conversations and entities.
#[derive(Clone)]
pub struct PgRepository {
    pub pool: DbPool,
}

impl PgRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// `usize::MAX` means "no limit"; Postgres wants a non-negative BIGINT.
    fn sql_limit(value: usize) -> i64 {
        i64::try_from(value).unwrap_or(i64::MAX)
    }

    fn decode_mentions(rows: Vec<MentionRow>) -> CoreResult<Vec<EntityMention>> {
        rows.into_iter().map(EntityMention::try_from).collect()
    }
}

#[async_trait]
impl ConversationStore for PgRepository {
    async fn create_conversation(
        &self,
        project_id: Uuid,
        name: &str,
        metadata: &ConversationMetadata,
    ) -> CoreResult<Conversation> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, ConversationRow>(&format!(
            "INSERT INTO conversations (project_id, name, created_at, updated_at, metadata)
             VALUES ($1, $2, $3, $3, $4)
             RETURNING {}",
            CONVERSATION_COLUMNS
        ))
        .bind(project_id)
        .bind(name)
        .bind(now)
        .bind(Json(metadata))
        .fetch_one(self.pool.get_pool())
        .await?;

        debug!("Created conversation {} for project {}", row.id, project_id);
        Ok(row.into())
    }

    async fn get_conversation(&self, id: ConversationId) -> CoreResult<Option<Conversation>> {
        let row = sqlx::query_as::<_, ConversationRow>(&format!(
            "SELECT {} FROM conversations WHERE id = $1",
            CONVERSATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(row.map(Into::into))
    }

    async fn list_conversations(&self, project_id: Uuid) -> CoreResult<Vec<Conversation>> {
        let rows = sqlx::query_as::<_, ConversationRow>(&format!(
            "SELECT {} FROM conversations WHERE project_id = $1 ORDER BY updated_at DESC, id DESC",
            CONVERSATION_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn update_conversation(
        &self,
        id: ConversationId,
        metadata: &ConversationMetadata,
    ) -> CoreResult<Conversation> {
        let row = sqlx::query_as::<_, ConversationRow>(&format!(
            "UPDATE conversations SET metadata = $2, updated_at = $3 WHERE id = $1 RETURNING {}",
            CONVERSATION_COLUMNS
        ))
        .bind(id)
        .bind(Json(metadata))
        .bind(Utc::now())
        .fetch_optional(self.pool.get_pool())
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("conversation {}", id)))?;

        Ok(row.into())
    }

    async fn append_message(&self, message: NewMessage) -> CoreResult<Message> {
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "INSERT INTO messages (conversation_id, role, content, timestamp, metadata)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {}",
            MESSAGE_COLUMNS
        ))
        .bind(message.conversation_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(Utc::now())
        .bind(Json(&message.metadata))
        .fetch_one(self.pool.get_pool())
        .await?;

        row.try_into()
    }

    async fn list_messages(&self, conversation_id: ConversationId) -> CoreResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {} FROM messages WHERE conversation_id = $1 ORDER BY timestamp ASC, id ASC",
            MESSAGE_COLUMNS
        ))
        .bind(conversation_id)
        .fetch_all(self.pool.get_pool())
        .await?;

        rows.into_iter().map(Message::try_from).collect()
    }

    async fn delete_project(&self, project_id: Uuid) -> CoreResult<u64> {
        // messages go with their conversation (ON DELETE CASCADE)
        let result = sqlx::query("DELETE FROM conversations WHERE project_id = $1")
            .bind(project_id)
            .execute(self.pool.get_pool())
            .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl EntityStore for PgRepository {
    async fn upsert_entity(&self, entity: NewEntity) -> CoreResult<(TrackedEntity, bool)> {
        let inserted = sqlx::query_as::<_, EntityRow>(&format!(
            "INSERT INTO tracked_entities (id, user_id, name, name_lower, entity_type, created_at, metadata)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (user_id, name_lower) DO NOTHING
             RETURNING {}",
            ENTITY_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(entity.user_id)
        .bind(&entity.name)
        .bind(&entity.name_lower)
        .bind(entity.entity_type.as_str())
        .bind(Utc::now())
        .bind(Json(&entity.metadata))
        .fetch_optional(self.pool.get_pool())
        .await?;

        if let Some(row) = inserted {
            return Ok((row.into(), true));
        }

        let existing = self
            .find_entity(entity.user_id, &entity.name_lower)
            .await?
            .ok_or_else(|| {
                CoreError::ConsistencyViolation(format!(
                    "entity '{}' conflicted on insert but cannot be read back",
                    entity.name_lower
                ))
            })?;

        Ok((existing, false))
    }

    async fn find_entity(
        &self,
        user_id: Uuid,
        name_lower: &str,
    ) -> CoreResult<Option<TrackedEntity>> {
        let row = sqlx::query_as::<_, EntityRow>(&format!(
            "SELECT {} FROM tracked_entities WHERE user_id = $1 AND name_lower = $2",
            ENTITY_COLUMNS
        ))
        .bind(user_id)
        .bind(name_lower)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(row.map(Into::into))
    }

    async fn get_entities(&self, user_id: Uuid, ids: &[Uuid]) -> CoreResult<Vec<TrackedEntity>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, EntityRow>(&format!(
            "SELECT {} FROM tracked_entities WHERE user_id = $1 AND id = ANY($2)",
            ENTITY_COLUMNS
        ))
        .bind(user_id)
        .bind(ids)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_entities(&self, user_id: Uuid, limit: usize) -> CoreResult<Vec<TrackedEntity>> {
        let rows = sqlx::query_as::<_, EntityRow>(&format!(
            "SELECT {} FROM tracked_entities WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
            ENTITY_COLUMNS
        ))
        .bind(user_id)
        .bind(Self::sql_limit(limit))
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn insert_mention(&self, mention: NewMention) -> CoreResult<EntityMention> {
        self.insert_mentions(vec![mention])
            .await?
            .pop()
            .ok_or_else(|| CoreError::Internal("mention batch came back empty".to_string()))
    }

    async fn insert_mentions(&self, mentions: Vec<NewMention>) -> CoreResult<Vec<EntityMention>> {
        if mentions.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "INSERT INTO entity_mentions
                (id, entity_id, user_id, document_id, news_article_id, chunk_id, context, timestamp)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING {}",
            MENTION_COLUMNS
        );
        let now = Utc::now();

        // Dropping the transaction on any error rolls the batch back
        let mut tx = self.pool.get_pool().begin().await?;
        let mut stored = Vec::with_capacity(mentions.len());
        for mention in mentions {
            let (document_id, news_article_id) = mention.source.into_parts();
            let row = sqlx::query_as::<_, MentionRow>(&sql)
                .bind(Uuid::new_v4())
                .bind(mention.entity_id)
                .bind(mention.user_id)
                .bind(document_id)
                .bind(news_article_id)
                .bind(&mention.chunk_id)
                .bind(&mention.context)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?;
            stored.push(EntityMention::try_from(row)?);
        }
        tx.commit().await?;

        Ok(stored)
    }

    async fn mentions_for_entity(
        &self,
        entity_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> CoreResult<Vec<EntityMention>> {
        let rows = sqlx::query_as::<_, MentionRow>(&format!(
            "SELECT {} FROM entity_mentions WHERE entity_id = $1
             ORDER BY timestamp DESC LIMIT $2 OFFSET $3",
            MENTION_COLUMNS
        ))
        .bind(entity_id)
        .bind(Self::sql_limit(limit))
        .bind(Self::sql_limit(offset))
        .fetch_all(self.pool.get_pool())
        .await?;

        Self::decode_mentions(rows)
    }

    async fn mentions_in_sources(
        &self,
        user_id: Uuid,
        sources: &[SourceRef],
    ) -> CoreResult<Vec<EntityMention>> {
        let mut document_ids = Vec::new();
        let mut article_ids = Vec::new();
        for source in sources {
            match source {
                SourceRef::Document(id) => document_ids.push(*id),
                SourceRef::NewsArticle(id) => article_ids.push(*id),
            }
        }

        if document_ids.is_empty() && article_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, MentionRow>(&format!(
            "SELECT {} FROM entity_mentions
             WHERE user_id = $1 AND (document_id = ANY($2) OR news_article_id = ANY($3))
             ORDER BY timestamp ASC",
            MENTION_COLUMNS
        ))
        .bind(user_id)
        .bind(&document_ids)
        .bind(&article_ids)
        .fetch_all(self.pool.get_pool())
        .await?;

        debug!(
            "Loaded {} co-located mentions across {} sources",
            rows.len(),
            sources.len()
        );

        Self::decode_mentions(rows)
    }
}
