use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{
    Conversation, ConversationId, ConversationMetadata, EntityMention, Message, NewEntity,
    NewMention, NewMessage, SourceRef, TrackedEntity,
};
use crate::utils::error::CoreResult;

/// Conversation and message persistence.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(
        &self,
        project_id: Uuid,
        name: &str,
        metadata: &ConversationMetadata,
    ) -> CoreResult<Conversation>;

    async fn get_conversation(&self, id: ConversationId) -> CoreResult<Option<Conversation>>;

    /// Newest first.
    async fn list_conversations(&self, project_id: Uuid) -> CoreResult<Vec<Conversation>>;

    /// Replace the metadata bag and bump `updated_at`.
    async fn update_conversation(
        &self,
        id: ConversationId,
        metadata: &ConversationMetadata,
    ) -> CoreResult<Conversation>;

    async fn append_message(&self, message: NewMessage) -> CoreResult<Message>;

    /// Full log, oldest first.
    async fn list_messages(&self, conversation_id: ConversationId) -> CoreResult<Vec<Message>>;

    /// Removes every conversation of the project together with its messages.
    /// Returns the number of conversations removed.
    async fn delete_project(&self, project_id: Uuid) -> CoreResult<u64>;
}

/// Tracked entities and their mentions.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Insert, or return the entity already stored under the same
    /// `(user_id, name_lower)`. The flag is `true` when a row was created.
    async fn upsert_entity(&self, entity: NewEntity) -> CoreResult<(TrackedEntity, bool)>;

    async fn find_entity(&self, user_id: Uuid, name_lower: &str)
        -> CoreResult<Option<TrackedEntity>>;

    async fn get_entities(&self, user_id: Uuid, ids: &[Uuid]) -> CoreResult<Vec<TrackedEntity>>;

    /// Newest first.
    async fn list_entities(&self, user_id: Uuid, limit: usize) -> CoreResult<Vec<TrackedEntity>>;

    async fn insert_mention(&self, mention: NewMention) -> CoreResult<EntityMention>;

    /// All or nothing: on error no mention of the batch is stored.
    async fn insert_mentions(&self, mentions: Vec<NewMention>) -> CoreResult<Vec<EntityMention>>;

    /// Newest first.
    async fn mentions_for_entity(
        &self,
        entity_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> CoreResult<Vec<EntityMention>>;

    /// Every mention owned by `user_id` located in any of `sources`.
    async fn mentions_in_sources(
        &self,
        user_id: Uuid,
        sources: &[SourceRef],
    ) -> CoreResult<Vec<EntityMention>>;
}
