use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

use super::store::{ConversationStore, EntityStore};
use crate::models::{
    Conversation, ConversationId, ConversationMetadata, EntityMention, Message, NewEntity,
    NewMention, NewMessage, SourceRef, TrackedEntity,
};
use crate::utils::error::{CoreError, CoreResult};

/// In-process store. Used by tests and single-process embedding.
pub struct MemoryStore {
    conversations: DashMap<ConversationId, Conversation>,
    messages: DashMap<ConversationId, Vec<Message>>,
    /// Insertion order, oldest first.
    entities: RwLock<Vec<TrackedEntity>>,
    /// Insertion order, oldest first.
    mentions: RwLock<Vec<EntityMention>>,
    next_conversation_id: AtomicI64,
    next_message_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            conversations: DashMap::new(),
            messages: DashMap::new(),
            entities: RwLock::new(Vec::new()),
            mentions: RwLock::new(Vec::new()),
            next_conversation_id: AtomicI64::new(1),
            next_message_id: AtomicI64::new(1),
        }
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }

    pub fn mention_count(&self) -> usize {
        self.mentions.read().len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create_conversation(
        &self,
        project_id: Uuid,
        name: &str,
        metadata: &ConversationMetadata,
    ) -> CoreResult<Conversation> {
        let id = self.next_conversation_id.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        let conversation = Conversation {
            id,
            project_id,
            name: name.to_string(),
            created_at: now,
            updated_at: now,
            metadata: metadata.clone(),
        };

        self.conversations.insert(id, conversation.clone());
        self.messages.insert(id, Vec::new());
        Ok(conversation)
    }

    async fn get_conversation(&self, id: ConversationId) -> CoreResult<Option<Conversation>> {
        Ok(self.conversations.get(&id).map(|c| c.value().clone()))
    }

    async fn list_conversations(&self, project_id: Uuid) -> CoreResult<Vec<Conversation>> {
        let mut found: Vec<Conversation> = self
            .conversations
            .iter()
            .filter(|c| c.project_id == project_id)
            .map(|c| c.value().clone())
            .collect();
        found.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(found)
    }

    async fn update_conversation(
        &self,
        id: ConversationId,
        metadata: &ConversationMetadata,
    ) -> CoreResult<Conversation> {
        let mut entry = self
            .conversations
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("conversation {}", id)))?;

        entry.metadata = metadata.clone();
        entry.updated_at = Utc::now();
        Ok(entry.value().clone())
    }

    async fn append_message(&self, message: NewMessage) -> CoreResult<Message> {
        let mut log = self.messages.get_mut(&message.conversation_id).ok_or_else(|| {
            CoreError::NotFound(format!("conversation {}", message.conversation_id))
        })?;

        let stored = Message {
            id: self.next_message_id.fetch_add(1, Ordering::Relaxed),
            conversation_id: message.conversation_id,
            role: message.role,
            content: message.content,
            timestamp: Utc::now(),
            metadata: message.metadata,
        };
        log.push(stored.clone());
        Ok(stored)
    }

    async fn list_messages(&self, conversation_id: ConversationId) -> CoreResult<Vec<Message>> {
        Ok(self
            .messages
            .get(&conversation_id)
            .map(|log| log.value().clone())
            .unwrap_or_default())
    }

    async fn delete_project(&self, project_id: Uuid) -> CoreResult<u64> {
        let ids: Vec<ConversationId> = self
            .conversations
            .iter()
            .filter(|c| c.project_id == project_id)
            .map(|c| *c.key())
            .collect();

        for id in &ids {
            self.conversations.remove(id);
            self.messages.remove(id);
        }

        Ok(ids.len() as u64)
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn upsert_entity(&self, entity: NewEntity) -> CoreResult<(TrackedEntity, bool)> {
        let mut entities = self.entities.write();

        if let Some(existing) = entities
            .iter()
            .find(|e| e.user_id == entity.user_id && e.name_lower == entity.name_lower)
        {
            return Ok((existing.clone(), false));
        }

        let created = TrackedEntity {
            id: Uuid::new_v4(),
            user_id: entity.user_id,
            name: entity.name,
            name_lower: entity.name_lower,
            entity_type: entity.entity_type,
            created_at: Utc::now(),
            metadata: entity.metadata,
        };
        entities.push(created.clone());
        Ok((created, true))
    }

    async fn find_entity(
        &self,
        user_id: Uuid,
        name_lower: &str,
    ) -> CoreResult<Option<TrackedEntity>> {
        Ok(self
            .entities
            .read()
            .iter()
            .find(|e| e.user_id == user_id && e.name_lower == name_lower)
            .cloned())
    }

    async fn get_entities(&self, user_id: Uuid, ids: &[Uuid]) -> CoreResult<Vec<TrackedEntity>> {
        Ok(self
            .entities
            .read()
            .iter()
            .filter(|e| e.user_id == user_id && ids.contains(&e.id))
            .cloned()
            .collect())
    }

    async fn list_entities(&self, user_id: Uuid, limit: usize) -> CoreResult<Vec<TrackedEntity>> {
        Ok(self
            .entities
            .read()
            .iter()
            .rev()
            .filter(|e| e.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert_mention(&self, mention: NewMention) -> CoreResult<EntityMention> {
        self.insert_mentions(vec![mention])
            .await?
            .pop()
            .ok_or_else(|| CoreError::Internal("mention batch came back empty".to_string()))
    }

    async fn insert_mentions(&self, mentions: Vec<NewMention>) -> CoreResult<Vec<EntityMention>> {
        {
            let entities = self.entities.read();
            if let Some(unknown) = mentions
                .iter()
                .find(|m| !entities.iter().any(|e| e.id == m.entity_id))
            {
                return Err(CoreError::NotFound(format!("entity {}", unknown.entity_id)));
            }
        }

        let now = Utc::now();
        let stored: Vec<EntityMention> = mentions
            .into_iter()
            .map(|mention| EntityMention {
                id: Uuid::new_v4(),
                entity_id: mention.entity_id,
                user_id: mention.user_id,
                source: mention.source,
                chunk_id: mention.chunk_id,
                context: mention.context,
                timestamp: now,
            })
            .collect();
        self.mentions.write().extend(stored.iter().cloned());
        Ok(stored)
    }

    async fn mentions_for_entity(
        &self,
        entity_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> CoreResult<Vec<EntityMention>> {
        Ok(self
            .mentions
            .read()
            .iter()
            .rev()
            .filter(|m| m.entity_id == entity_id)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mentions_in_sources(
        &self,
        user_id: Uuid,
        sources: &[SourceRef],
    ) -> CoreResult<Vec<EntityMention>> {
        Ok(self
            .mentions
            .read()
            .iter()
            .filter(|m| m.user_id == user_id && sources.contains(&m.source))
            .cloned()
            .collect())
    }
}
