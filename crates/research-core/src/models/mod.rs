pub mod chat;
pub mod entity;

pub use chat::{
    ChatMessage, Conversation, ConversationId, ConversationMetadata, Message, MessageId,
    NewMessage, Role,
};
pub use entity::{EntityMention, EntityType, NewEntity, NewMention, SourceRef, TrackedEntity};
