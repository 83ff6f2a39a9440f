pub mod conversation;
pub mod entity;
pub mod event_bus;
pub mod llm_service;

pub use conversation::{ConversationService, FindingExtractor, TurnPhase};
pub use entity::{EntityGraph, EntityService};
pub use event_bus::{EventBus, StreamEvent, Subscription};
pub use llm_service::{LlmProvider, LlmService, TextStream};
