pub mod settings;

pub use settings::{
    ConversationConfig, DatabaseConfig, EntityConfig, LlmConfig, LoggingConfig, Settings,
};
