use std::sync::Arc;
use tracing::info;

use crate::config::Settings;
use crate::database::{DbPool, MemoryStore, PgRepository};
use crate::logging::{ActivityLogger, LoggerConfig, PgActivitySink, TracingActivitySink};
use crate::services::{
    ConversationService, EntityService, EventBus, LlmProvider, LlmService,
};
use crate::utils::error::CoreResult;

/// Wired services shared by whatever front end hosts the core.
#[derive(Clone)]
pub struct AppState {
    pub db_pool: Option<DbPool>,
    pub settings: Settings,
    pub event_bus: Arc<EventBus>,
    pub activity_logger: ActivityLogger,
    pub conversations: ConversationService,
    pub entities: EntityService,
}

impl AppState {
    /// Postgres-backed stack talking to the configured LLM server.
    pub async fn connect(settings: Settings) -> CoreResult<Self> {
        let db_pool = DbPool::new(&settings.database).await?;
        info!("✅ Database connection established");

        if settings.database.run_migrations {
            db_pool.run_migrations().await?;
        }

        let activity_logger = if settings.logging.persist_activity {
            ActivityLogger::new(
                Arc::new(PgActivitySink::new(db_pool.get_pool().clone())),
                LoggerConfig::from(&settings.logging),
            )
        } else {
            ActivityLogger::new(
                Arc::new(TracingActivitySink),
                LoggerConfig::from(&settings.logging),
            )
        };

        let repository = Arc::new(PgRepository::new(db_pool.clone()));
        let llm: Arc<dyn LlmProvider> = Arc::new(LlmService::new(settings.llm.clone())?);
        info!("✅ LLM client ready ({} @ {})", settings.llm.model, settings.llm.base_url);

        Self::assemble(
            Some(db_pool),
            settings,
            repository.clone(),
            repository,
            llm,
            activity_logger,
        )
    }

    /// In-process stack over [`MemoryStore`]; nothing leaves the process
    /// except calls made by `llm`.
    pub fn in_memory(settings: Settings, llm: Arc<dyn LlmProvider>) -> CoreResult<Self> {
        let store = Arc::new(MemoryStore::new());
        let activity_logger = ActivityLogger::new(
            Arc::new(TracingActivitySink),
            LoggerConfig::from(&settings.logging),
        );

        Self::assemble(None, settings, store.clone(), store, llm, activity_logger)
    }

    fn assemble(
        db_pool: Option<DbPool>,
        settings: Settings,
        conversation_store: Arc<dyn crate::database::ConversationStore>,
        entity_store: Arc<dyn crate::database::EntityStore>,
        llm: Arc<dyn LlmProvider>,
        activity_logger: ActivityLogger,
    ) -> CoreResult<Self> {
        let event_bus = Arc::new(EventBus::new(settings.conversation.event_capacity));

        let conversations = ConversationService::new(
            conversation_store,
            llm,
            event_bus.clone(),
            activity_logger.clone(),
            settings.conversation.clone(),
        );
        let entities = EntityService::new(
            entity_store,
            activity_logger.clone(),
            settings.entities.clone(),
        )?;

        Ok(Self {
            db_pool,
            settings,
            event_bus,
            activity_logger,
            conversations,
            entities,
        })
    }
}
