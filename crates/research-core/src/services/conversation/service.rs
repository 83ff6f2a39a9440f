use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::assembler::ResponseAssembler;
use super::memory::ConversationMemory;
use super::registry::{TurnPhase, TurnRegistry};
use crate::config::ConversationConfig;
use crate::database::ConversationStore;
use crate::logging::{ActivityLog, ActivityLogger, ActivityStatus, ActivityType};
use crate::models::{Conversation, ConversationId, ConversationMetadata, Message, NewMessage, Role};
use crate::services::event_bus::{EventBus, Subscription};
use crate::services::llm_service::LlmProvider;
use crate::utils::error::{CoreError, CoreResult};

/// Derives key findings from a finished exchange. Plugged into
/// [`ConversationService::with_finding_extractor`].
#[async_trait]
pub trait FindingExtractor: Send + Sync {
    async fn extract(&self, user_text: &str, reply: &str) -> CoreResult<Vec<String>>;
}

/// Stages of a chat turn, used to tag failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStep {
    LoadHistory,
    PersistUserMessage,
    LlmStream,
    PersistAssistantMessage,
    UpdateMetadata,
}

impl TurnStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoadHistory => "load_history",
            Self::PersistUserMessage => "persist_user_message",
            Self::LlmStream => "llm_stream",
            Self::PersistAssistantMessage => "persist_assistant_message",
            Self::UpdateMetadata => "update_metadata",
        }
    }
}

/// Result of a successful turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub user_message: Message,
    pub assistant_message: Message,
    /// Token cost of the prompt actually sent.
    pub prompt_tokens: usize,
    /// History messages left out of the prompt.
    pub dropped_messages: usize,
    pub chunk_count: usize,
}

/// Runs chat turns: history replay, token-budgeted prompt, streamed reply,
/// persistence. At most one turn per conversation is in flight.
#[derive(Clone)]
pub struct ConversationService {
    store: Arc<dyn ConversationStore>,
    llm: Arc<dyn LlmProvider>,
    bus: Arc<EventBus>,
    turns: TurnRegistry,
    logger: ActivityLogger,
    config: ConversationConfig,
    extractor: Option<Arc<dyn FindingExtractor>>,
}

impl ConversationService {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        llm: Arc<dyn LlmProvider>,
        bus: Arc<EventBus>,
        logger: ActivityLogger,
        config: ConversationConfig,
    ) -> Self {
        info!(
            "Initializing ConversationService: budget={} tokens, policy={:?}, timeout={}s",
            config.token_budget, config.trim_policy, config.turn_timeout_seconds
        );

        Self {
            store,
            llm,
            bus,
            turns: TurnRegistry::new(),
            logger,
            config,
            extractor: None,
        }
    }

    pub fn with_finding_extractor(mut self, extractor: Arc<dyn FindingExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn config(&self) -> &ConversationConfig {
        &self.config
    }

    pub async fn create_conversation(
        &self,
        project_id: Uuid,
        name: Option<&str>,
    ) -> CoreResult<Conversation> {
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.config.default_conversation_name);

        let conversation = self
            .store
            .create_conversation(project_id, name, &ConversationMetadata::default())
            .await?;

        info!(
            conversation_id = conversation.id,
            "Created conversation '{}' in project {}", conversation.name, project_id
        );
        self.logger.log(
            ActivityLog::builder(ActivityType::ConversationCreated)
                .conversation(conversation.id)
                .custom("project_id", project_id.to_string())
                .build(),
        );

        Ok(conversation)
    }

    pub async fn get_conversation(&self, conversation_id: ConversationId) -> CoreResult<Conversation> {
        self.store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("conversation {}", conversation_id)))
    }

    pub async fn list_conversations(&self, project_id: Uuid) -> CoreResult<Vec<Conversation>> {
        self.store.list_conversations(project_id).await
    }

    /// Full persisted log, oldest first. Not trimmed.
    pub async fn get_conversation_history(
        &self,
        conversation_id: ConversationId,
    ) -> CoreResult<Vec<Message>> {
        self.get_conversation(conversation_id).await?;
        self.store.list_messages(conversation_id).await
    }

    /// Live chunk/done/error events for the conversation.
    pub fn subscribe(&self, conversation_id: ConversationId) -> Subscription {
        self.bus.subscribe(conversation_id)
    }

    pub fn turn_state(&self, conversation_id: ConversationId) -> TurnPhase {
        self.turns.phase(conversation_id)
    }

    /// Run one chat turn. Rejects with `ConversationBusy` while another turn
    /// for the same conversation is in flight.
    pub async fn process_message(
        &self,
        conversation_id: ConversationId,
        user_text: &str,
    ) -> CoreResult<TurnOutcome> {
        let user_text = user_text.trim();
        if user_text.is_empty() {
            return Err(CoreError::Validation("message must not be empty".to_string()));
        }

        let guard = match self.turns.try_begin(conversation_id) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(conversation_id, "Rejected turn: {}", e);
                self.logger.log(
                    ActivityLog::builder(ActivityType::TurnRejected)
                        .conversation(conversation_id)
                        .status(ActivityStatus::Warning)
                        .error(&e)
                        .build(),
                );
                return Err(e);
            }
        };

        let started = Instant::now();
        let mut assembler = ResponseAssembler::new(conversation_id, Arc::clone(&self.bus));
        let mut step = TurnStep::LoadHistory;

        // The watchdog covers everything up to the stored reply. On expiry the
        // turn future is dropped, so nothing it started can land later.
        let timeout_secs = self.config.turn_timeout_seconds;
        let result = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.run_turn(conversation_id, user_text, &mut assembler, &mut step),
        )
        .await;
        let result = result.unwrap_or(Err(CoreError::Timeout(timeout_secs)));

        match result {
            Ok(outcome) => {
                self.update_metadata(conversation_id, user_text, &outcome.assistant_message.content)
                    .await;
                assembler.complete();

                info!(
                    conversation_id,
                    prompt_tokens = outcome.prompt_tokens,
                    dropped = outcome.dropped_messages,
                    "Turn completed in {:?}",
                    started.elapsed()
                );
                self.logger.log(
                    ActivityLog::builder(ActivityType::ResponseCompleted)
                        .conversation(conversation_id)
                        .duration_ms(started.elapsed().as_millis())
                        .custom("prompt_tokens", outcome.prompt_tokens)
                        .custom("chunk_count", outcome.chunk_count)
                        .build(),
                );

                drop(guard);
                Ok(outcome)
            }
            Err(e) => {
                guard.mark_error();
                assembler.fail(&e.to_string());

                error!(
                    conversation_id,
                    step = step.as_str(),
                    "Turn failed: {}",
                    e
                );
                self.logger.log(
                    ActivityLog::builder(ActivityType::TurnFailed)
                        .conversation(conversation_id)
                        .duration_ms(started.elapsed().as_millis())
                        .custom("step", step.as_str())
                        .error(&e)
                        .build(),
                );

                drop(guard);
                Err(e)
            }
        }
    }

    /// Run the turn on its own task so it completes (and persists the reply)
    /// even if the caller goes away.
    pub fn spawn_message(
        &self,
        conversation_id: ConversationId,
        user_text: String,
    ) -> JoinHandle<CoreResult<TurnOutcome>> {
        let service = self.clone();
        tokio::spawn(async move { service.process_message(conversation_id, &user_text).await })
    }

    /// Steps 1-7 of a turn. `step` always names the step in progress.
    async fn run_turn(
        &self,
        conversation_id: ConversationId,
        user_text: &str,
        assembler: &mut ResponseAssembler,
        step: &mut TurnStep,
    ) -> CoreResult<TurnOutcome> {
        // 1. Rebuild the working copy from the persisted log
        *step = TurnStep::LoadHistory;
        self.get_conversation(conversation_id).await?;
        let history = self.store.list_messages(conversation_id).await?;

        // 2. The user's message is stored before the model is called
        *step = TurnStep::PersistUserMessage;
        let user_message = self
            .store
            .append_message(NewMessage::new(conversation_id, Role::User, user_text))
            .await?;

        self.logger.log(
            ActivityLog::builder(ActivityType::MessageReceived)
                .conversation(conversation_id)
                .status(ActivityStatus::Info)
                .custom("history_len", history.len())
                .build(),
        );

        // 3-4. Prompt = system prompt + newest history within budget
        let mut memory = ConversationMemory::from_history(&history, self.config.trim_policy);
        memory.append(Role::User, user_text);
        memory.ensure_system_prompt(&self.config.system_prompt);

        let trimmed = memory.trim_to_budget(self.config.token_budget);
        if trimmed.dropped > 0 {
            self.logger.log(
                ActivityLog::builder(ActivityType::PromptTrimmed)
                    .conversation(conversation_id)
                    .status(ActivityStatus::Info)
                    .custom("dropped", trimmed.dropped)
                    .custom("kept", trimmed.messages.len())
                    .custom("total_tokens", trimmed.total_tokens)
                    .build(),
            );
        }
        debug!(
            conversation_id,
            step = TurnStep::LlmStream.as_str(),
            "Sending {} messages ({} tokens) to LLM",
            trimmed.messages.len(),
            trimmed.total_tokens
        );

        // 5-6. Stream the reply
        *step = TurnStep::LlmStream;
        let stream = self.llm.generate_stream(&trimmed.messages).await?;
        let assembled = assembler.assemble(stream).await?;

        // 7. Persist the finished reply
        *step = TurnStep::PersistAssistantMessage;
        let assistant_message = self
            .store
            .append_message(
                NewMessage::new(conversation_id, Role::Assistant, assembled.content.as_str())
                    .with_metadata("prompt_tokens", trimmed.total_tokens)
                    .with_metadata("dropped_messages", trimmed.dropped)
                    .with_metadata("chunk_count", assembled.chunk_count),
            )
            .await?;

        Ok(TurnOutcome {
            user_message,
            assistant_message,
            prompt_tokens: trimmed.total_tokens,
            dropped_messages: trimmed.dropped,
            chunk_count: assembled.chunk_count,
        })
    }

    /// Findings and `updated_at` refresh after the reply is stored. Bounded
    /// by its own turn timeout. Failures are only logged.
    async fn update_metadata(&self, conversation_id: ConversationId, user_text: &str, reply: &str) {
        let timeout_secs = self.config.turn_timeout_seconds;
        let result = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
            let findings = self.extract_findings(conversation_id, user_text, reply).await;

            // Re-read so metadata edits made during the turn are kept
            let mut metadata = self.get_conversation(conversation_id).await?.metadata;
            metadata.key_findings.extend(findings);
            self.store.update_conversation(conversation_id, &metadata).await
        })
        .await
        .unwrap_or(Err(CoreError::Timeout(timeout_secs)));

        if let Err(e) = result {
            warn!(
                conversation_id,
                step = TurnStep::UpdateMetadata.as_str(),
                "Metadata update failed after reply was stored: {}",
                e
            );
            self.logger.log(
                ActivityLog::builder(ActivityType::MetadataUpdated)
                    .conversation(conversation_id)
                    .custom("step", TurnStep::UpdateMetadata.as_str())
                    .error(&e)
                    .status(ActivityStatus::Warning)
                    .build(),
            );
        }
    }

    async fn extract_findings(
        &self,
        conversation_id: ConversationId,
        user_text: &str,
        reply: &str,
    ) -> Vec<String> {
        let Some(extractor) = &self.extractor else {
            return Vec::new();
        };

        match extractor.extract(user_text, reply).await {
            Ok(findings) => findings
                .into_iter()
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect(),
            Err(e) => {
                // Findings are optional; the turn still succeeds
                warn!(conversation_id, "Key finding extraction failed: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn add_document_reference(
        &self,
        conversation_id: ConversationId,
        document_id: Uuid,
    ) -> CoreResult<Conversation> {
        let mut conversation = self.get_conversation(conversation_id).await?;
        if !conversation.metadata.add_document_reference(document_id) {
            return Ok(conversation);
        }

        conversation = self
            .store
            .update_conversation(conversation_id, &conversation.metadata)
            .await?;

        self.logger.log(
            ActivityLog::builder(ActivityType::MetadataUpdated)
                .conversation(conversation_id)
                .custom("document_id", document_id.to_string())
                .build(),
        );
        Ok(conversation)
    }

    pub async fn add_tags<I, S>(&self, conversation_id: ConversationId, tags: I) -> CoreResult<Conversation>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut conversation = self.get_conversation(conversation_id).await?;

        let mut changed = false;
        for tag in tags {
            let tag = tag.as_ref().trim();
            if !tag.is_empty() {
                changed |= conversation.metadata.tags.insert(tag.to_string());
            }
        }

        if !changed {
            return Ok(conversation);
        }

        conversation = self
            .store
            .update_conversation(conversation_id, &conversation.metadata)
            .await?;

        self.logger.log(
            ActivityLog::builder(ActivityType::MetadataUpdated)
                .conversation(conversation_id)
                .custom("tags", conversation.metadata.tags.len())
                .build(),
        );
        Ok(conversation)
    }

    /// Removes every conversation (and message) of the project.
    pub async fn delete_project(&self, project_id: Uuid) -> CoreResult<u64> {
        let removed = self.store.delete_project(project_id).await?;

        info!("Deleted {} conversations of project {}", removed, project_id);
        self.logger.log(
            ActivityLog::builder(ActivityType::ProjectDeleted)
                .custom("project_id", project_id.to_string())
                .custom("conversations", removed)
                .build(),
        );
        Ok(removed)
    }

    /// Force-release turn registrations older than twice the turn timeout.
    pub fn cleanup_stale_turns(&self) -> usize {
        let max_age = Duration::from_secs(self.config.turn_timeout_seconds.saturating_mul(2));
        let released = self.turns.cleanup_stale(max_age);

        if released > 0 {
            self.logger.log(
                ActivityLog::builder(ActivityType::StaleTurnReleased)
                    .status(ActivityStatus::Warning)
                    .custom("released", released)
                    .build(),
            );
        }
        released
    }

    /// Background task calling [`Self::cleanup_stale_turns`] once per turn timeout.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let service = self.clone();
        let period = Duration::from_secs(self.config.turn_timeout_seconds.max(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                service.cleanup_stale_turns();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::MemoryStore;
    use crate::logging::{LoggerConfig, TracingActivitySink};
    use crate::services::event_bus::StreamEvent;
    use crate::services::llm_service::{MockLlmProvider, TextStream};
    use futures::stream;

    fn config() -> ConversationConfig {
        ConversationConfig {
            system_prompt: "You are a research assistant.".to_string(),
            turn_timeout_seconds: 5,
            ..ConversationConfig::default()
        }
    }

    fn service_over(
        store: Arc<dyn ConversationStore>,
        llm: MockLlmProvider,
        config: ConversationConfig,
    ) -> ConversationService {
        let logger = ActivityLogger::new(
            Arc::new(TracingActivitySink),
            LoggerConfig {
                worker_count: 1,
                ..LoggerConfig::default()
            },
        );
        ConversationService::new(store, Arc::new(llm), Arc::new(EventBus::new(64)), logger, config)
    }

    fn service_with(llm: MockLlmProvider) -> (ConversationService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (service_over(store.clone(), llm, config()), store)
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Fault {
        UserAppend,
        AssistantAppend,
        AssistantAppendHangs,
        MetadataUpdate,
    }

    /// MemoryStore with one injected failure.
    struct FaultyStore {
        inner: MemoryStore,
        fault: Fault,
    }

    #[async_trait]
    impl ConversationStore for FaultyStore {
        async fn create_conversation(
            &self,
            project_id: Uuid,
            name: &str,
            metadata: &ConversationMetadata,
        ) -> CoreResult<Conversation> {
            self.inner.create_conversation(project_id, name, metadata).await
        }

        async fn get_conversation(&self, id: ConversationId) -> CoreResult<Option<Conversation>> {
            self.inner.get_conversation(id).await
        }

        async fn list_conversations(&self, project_id: Uuid) -> CoreResult<Vec<Conversation>> {
            self.inner.list_conversations(project_id).await
        }

        async fn update_conversation(
            &self,
            id: ConversationId,
            metadata: &ConversationMetadata,
        ) -> CoreResult<Conversation> {
            if self.fault == Fault::MetadataUpdate {
                return Err(CoreError::DatabaseError("update failed".into()));
            }
            self.inner.update_conversation(id, metadata).await
        }

        async fn append_message(&self, message: NewMessage) -> CoreResult<Message> {
            match (self.fault, message.role) {
                (Fault::UserAppend, Role::User) | (Fault::AssistantAppend, Role::Assistant) => {
                    Err(CoreError::DatabaseError("insert failed".into()))
                }
                (Fault::AssistantAppendHangs, Role::Assistant) => futures::future::pending().await,
                _ => self.inner.append_message(message).await,
            }
        }

        async fn list_messages(&self, conversation_id: ConversationId) -> CoreResult<Vec<Message>> {
            self.inner.list_messages(conversation_id).await
        }

        async fn delete_project(&self, project_id: Uuid) -> CoreResult<u64> {
            self.inner.delete_project(project_id).await
        }
    }

    fn faulty(fault: Fault, llm: MockLlmProvider, timeout_secs: u64) -> ConversationService {
        let store = Arc::new(FaultyStore {
            inner: MemoryStore::new(),
            fault,
        });
        let config = ConversationConfig {
            turn_timeout_seconds: timeout_secs,
            ..config()
        };
        service_over(store, llm, config)
    }

    fn answering(parts: &'static [&'static str]) -> MockLlmProvider {
        let mut llm = MockLlmProvider::new();
        llm.expect_generate_stream().returning(move |_| Ok(chunks(parts)));
        llm
    }

    async fn drain(sub: &mut Subscription) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = sub.recv().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }

    fn chunks(parts: &'static [&'static str]) -> TextStream {
        Box::pin(stream::iter(parts.iter().map(|p| Ok(p.to_string()))))
    }

    #[tokio::test]
    async fn test_turn_sends_system_prompt_first() {
        let mut llm = MockLlmProvider::new();
        llm.expect_generate_stream()
            .withf(|messages| {
                messages.first().map(|m| m.role) == Some(Role::System)
                    && messages.last().map(|m| m.content.as_str()) == Some("Who owns Acme?")
            })
            .times(1)
            .returning(|_| Ok(chunks(&["Jane ", "Doe."])));

        let (service, _) = service_with(llm);
        let conv = service.create_conversation(Uuid::new_v4(), None).await.unwrap();
        assert_eq!(conv.name, "New Conversation");

        let mut sub = service.subscribe(conv.id);
        let outcome = service.process_message(conv.id, "Who owns Acme?").await.unwrap();
        assert_eq!(outcome.assistant_message.content, "Jane Doe.");

        assert_eq!(sub.recv().await, Some(StreamEvent::Chunk { content: "Jane ".into() }));
        assert_eq!(sub.recv().await, Some(StreamEvent::Chunk { content: "Doe.".into() }));
        assert_eq!(sub.recv().await, Some(StreamEvent::Done));
        assert_eq!(service.turn_state(conv.id), TurnPhase::Idle);
    }

    #[tokio::test]
    async fn test_llm_failure_keeps_user_message_only() {
        let mut llm = MockLlmProvider::new();
        llm.expect_generate_stream()
            .returning(|_| Err(CoreError::LlmError("connection refused".into())));

        let (service, _) = service_with(llm);
        let conv = service.create_conversation(Uuid::new_v4(), Some("Research")).await.unwrap();
        let mut sub = service.subscribe(conv.id);

        let err = service.process_message(conv.id, "hello").await.unwrap_err();
        assert!(matches!(err, CoreError::LlmError(_)));

        let history = service.get_conversation_history(conv.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
        assert!(matches!(sub.recv().await, Some(StreamEvent::Error { .. })));
        assert_eq!(service.turn_state(conv.id), TurnPhase::Idle);
    }

    #[tokio::test]
    async fn test_blank_message_is_rejected_before_anything_is_stored() {
        let (service, store) = service_with(MockLlmProvider::new());
        let conv = service.create_conversation(Uuid::new_v4(), None).await.unwrap();

        let err = service.process_message(conv.id, "   ").await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        assert!(store.list_messages(conv.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_conversation() {
        let (service, _) = service_with(MockLlmProvider::new());
        let err = service.process_message(999, "hi").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
        assert!(matches!(
            service.get_conversation_history(999).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_metadata_bag_updates() {
        let (service, _) = service_with(MockLlmProvider::new());
        let conv = service.create_conversation(Uuid::new_v4(), None).await.unwrap();
        let doc = Uuid::new_v4();

        service.add_document_reference(conv.id, doc).await.unwrap();
        let conv2 = service.add_document_reference(conv.id, doc).await.unwrap();
        assert_eq!(conv2.metadata.document_references, vec![doc]);

        let conv3 = service.add_tags(conv.id, ["mergers", " ", "mergers", "q3"]).await.unwrap();
        assert_eq!(conv3.metadata.tags.len(), 2);
        assert!(conv3.updated_at >= conv.updated_at);
    }

    #[tokio::test]
    async fn test_user_message_write_failure_skips_llm() {
        let mut llm = MockLlmProvider::new();
        llm.expect_generate_stream().times(0);
        let service = faulty(Fault::UserAppend, llm, 5);
        let conv = service.create_conversation(Uuid::new_v4(), None).await.unwrap();
        let mut sub = service.subscribe(conv.id);

        let err = service.process_message(conv.id, "Who audits Acme?").await.unwrap_err();
        assert!(matches!(err, CoreError::DatabaseError(_)));

        assert!(service.get_conversation_history(conv.id).await.unwrap().is_empty());
        assert!(matches!(drain(&mut sub).await.as_slice(), [StreamEvent::Error { .. }]));
        assert_eq!(service.turn_state(conv.id), TurnPhase::Idle);
    }

    #[tokio::test]
    async fn test_reply_write_failure_reports_error() {
        let service = faulty(Fault::AssistantAppend, answering(&["Deloitte."]), 5);
        let conv = service.create_conversation(Uuid::new_v4(), None).await.unwrap();
        let mut sub = service.subscribe(conv.id);

        let err = service.process_message(conv.id, "Who audits Acme?").await.unwrap_err();
        assert!(matches!(err, CoreError::DatabaseError(_)));

        let history = service.get_conversation_history(conv.id).await.unwrap();
        let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User]);

        let events = drain(&mut sub).await;
        assert_eq!(events[0], StreamEvent::Chunk { content: "Deloitte.".into() });
        assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
        assert_eq!(service.turn_state(conv.id), TurnPhase::Idle);
    }

    #[tokio::test]
    async fn test_metadata_failure_after_stored_reply_still_completes() {
        let service = faulty(Fault::MetadataUpdate, answering(&["answer"]), 5);
        let conv = service.create_conversation(Uuid::new_v4(), None).await.unwrap();
        let mut sub = service.subscribe(conv.id);

        let outcome = service.process_message(conv.id, "question").await.unwrap();
        assert_eq!(outcome.assistant_message.content, "answer");

        let history = service.get_conversation_history(conv.id).await.unwrap();
        let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);

        assert_eq!(
            drain(&mut sub).await,
            vec![StreamEvent::Chunk { content: "answer".into() }, StreamEvent::Done]
        );
        assert_eq!(service.turn_state(conv.id), TurnPhase::Idle);
    }

    #[tokio::test]
    async fn test_watchdog_covers_hung_reply_write() {
        let service = faulty(Fault::AssistantAppendHangs, answering(&["answer"]), 1);
        let conv = service.create_conversation(Uuid::new_v4(), None).await.unwrap();
        let mut sub = service.subscribe(conv.id);

        let err = tokio::time::timeout(
            Duration::from_secs(3),
            service.process_message(conv.id, "question"),
        )
        .await
        .expect("watchdog must end the turn")
        .unwrap_err();
        assert!(matches!(err, CoreError::Timeout(1)));

        assert!(matches!(drain(&mut sub).await.last(), Some(StreamEvent::Error { .. })));
        assert_eq!(service.turn_state(conv.id), TurnPhase::Idle);

        // The abandoned write never lands
        tokio::time::sleep(Duration::from_millis(50)).await;
        let history = service.get_conversation_history(conv.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
    }
}
