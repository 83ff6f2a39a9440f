#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

use research_core::config::Settings;
use research_core::models::ChatMessage;
use research_core::services::{LlmProvider, TextStream};
use research_core::{AppState, CoreError, CoreResult};

/// What the fake model does for one call.
pub enum Script {
    Reply(Vec<&'static str>),
    FailMidway(Vec<&'static str>, &'static str),
    FailStart(&'static str),
    Hang,
    Gated(Arc<Notify>, Vec<&'static str>),
}

/// Replays scripted streams in order and records every prompt it receives.
#[derive(Default)]
pub struct ScriptedLlm {
    scripts: Mutex<VecDeque<Script>>,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedLlm {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn prompts(&self) -> Vec<Vec<ChatMessage>> {
        self.prompts.lock().clone()
    }
}

fn owned(parts: Vec<&'static str>) -> Vec<CoreResult<String>> {
    parts.into_iter().map(|p| Ok(p.to_string())).collect()
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn generate_stream(&self, messages: &[ChatMessage]) -> CoreResult<TextStream> {
        self.prompts.lock().push(messages.to_vec());

        let script = self
            .scripts
            .lock()
            .pop_front()
            .ok_or_else(|| CoreError::LlmError("no scripted reply left".into()))?;

        match script {
            Script::Reply(parts) => Ok(Box::pin(stream::iter(owned(parts)))),
            Script::FailMidway(parts, message) => {
                let mut items = owned(parts);
                items.push(Err(CoreError::LlmError(message.to_string())));
                Ok(Box::pin(stream::iter(items)))
            }
            Script::FailStart(message) => Err(CoreError::LlmError(message.to_string())),
            Script::Hang => Ok(Box::pin(stream::pending::<CoreResult<String>>())),
            Script::Gated(gate, parts) => Ok(Box::pin(async_stream::stream! {
                gate.notified().await;
                for part in parts {
                    yield Ok::<String, CoreError>(part.to_string());
                }
            })),
        }
    }

    async fn generate(&self, _messages: &[ChatMessage]) -> CoreResult<String> {
        Err(CoreError::LlmError("not scripted".into()))
    }
}

pub fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.conversation.system_prompt = "You are a careful research assistant.".to_string();
    settings.logging.activity_worker_count = 1;
    settings
}

pub fn app(llm: Arc<ScriptedLlm>) -> AppState {
    app_with(settings(), llm)
}

pub fn app_with(settings: Settings, llm: Arc<ScriptedLlm>) -> AppState {
    AppState::in_memory(settings, llm).expect("in-memory state")
}
