use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::models::ChatMessage;
use crate::utils::error::{CoreError, CoreResult};

/// Incremental text deltas produced by a model.
pub type TextStream = Pin<Box<dyn Stream<Item = CoreResult<String>> + Send>>;

/// Seam between the conversation pipeline and a concrete model backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stream the reply as text deltas.
    async fn generate_stream(&self, messages: &[ChatMessage]) -> CoreResult<TextStream>;

    /// Wait for the whole reply.
    async fn generate(&self, messages: &[ChatMessage]) -> CoreResult<String>;
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub max_tokens: usize,
    pub temperature: f32,
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChoiceChunk>,
}

#[derive(Debug, Deserialize)]
pub struct ChoiceChunk {
    #[serde(default)]
    pub delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
pub struct Delta {
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: serde_json::Value,
}

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Delta(String),
    Done,
    Error(String),
}

/// Line-buffered decoder for `data: {...}` event streams.
///
/// Network chunks may split a line (or a multi-byte character) anywhere, so
/// bytes are held until a full line is available.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = Self::parse_line(line.trim_end_matches(['\n', '\r'])) {
                events.push(event);
            }
        }
        events
    }

    /// Decode whatever is left once the byte stream ends.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest);
        Self::parse_line(line.trim())
    }

    fn parse_line(line: &str) -> Option<SseEvent> {
        let payload = line.strip_prefix("data:")?.trim_start();

        if payload.is_empty() {
            return None;
        }
        if payload == "[DONE]" {
            return Some(SseEvent::Done);
        }

        if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(payload) {
            let message = envelope
                .error
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| envelope.error.to_string());
            return Some(SseEvent::Error(message));
        }

        if let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(payload) {
            let choice = chunk.choices.into_iter().next()?;
            return match choice.delta.content {
                Some(content) if !content.is_empty() => Some(SseEvent::Delta(content)),
                _ => None,
            };
        }

        debug!("Skipping unrecognised stream line: {}", payload);
        None
    }
}

/// Client for OpenAI-compatible `/v1/chat/completions` endpoints
/// (llama.cpp server, Ollama, vLLM, hosted APIs).
#[derive(Clone)]
pub struct LlmService {
    client: Client,
    config: LlmConfig,
}

impl LlmService {
    pub fn new(config: LlmConfig) -> CoreResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_seconds.min(30)))
            .build()
            .map_err(|e| CoreError::LlmError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    async fn send(&self, messages: &[ChatMessage], stream: bool) -> CoreResult<reqwest::Response> {
        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            stream,
        };

        let mut builder = self.client.post(self.endpoint()).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        if !stream {
            builder = builder.timeout(Duration::from_secs(self.config.timeout_seconds));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| CoreError::LlmError(format!("Failed to call LLM API: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::LlmError(format!(
                "LLM API error: {} - {}",
                status, body
            )));
        }

        Ok(response)
    }

    /// Generate completion with streaming
    pub async fn chat_stream(&self, messages: &[ChatMessage]) -> CoreResult<TextStream> {
        debug!("Starting chat stream with {} messages", messages.len());

        let response = self.send(messages, true).await?;
        let mut bytes = Box::pin(response.bytes_stream());

        let stream = try_stream! {
            let mut decoder = SseDecoder::default();

            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| CoreError::LlmError(format!("Stream error: {}", e)))?;

                for event in decoder.feed(&chunk) {
                    match event {
                        SseEvent::Delta(text) => yield text,
                        SseEvent::Done => return,
                        SseEvent::Error(message) => {
                            Err::<(), CoreError>(CoreError::LlmError(message))?;
                        }
                    }
                }
            }

            match decoder.finish() {
                Some(SseEvent::Delta(text)) => yield text,
                Some(SseEvent::Error(message)) => {
                    Err::<(), CoreError>(CoreError::LlmError(message))?;
                }
                Some(SseEvent::Done) => {}
                None => warn!("LLM stream ended without a completion marker"),
            }
        };

        Ok(Box::pin(stream))
    }

    /// Generate completion without streaming (wait for full response)
    pub async fn generate_chat(&self, messages: &[ChatMessage]) -> CoreResult<String> {
        debug!("Starting chat generation with {} messages", messages.len());

        let response = self.send(messages, false).await?;

        #[derive(Deserialize)]
        struct ChatCompletionResponse {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: Message,
        }
        #[derive(Deserialize)]
        struct Message {
            content: String,
        }

        let chat_response: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| CoreError::LlmError(format!("Failed to parse LLM response: {}", e)))?;

        chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| CoreError::LlmError("No choices returned from LLM".to_string()))
    }
}

#[async_trait]
impl LlmProvider for LlmService {
    async fn generate_stream(&self, messages: &[ChatMessage]) -> CoreResult<TextStream> {
        self.chat_stream(messages).await
    }

    async fn generate(&self, messages: &[ChatMessage]) -> CoreResult<String> {
        self.generate_chat(messages).await
    }
}
