use futures::{Stream, StreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::models::ConversationId;
use crate::services::event_bus::{EventBus, StreamEvent};
use crate::utils::error::{CoreError, CoreResult};

/// Final text of a streamed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledResponse {
    pub content: String,
    pub chunk_count: usize,
}

/// Accumulates streamed deltas into a reply while relaying each delta to the
/// conversation's live subscribers.
///
/// The assembler never publishes `done` on its own. The caller does that via
/// [`ResponseAssembler::complete`] once the reply is safely stored, so a
/// subscriber can never see `done` followed by `error`.
pub struct ResponseAssembler {
    conversation_id: ConversationId,
    bus: Arc<EventBus>,
    buffer: String,
    chunk_count: usize,
    finished: bool,
}

impl ResponseAssembler {
    pub fn new(conversation_id: ConversationId, bus: Arc<EventBus>) -> Self {
        Self {
            conversation_id,
            bus,
            buffer: String::new(),
            chunk_count: 0,
            finished: false,
        }
    }

    /// Drain `stream` until it ends or fails.
    pub async fn assemble<S>(&mut self, stream: S) -> CoreResult<AssembledResponse>
    where
        S: Stream<Item = CoreResult<String>> + Send,
    {
        let mut stream = std::pin::pin!(stream);

        while let Some(item) = stream.next().await {
            match item {
                Ok(delta) => self.push(delta),
                Err(e) => {
                    warn!(
                        conversation_id = self.conversation_id,
                        "LLM stream failed after {} chunks: {}", self.chunk_count, e
                    );
                    self.fail(&e.to_string());
                    return Err(e);
                }
            }
        }

        if self.buffer.trim().is_empty() {
            let e = CoreError::LlmError("LLM returned an empty response".to_string());
            self.fail(&e.to_string());
            return Err(e);
        }

        debug!(
            conversation_id = self.conversation_id,
            "Assembled response from {} chunks ({} bytes)",
            self.chunk_count,
            self.buffer.len()
        );

        Ok(AssembledResponse {
            content: self.buffer.clone(),
            chunk_count: self.chunk_count,
        })
    }

    fn push(&mut self, delta: String) {
        if delta.is_empty() || self.finished {
            return;
        }
        self.buffer.push_str(&delta);
        self.chunk_count += 1;
        self.bus.publish(
            self.conversation_id,
            StreamEvent::Chunk { content: delta },
        );
    }

    /// Text received so far.
    pub fn partial(&self) -> &str {
        &self.buffer
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// Publish the terminal `done` event. No-op once a terminal event was sent.
    pub fn complete(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.bus.publish(self.conversation_id, StreamEvent::Done);
    }

    /// Publish the terminal `error` event. No-op once a terminal event was sent.
    pub fn fail(&mut self, message: &str) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.bus.publish(
            self.conversation_id,
            StreamEvent::Error {
                content: message.to_string(),
            },
        );
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn ok(parts: &[&str]) -> Vec<CoreResult<String>> {
        parts.iter().map(|p| Ok(p.to_string())).collect()
    }

    async fn drain(sub: &mut crate::services::event_bus::Subscription, n: usize) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for _ in 0..n {
            events.push(sub.recv().await.unwrap());
        }
        events
    }

    #[tokio::test]
    async fn test_relays_chunks_then_done() {
        let bus = Arc::new(EventBus::new(16));
        let mut sub = bus.subscribe(1);
        let mut assembler = ResponseAssembler::new(1, bus.clone());

        let out = assembler
            .assemble(stream::iter(ok(&["Hel", "", "lo", " world"])))
            .await
            .unwrap();
        assembler.complete();

        assert_eq!(out.content, "Hello world");
        assert_eq!(out.chunk_count, 3);

        let events = drain(&mut sub, 4).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Chunk { content: "Hel".into() },
                StreamEvent::Chunk { content: "lo".into() },
                StreamEvent::Chunk { content: " world".into() },
                StreamEvent::Done,
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_failure_publishes_error_once() {
        let bus = Arc::new(EventBus::new(16));
        let mut sub = bus.subscribe(2);
        let mut assembler = ResponseAssembler::new(2, bus.clone());

        let items = vec![
            Ok("partial".to_string()),
            Err(CoreError::LlmError("connection reset".into())),
        ];
        let err = assembler.assemble(stream::iter(items)).await.unwrap_err();
        assert!(matches!(err, CoreError::LlmError(_)));
        assert_eq!(assembler.partial(), "partial");

        assembler.complete();
        assembler.fail("again");

        let events = drain(&mut sub, 2).await;
        assert_eq!(events[0], StreamEvent::Chunk { content: "partial".into() });
        assert!(matches!(&events[1], StreamEvent::Error { content } if content.contains("connection reset")));
        assert_eq!(bus.publish(2, StreamEvent::Done), 1);
        assert_eq!(sub.recv().await, Some(StreamEvent::Done));
    }

    #[tokio::test]
    async fn test_empty_reply_is_an_error() {
        let bus = Arc::new(EventBus::new(16));
        let mut assembler = ResponseAssembler::new(3, bus);

        let err = assembler
            .assemble(stream::iter(ok(&["", "  "])))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::LlmError(_)));
        assert!(assembler.is_finished());
    }

    #[tokio::test]
    async fn test_works_without_subscribers() {
        let bus = Arc::new(EventBus::new(16));
        let mut assembler = ResponseAssembler::new(4, bus);

        let out = assembler.assemble(stream::iter(ok(&["a", "b"]))).await.unwrap();
        assert_eq!(out.content, "ab");
    }
}
