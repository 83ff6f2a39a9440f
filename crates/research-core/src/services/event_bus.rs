use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::models::ConversationId;

/// Message pushed to a live client while a turn is running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Chunk { content: String },
    /// Sent instead of the chunks a slow subscriber missed. Replaces the
    /// client's partial text; later chunks continue from it.
    Resync { content: String },
    Done,
    Error { content: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }
}

/// What actually travels on the broadcast channel. `offset` is the byte
/// length of the turn's partial text once this event is applied.
#[derive(Debug, Clone)]
struct Envelope {
    turn: u64,
    offset: usize,
    event: StreamEvent,
}

#[derive(Debug, Default)]
struct TurnText {
    turn: u64,
    partial: String,
    /// Full text of turn `turn - 1`.
    previous: String,
}

impl TurnText {
    fn text_of(&self, turn: u64) -> Option<&str> {
        if turn == self.turn {
            Some(&self.partial)
        } else if turn + 1 == self.turn {
            Some(&self.previous)
        } else {
            None
        }
    }
}

struct Channel {
    sender: broadcast::Sender<Envelope>,
    // Held while sending so offsets and stored text agree
    text: Mutex<TurnText>,
}

/// Registry of live-update channels, one broadcast channel per conversation.
///
/// Channels are created on the first subscription and removed as soon as the
/// last subscriber goes away. Each channel keeps the text of the running and
/// the previous turn so a subscriber that falls behind can be resynchronized.
pub struct EventBus {
    channels: DashMap<ConversationId, Channel>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Registers a subscriber. Dropping the returned handle deregisters it.
    pub fn subscribe(self: &Arc<Self>, conversation_id: ConversationId) -> Subscription {
        let receiver = self
            .channels
            .entry(conversation_id)
            .or_insert_with(|| Channel {
                sender: broadcast::channel(self.capacity).0,
                text: Mutex::new(TurnText::default()),
            })
            .sender
            .subscribe();

        debug!("Subscriber registered for conversation {}", conversation_id);

        Subscription {
            conversation_id,
            receiver: Some(receiver),
            pending: None,
            bus: Arc::clone(self),
        }
    }

    /// Returns the number of subscribers that received the event.
    pub fn publish(&self, conversation_id: ConversationId, event: StreamEvent) -> usize {
        let Some(channel) = self.channels.get(&conversation_id) else {
            return 0;
        };

        let mut text = channel.text.lock();
        match &event {
            StreamEvent::Chunk { content } => text.partial.push_str(content),
            StreamEvent::Resync { content } => text.partial = content.clone(),
            StreamEvent::Done | StreamEvent::Error { .. } => {}
        }
        let envelope = Envelope {
            turn: text.turn,
            offset: text.partial.len(),
            event,
        };
        if envelope.event.is_terminal() {
            let finished = std::mem::take(&mut text.partial);
            text.previous = finished;
            text.turn += 1;
        }

        match channel.sender.send(envelope) {
            Ok(count) => count,
            Err(_) => {
                debug!("No live subscriber for conversation {}", conversation_id);
                0
            }
        }
    }

    pub fn subscriber_count(&self, conversation_id: ConversationId) -> usize {
        self.channels
            .get(&conversation_id)
            .map(|channel| channel.sender.receiver_count())
            .unwrap_or(0)
    }

    /// Number of conversations with at least one registered channel.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Text of `turn` up to `offset`, if that turn is still known.
    fn text_until(&self, conversation_id: ConversationId, turn: u64, offset: usize) -> Option<String> {
        let channel = self.channels.get(&conversation_id)?;
        let text = channel.text.lock();
        let full = text.text_of(turn)?;
        Some(full.get(..offset).unwrap_or(full).to_string())
    }

    fn release(&self, conversation_id: ConversationId) {
        let removed = self
            .channels
            .remove_if(&conversation_id, |_, channel| channel.sender.receiver_count() == 0);

        if removed.is_some() {
            debug!("Channel for conversation {} closed", conversation_id);
        }
    }
}

/// Receiving side of a conversation's live-update channel.
pub struct Subscription {
    conversation_id: ConversationId,
    receiver: Option<broadcast::Receiver<Envelope>>,
    /// Terminal event held back behind a resync.
    pending: Option<StreamEvent>,
    bus: Arc<EventBus>,
}

impl Subscription {
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// Next event, or `None` once the channel is closed.
    ///
    /// A subscriber that fell behind gets one [`StreamEvent::Resync`] with
    /// the partial text in place of the chunks it missed.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if let Some(event) = self.pending.take() {
            return Some(event);
        }

        let mut lagged = false;
        loop {
            let received = self.receiver.as_mut()?.recv().await;
            let envelope = match received {
                Ok(envelope) => envelope,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Subscriber for conversation {} lagged, {} events skipped",
                        self.conversation_id, skipped
                    );
                    lagged = true;
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            };

            if !lagged {
                return Some(envelope.event);
            }

            // First event after the gap: rebuild the text it leaves behind
            let Some(content) =
                self.bus
                    .text_until(self.conversation_id, envelope.turn, envelope.offset)
            else {
                // Turn no longer known; wait for a newer one
                continue;
            };
            if envelope.event.is_terminal() {
                self.pending = Some(envelope.event);
            }
            return Some(StreamEvent::Resync { content });
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        drop(self.receiver.take());
        self.bus.release(self.conversation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let chunk = serde_json::to_value(StreamEvent::Chunk { content: "Hel".into() }).unwrap();
        assert_eq!(chunk, serde_json::json!({"type": "chunk", "content": "Hel"}));

        let done = serde_json::to_value(StreamEvent::Done).unwrap();
        assert_eq!(done, serde_json::json!({"type": "done"}));

        let error = serde_json::to_value(StreamEvent::Error { content: "boom".into() }).unwrap();
        assert_eq!(error, serde_json::json!({"type": "error", "content": "boom"}));

        let resync = serde_json::to_value(StreamEvent::Resync { content: "Hel".into() }).unwrap();
        assert_eq!(resync, serde_json::json!({"type": "resync", "content": "Hel"}));

        assert!(StreamEvent::Done.is_terminal());
        assert!(!StreamEvent::Chunk { content: "x".into() }.is_terminal());
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = Arc::new(EventBus::new(16));
        let mut sub = bus.subscribe(1);

        assert_eq!(bus.publish(1, StreamEvent::Chunk { content: "a".into() }), 1);
        assert_eq!(bus.publish(2, StreamEvent::Done), 0);

        assert_eq!(sub.recv().await, Some(StreamEvent::Chunk { content: "a".into() }));
    }

    #[tokio::test]
    async fn test_drop_deregisters_channel() {
        let bus = Arc::new(EventBus::new(16));
        let first = bus.subscribe(7);
        let second = bus.subscribe(7);
        assert_eq!(bus.subscriber_count(7), 2);

        drop(first);
        assert_eq!(bus.subscriber_count(7), 1);
        assert_eq!(bus.channel_count(), 1);

        drop(second);
        assert_eq!(bus.channel_count(), 0);
        assert_eq!(bus.publish(7, StreamEvent::Done), 0);
    }

    async fn collect_turn(sub: &mut Subscription) -> (String, StreamEvent) {
        let mut view = String::new();
        loop {
            match sub.recv().await.unwrap() {
                StreamEvent::Chunk { content } => view.push_str(&content),
                StreamEvent::Resync { content } => view = content,
                terminal => return (view, terminal),
            }
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_resynced() {
        let bus = Arc::new(EventBus::new(2));
        let mut sub = bus.subscribe(3);

        for part in ["The ", "merger ", "closed ", "in ", "Q3."] {
            bus.publish(3, StreamEvent::Chunk { content: part.into() });
        }
        assert_eq!(
            sub.recv().await,
            Some(StreamEvent::Resync { content: "The merger closed in ".into() })
        );
        assert_eq!(sub.recv().await, Some(StreamEvent::Chunk { content: "Q3.".into() }));

        bus.publish(3, StreamEvent::Done);
        assert_eq!(sub.recv().await, Some(StreamEvent::Done));
    }

    #[tokio::test]
    async fn test_resynced_view_matches_full_reply() {
        let bus = Arc::new(EventBus::new(3));
        let mut sub = bus.subscribe(4);

        let parts = ["Acme ", "hired ", "Jane ", "Doe ", "as ", "CFO."];
        for part in parts {
            bus.publish(4, StreamEvent::Chunk { content: part.into() });
        }
        bus.publish(4, StreamEvent::Done);

        let (view, terminal) = collect_turn(&mut sub).await;
        assert_eq!(view, parts.concat());
        assert_eq!(terminal, StreamEvent::Done);

        // Next turn starts from empty text
        bus.publish(4, StreamEvent::Chunk { content: "Next.".into() });
        bus.publish(4, StreamEvent::Done);
        let (view, _) = collect_turn(&mut sub).await;
        assert_eq!(view, "Next.");
    }
}
