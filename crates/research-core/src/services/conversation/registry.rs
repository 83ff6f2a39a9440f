use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::models::ConversationId;
use crate::utils::error::{CoreError, CoreResult};

/// Per-conversation turn state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Idle,
    Processing,
    Error,
}

#[derive(Debug, Clone)]
struct ActiveTurn {
    turn_id: u64,
    phase: TurnPhase,
    started_at: Instant,
}

/// Tracks which conversations currently have a turn in flight.
///
/// A conversation with no entry is `Idle`. Entries are owned by a
/// [`TurnGuard`]; dropping the guard returns the conversation to `Idle`.
#[derive(Clone, Default)]
pub struct TurnRegistry {
    turns: Arc<DashMap<ConversationId, ActiveTurn>>,
    next_turn: Arc<AtomicU64>,
}

impl TurnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the conversation for a new turn, or fail with `ConversationBusy`.
    pub fn try_begin(&self, conversation_id: ConversationId) -> CoreResult<TurnGuard> {
        match self.turns.entry(conversation_id) {
            Entry::Occupied(_) => Err(CoreError::ConversationBusy(conversation_id)),
            Entry::Vacant(slot) => {
                let turn_id = self.next_turn.fetch_add(1, Ordering::Relaxed);
                slot.insert(ActiveTurn {
                    turn_id,
                    phase: TurnPhase::Processing,
                    started_at: Instant::now(),
                });
                debug!(conversation_id, turn_id, "Turn started");
                Ok(TurnGuard {
                    turns: Arc::clone(&self.turns),
                    conversation_id,
                    turn_id,
                })
            }
        }
    }

    pub fn phase(&self, conversation_id: ConversationId) -> TurnPhase {
        self.turns
            .get(&conversation_id)
            .map(|turn| turn.phase)
            .unwrap_or(TurnPhase::Idle)
    }

    /// Number of conversations with a turn in flight.
    pub fn active(&self) -> usize {
        self.turns.len()
    }

    /// Force-release registrations older than `max_age`.
    /// Returns number of turns released.
    pub fn cleanup_stale(&self, max_age: Duration) -> usize {
        let start_len = self.turns.len();
        self.turns.retain(|conversation_id, turn| {
            let keep = turn.started_at.elapsed() < max_age;
            if !keep {
                warn!(
                    conversation_id = *conversation_id,
                    turn_id = turn.turn_id,
                    "Releasing stale turn after {:?}",
                    turn.started_at.elapsed()
                );
            }
            keep
        });
        let count = start_len.saturating_sub(self.turns.len());

        if count > 0 {
            info!("Released {} stale turns", count);
        }

        count
    }
}

/// Exclusive claim on one conversation's turn.
pub struct TurnGuard {
    turns: Arc<DashMap<ConversationId, ActiveTurn>>,
    conversation_id: ConversationId,
    turn_id: u64,
}

impl TurnGuard {
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// Move the turn into `Error`. The conversation returns to `Idle` when
    /// the guard is dropped.
    pub fn mark_error(&self) {
        if let Some(mut turn) = self.turns.get_mut(&self.conversation_id) {
            if turn.turn_id == self.turn_id {
                turn.phase = TurnPhase::Error;
            }
        }
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        let turn_id = self.turn_id;
        // The sweeper may already have released this turn and a newer one
        // may own the slot.
        self.turns
            .remove_if(&self.conversation_id, |_, turn| turn.turn_id == turn_id);
        debug!(conversation_id = self.conversation_id, turn_id, "Turn finished");
    }
}
