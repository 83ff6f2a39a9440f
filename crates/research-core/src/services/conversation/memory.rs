use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{ChatMessage, Message, Role};

use super::token_counter::TokenCounter;

/// How older history is evicted once the budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrimPolicy {
    /// Keep the newest messages that fit; stop at the first one that does not.
    #[default]
    StrictRecency,
    /// Skip a message that does not fit but keep evaluating older ones, so a
    /// short old message may survive a long recent one.
    BestFit,
}

/// Result of [`ConversationMemory::trim_to_budget`].
#[derive(Debug, Clone)]
pub struct TrimOutcome {
    /// Chronological order, pinned system message first.
    pub messages: Vec<ChatMessage>,
    pub total_tokens: usize,
    /// Non-system messages left out.
    pub dropped: usize,
}

/// Working copy of one conversation's message log, used to build a prompt.
///
/// Rebuilt from the persisted log at the start of every turn.
#[derive(Debug, Clone, Default)]
pub struct ConversationMemory {
    messages: Vec<ChatMessage>,
    policy: TrimPolicy,
}

impl ConversationMemory {
    pub fn new(policy: TrimPolicy) -> Self {
        Self {
            messages: Vec::new(),
            policy,
        }
    }

    pub fn from_history(history: &[Message], policy: TrimPolicy) -> Self {
        Self {
            messages: history.iter().map(Message::to_chat).collect(),
            policy,
        }
    }

    pub fn append(&mut self, role: Role, content: impl Into<String>) {
        self.messages.push(ChatMessage::new(role, content));
    }

    /// Pins `prompt` as the first message unless the log already starts
    /// with that exact system message.
    pub fn ensure_system_prompt(&mut self, prompt: &str) {
        let already_pinned = self
            .messages
            .first()
            .map(|m| m.role == Role::System && m.content == prompt)
            .unwrap_or(false);

        if !already_pinned {
            self.messages.insert(0, ChatMessage::system(prompt));
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn policy(&self) -> TrimPolicy {
        self.policy
    }

    pub fn total_tokens(&self) -> usize {
        TokenCounter::count_messages(&self.messages)
    }

    /// Reduces the log to at most `max_tokens`.
    ///
    /// A leading system message is always kept, even if it alone exceeds the
    /// budget. Without one, the newest message is kept when nothing else
    /// fits so the prompt is never empty. These two floors are the only
    /// cases where `total_tokens` may exceed `max_tokens`.
    pub fn trim_to_budget(&self, max_tokens: usize) -> TrimOutcome {
        let (pinned, rest) = match self.messages.split_first() {
            Some((first, rest)) if first.role == Role::System => (Some(first), rest),
            _ => (None, self.messages.as_slice()),
        };

        let mut used = pinned.map(TokenCounter::count_chat).unwrap_or(0);
        let mut kept: Vec<usize> = Vec::with_capacity(rest.len());

        for (idx, msg) in rest.iter().enumerate().rev() {
            let cost = TokenCounter::count_chat(msg);
            if used + cost <= max_tokens {
                used += cost;
                kept.push(idx);
                continue;
            }

            match self.policy {
                TrimPolicy::StrictRecency => break,
                TrimPolicy::BestFit => continue,
            }
        }

        if pinned.is_none() && kept.is_empty() {
            if let Some(newest) = rest.last() {
                used += TokenCounter::count_chat(newest);
                kept.push(rest.len() - 1);
            }
        }

        kept.reverse();

        let mut messages = Vec::with_capacity(kept.len() + 1);
        if let Some(system) = pinned {
            messages.push(system.clone());
        }
        messages.extend(kept.iter().map(|&idx| rest[idx].clone()));

        let dropped = rest.len() - kept.len();
        if dropped > 0 {
            debug!(
                "Trimmed {} of {} messages to fit {} tokens (used {}, policy {:?})",
                dropped,
                rest.len(),
                max_tokens,
                used,
                self.policy
            );
        }

        TrimOutcome {
            messages,
            total_tokens: used,
            dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize) -> String {
        vec!["alpha"; n].join(" ")
    }

    fn cost(content: &str) -> usize {
        TokenCounter::count_message(Role::User, content)
    }

    #[test]
    fn test_empty_log() {
        let memory = ConversationMemory::new(TrimPolicy::StrictRecency);
        let outcome = memory.trim_to_budget(100);
        assert!(outcome.messages.is_empty());
        assert_eq!(outcome.total_tokens, 0);
    }

    #[test]
    fn test_everything_fits() {
        let mut memory = ConversationMemory::new(TrimPolicy::StrictRecency);
        memory.ensure_system_prompt("system");
        memory.append(Role::User, "hi");
        memory.append(Role::Assistant, "hello");

        let outcome = memory.trim_to_budget(10_000);
        assert_eq!(outcome.messages, memory.messages().to_vec());
        assert_eq!(outcome.total_tokens, memory.total_tokens());
        assert_eq!(outcome.dropped, 0);
    }

    #[test]
    fn test_system_message_is_pinned_and_order_kept() {
        let mut memory = ConversationMemory::new(TrimPolicy::StrictRecency);
        memory.ensure_system_prompt("You are helpful.");
        for i in 0..10 {
            memory.append(Role::User, format!("question {} {}", i, words(20)));
            memory.append(Role::Assistant, format!("answer {} {}", i, words(20)));
        }

        let budget = 150;
        let outcome = memory.trim_to_budget(budget);

        assert_eq!(outcome.messages[0], ChatMessage::system("You are helpful."));
        assert!(outcome.total_tokens <= budget);
        assert_eq!(outcome.total_tokens, TokenCounter::count_messages(&outcome.messages));

        // Kept history is a chronological suffix of the original log.
        let kept = &outcome.messages[1..];
        let original = &memory.messages()[1..];
        assert_eq!(kept, &original[original.len() - kept.len()..]);
        assert_eq!(outcome.dropped, original.len() - kept.len());
    }

    #[test]
    fn test_system_over_budget_floor() {
        let mut memory = ConversationMemory::new(TrimPolicy::StrictRecency);
        memory.ensure_system_prompt(&words(50));
        memory.append(Role::User, "short");

        let outcome = memory.trim_to_budget(10);
        assert_eq!(outcome.messages.len(), 1);
        assert_eq!(outcome.messages[0].role, Role::System);
        assert_eq!(outcome.dropped, 1);
    }

    #[test]
    fn test_no_system_keeps_newest_when_nothing_fits() {
        let mut memory = ConversationMemory::new(TrimPolicy::StrictRecency);
        memory.append(Role::User, words(40));
        memory.append(Role::User, words(30));

        let outcome = memory.trim_to_budget(5);
        assert_eq!(outcome.messages, vec![ChatMessage::user(words(30))]);
    }

    #[test]
    fn test_strict_recency_stops_at_first_miss() {
        let mut memory = ConversationMemory::new(TrimPolicy::StrictRecency);
        memory.ensure_system_prompt("sys");
        memory.append(Role::User, "old short");
        memory.append(Role::Assistant, words(60));
        memory.append(Role::User, "new short");

        let budget = cost("sys") + cost("new short") + cost("old short") + 5;
        let outcome = memory.trim_to_budget(budget);

        assert_eq!(
            outcome.messages,
            vec![ChatMessage::system("sys"), ChatMessage::user("new short")]
        );
    }

    #[test]
    fn test_best_fit_keeps_short_old_message() {
        let mut memory = ConversationMemory::new(TrimPolicy::BestFit);
        memory.ensure_system_prompt("sys");
        memory.append(Role::User, "old short");
        memory.append(Role::Assistant, words(60));
        memory.append(Role::User, "new short");

        let budget = cost("sys") + cost("new short") + cost("old short") + 5;
        let outcome = memory.trim_to_budget(budget);

        assert_eq!(
            outcome.messages,
            vec![
                ChatMessage::system("sys"),
                ChatMessage::user("old short"),
                ChatMessage::user("new short"),
            ]
        );
        assert!(outcome.total_tokens <= budget);
    }

    #[test]
    fn test_ensure_system_prompt_is_idempotent() {
        let mut memory = ConversationMemory::new(TrimPolicy::StrictRecency);
        memory.append(Role::User, "hi");
        memory.ensure_system_prompt("prompt");
        memory.ensure_system_prompt("prompt");

        assert_eq!(memory.len(), 2);
        assert_eq!(memory.messages()[0], ChatMessage::system("prompt"));
    }

    #[test]
    fn test_budget_600_with_twenty_pairs() {
        let mut memory = ConversationMemory::new(TrimPolicy::StrictRecency);
        memory.ensure_system_prompt(&words(46));
        for _ in 0..20 {
            memory.append(Role::User, words(76));
            memory.append(Role::Assistant, words(76));
        }

        let outcome = memory.trim_to_budget(600);
        assert!(outcome.total_tokens <= 600);
        assert_eq!(outcome.messages[0].role, Role::System);

        // 50-token system message, 80-token history messages: 50 + 6 * 80 = 530
        assert_eq!(TokenCounter::count_chat(&memory.messages()[0]), 50);
        assert_eq!(TokenCounter::count_chat(&memory.messages()[1]), 80);
        let kept = outcome.messages.len() - 1;
        assert_eq!(kept, 6);
        assert_eq!(outcome.total_tokens, 530);
        assert_eq!(outcome.dropped, 34);
        assert_eq!(&outcome.messages[1..], &memory.messages()[memory.len() - 6..]);
    }

    #[test]
    fn test_best_fit_over_mixed_sizes() {
        let sizes = [3, 70, 5, 120, 12, 45, 2, 95, 8, 30, 150, 4, 60, 1, 25];
        let mut memory = ConversationMemory::new(TrimPolicy::BestFit);
        memory.ensure_system_prompt("Track mergers.");
        for (i, n) in sizes.iter().enumerate() {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            memory.append(role, format!("m{} {}", i, words(*n)));
        }
        let history = &memory.messages()[1..];

        for budget in [40, 120, 200, 333, 500] {
            let outcome = memory.trim_to_budget(budget);
            assert!(outcome.total_tokens <= budget, "budget {}", budget);
            assert_eq!(outcome.messages[0].role, Role::System);
            assert_eq!(TokenCounter::count_messages(&outcome.messages), outcome.total_tokens);

            // Kept messages appear in their original order
            let positions: Vec<usize> = outcome.messages[1..]
                .iter()
                .map(|m| history.iter().position(|h| h == m).unwrap())
                .collect();
            assert!(positions.windows(2).all(|w| w[0] < w[1]), "budget {}", budget);

            // Nothing dropped would still have fit
            for (idx, msg) in history.iter().enumerate() {
                if !positions.contains(&idx) {
                    assert!(
                        outcome.total_tokens + TokenCounter::count_chat(msg) > budget,
                        "budget {} left out message {}",
                        budget,
                        idx
                    );
                }
            }
            assert_eq!(outcome.dropped, history.len() - positions.len());

            // Best fit never keeps less than strict recency
            let mut strict = memory.clone();
            strict.policy = TrimPolicy::StrictRecency;
            let strict = strict.trim_to_budget(budget);
            assert!(strict.messages.iter().all(|m| outcome.messages.contains(m)));
        }
    }
}
