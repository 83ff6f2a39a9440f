use once_cell::sync::Lazy;
use tiktoken_rs::CoreBPE;

use crate::models::{ChatMessage, Role};

/// Role and delimiter tokens every chat message costs on top of its content.
///
/// Trimming and the final budget check must both go through
/// [`TokenCounter::count_message`] so they agree on this constant.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

// The cl100k_base vocabulary is embedded in tiktoken-rs, so building it
// only fails if the crate itself is broken.
static ENCODER: Lazy<CoreBPE> =
    Lazy::new(|| tiktoken_rs::cl100k_base().expect("embedded cl100k_base vocabulary"));

/// Stateless token accounting shared by every budget computation.
pub struct TokenCounter;

impl TokenCounter {
    pub fn count_text(text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        ENCODER.encode_with_special_tokens(text).len()
    }

    /// Tokens for one message: content plus the fixed per-message overhead.
    /// The role itself is covered by the overhead.
    pub fn count_message(_role: Role, content: &str) -> usize {
        Self::count_text(content) + MESSAGE_OVERHEAD_TOKENS
    }

    pub fn count_chat(message: &ChatMessage) -> usize {
        Self::count_message(message.role, &message.content)
    }

    pub fn count_messages(messages: &[ChatMessage]) -> usize {
        messages.iter().map(Self::count_chat).sum()
    }
}
