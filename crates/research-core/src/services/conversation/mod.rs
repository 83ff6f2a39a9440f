//! Conversation pipeline
//!
//! - Token accounting and budget trimming of the working log
//! - Streamed reply assembly with live fan-out
//! - Per-conversation turn registry (at most one turn in flight)
//! - Turn orchestration and persistence

mod assembler;
mod memory;
mod registry;
mod service;
mod token_counter;

pub use assembler::{AssembledResponse, ResponseAssembler};
pub use memory::{ConversationMemory, TrimOutcome, TrimPolicy};
pub use registry::{TurnGuard, TurnPhase, TurnRegistry};
pub use service::{ConversationService, FindingExtractor, TurnOutcome, TurnStep};
pub use token_counter::{TokenCounter, MESSAGE_OVERHEAD_TOKENS};
