//! # council_chat - Advisor Chat System for Council
//!
//! This crate lets one user talk to several advisors inside a single
//! conversation:
//! - @mentions route a message to the advisors it names
//! - Replies stream in chunk by chunk and are persisted as they arrive
//! - Each advisor keeps key-value memory per conversation
//! - Advisor identities get handles unique within their owner's namespace
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │   ChatManager   │────▶│ MentionResolver │────▶│  PromptBuilder  │
//! └────────┬────────┘     └─────────────────┘     └────────┬────────┘
//!          │                                               │
//!          ▼                                               ▼
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │  Conversations  │     │StreamAggregator │◀────│CompletionSource │
//! │   + Memory      │     └────────┬────────┘     └─────────────────┘
//! └────────┬────────┘              │
//!          └───────────┬───────────┘
//!                      ▼
//!            ┌───────────────────┐
//!            │ Repository (core) │
//!            │ + guards          │
//!            └───────────────────┘
//! ```

pub mod conversations;
pub mod error;
pub mod llm;
pub mod memory;
pub mod mentions;
pub mod prompts;
pub mod registrar;
pub mod session;
pub mod slug;
pub mod stream;

pub use conversations::{ConversationService, ConversationUpdate, DEFAULT_TITLE};
pub use error::{ChatError, ChatResult};
pub use llm::{
    completion_source_from_settings, ChunkStream, CompletionRequest, CompletionSource,
    EchoCompletionSource, HttpCompletionSource, PromptMessage, PromptRole, SseFormat,
};
pub use memory::MemoryStore;
pub use mentions::MentionResolver;
pub use prompts::PromptBuilder;
pub use registrar::{AdvisorPayload, CreatedAdvisor, IdentityRegistrar};
pub use session::{
    AdvisorReply, ChatManager, ChunkSink, PreparedTurn, TurnOutcome, CLIENT_DISCONNECTED,
    REPLY_SEPARATOR,
};
pub use stream::StreamAggregator;
