//! # council_core
//!
//! Domain model and storage contract for Council, a multi-advisor
//! conversation service.
//!
//! # Architecture
//!
//! - **Models**: advisors, conversations, messages, memories and the
//!   bookkeeping rows used by request guards
//! - **Persona**: closed advisor persona structure with a bounded extension map
//! - **Repository**: async storage trait plus an arena implementation that can
//!   be mirrored to a JSON snapshot
//! - **Config**: settings file with environment overrides
//! - **Clock**: injectable time source for windows and TTLs

pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod persona;
pub mod repository;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CouncilConfig, LlmProviderKind, LlmSettings, RateLimitRule, ACTION_CREATE_ADVISOR,
    ACTION_SEND_MESSAGE, CONFIG_FILE, MAX_DURATION_SECS,
};
pub use error::{CoreError, CoreResult, ErrorCode};
pub use models::{
    Advisor, AdvisorId, AdvisorMemory, AdvisorStatus, Conversation, ConversationId,
    IdempotencyRecord, LinkSource, Message, MessageId, RateLimitWindow, Sender, StreamState,
    UserAdvisorLink, UserId,
};
pub use persona::{AdviceStyle, Persona, PersonaIdentity};
pub use repository::{ArenaRepository, Repository, Snapshot, LOCK_FILE, SNAPSHOT_FILE};
