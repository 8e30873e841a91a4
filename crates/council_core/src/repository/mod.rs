//! Storage contract.
//!
//! Everything above this layer talks to storage through [`Repository`].
//! Implementations only have to provide per-record atomicity and the
//! conversation delete cascade; uniqueness of handles, memory keys and
//! idempotency keys is enforced by the callers.

mod arena;
mod snapshot;

pub use arena::ArenaRepository;
pub use snapshot::{Snapshot, LOCK_FILE, SNAPSHOT_FILE};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreResult;
use crate::models::{
    Advisor, AdvisorMemory, Conversation, IdempotencyRecord, Message, RateLimitWindow,
    UserAdvisorLink,
};

/// Storage operations used by the core.
#[async_trait]
pub trait Repository: Send + Sync {
    // Advisors

    async fn insert_advisor(&self, advisor: Advisor) -> CoreResult<()>;

    async fn get_advisor(&self, id: &str) -> CoreResult<Option<Advisor>>;

    async fn find_advisor_by_handle(
        &self,
        owner_id: &str,
        handle: &str,
    ) -> CoreResult<Option<Advisor>>;

    async fn list_advisors_by_owner(&self, owner_id: &str) -> CoreResult<Vec<Advisor>>;

    async fn update_advisor(&self, advisor: Advisor) -> CoreResult<()>;

    /// Returns whether a row was removed.
    async fn delete_advisor(&self, id: &str) -> CoreResult<bool>;

    // Links

    /// Returns `false` when a link for the pair already exists.
    async fn insert_link(&self, link: UserAdvisorLink) -> CoreResult<bool>;

    async fn delete_link(&self, user_id: &str, advisor_id: &str) -> CoreResult<bool>;

    async fn list_links(&self, user_id: &str) -> CoreResult<Vec<UserAdvisorLink>>;

    // Conversations

    async fn insert_conversation(&self, conversation: Conversation) -> CoreResult<()>;

    async fn get_conversation(&self, id: &str) -> CoreResult<Option<Conversation>>;

    async fn update_conversation(&self, conversation: Conversation) -> CoreResult<()>;

    async fn list_conversations(&self, owner_id: &str) -> CoreResult<Vec<Conversation>>;

    /// Removes the conversation together with its messages and memories.
    async fn delete_conversation(&self, id: &str) -> CoreResult<bool>;

    // Messages

    async fn insert_message(&self, message: Message) -> CoreResult<()>;

    async fn get_message(&self, id: &str) -> CoreResult<Option<Message>>;

    async fn update_message(&self, message: Message) -> CoreResult<()>;

    async fn delete_message(&self, id: &str) -> CoreResult<bool>;

    /// Messages of a conversation in insertion order.
    async fn list_messages(&self, conversation_id: &str) -> CoreResult<Vec<Message>>;

    // Advisor memories

    async fn insert_memory(&self, memory: AdvisorMemory) -> CoreResult<()>;

    async fn update_memory(&self, memory: AdvisorMemory) -> CoreResult<()>;

    async fn get_memory(
        &self,
        conversation_id: &str,
        advisor_id: &str,
        key: &str,
    ) -> CoreResult<Option<AdvisorMemory>>;

    async fn list_memories(
        &self,
        conversation_id: &str,
        advisor_id: Option<&str>,
    ) -> CoreResult<Vec<AdvisorMemory>>;

    /// Returns the number of rows removed.
    async fn delete_memories(&self, conversation_id: &str, advisor_id: &str) -> CoreResult<usize>;

    // Idempotency keys

    async fn get_idempotency(&self, key: &str) -> CoreResult<Option<IdempotencyRecord>>;

    async fn put_idempotency(&self, record: IdempotencyRecord) -> CoreResult<()>;

    /// Drop records that expired at or before `now`.
    async fn purge_idempotency(&self, now: DateTime<Utc>) -> CoreResult<usize>;

    // Rate-limit windows

    async fn get_rate_window(
        &self,
        user_id: &str,
        action: &str,
    ) -> CoreResult<Option<RateLimitWindow>>;

    async fn put_rate_window(&self, window: RateLimitWindow) -> CoreResult<()>;
}
