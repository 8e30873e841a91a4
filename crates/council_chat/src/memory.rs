//! Key-value memory scoped to one (conversation, advisor) pair.
//!
//! Every call validates that the caller owns the conversation before reading
//! or writing. `set_memory` is an upsert: the row for a key is created once
//! and updated afterwards, under a lock for that (conversation, advisor, key)
//! triple.

use std::sync::Arc;

use council_core::{AdvisorMemory, Clock, CoreError, Repository};
use council_guard::{AuthContext, KeyedLocks, OwnershipGuard};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{ChatError, ChatResult};

/// Longest accepted memory key.
pub const MAX_MEMORY_KEY_LENGTH: usize = 128;

pub struct MemoryStore {
    repo: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    guard: OwnershipGuard,
    locks: KeyedLocks,
}

impl MemoryStore {
    pub fn new(repo: Arc<dyn Repository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            guard: OwnershipGuard::new(repo.clone()),
            repo,
            clock,
            locks: KeyedLocks::new(),
        }
    }

    /// All memories in a conversation, optionally narrowed to one advisor.
    pub async fn get_conversation_memories(
        &self,
        caller: &AuthContext,
        conversation_id: &str,
        advisor_id: Option<&str>,
    ) -> ChatResult<Vec<AdvisorMemory>> {
        self.guard
            .validate_conversation_ownership(conversation_id, caller)
            .await?;
        Ok(self.repo.list_memories(conversation_id, advisor_id).await?)
    }

    pub async fn get_memory_by_key(
        &self,
        caller: &AuthContext,
        conversation_id: &str,
        advisor_id: &str,
        key: &str,
    ) -> ChatResult<Option<AdvisorMemory>> {
        self.guard
            .validate_conversation_ownership(conversation_id, caller)
            .await?;
        Ok(self.repo.get_memory(conversation_id, advisor_id, key).await?)
    }

    /// Create or overwrite the value stored under `key`.
    pub async fn set_memory(
        &self,
        caller: &AuthContext,
        conversation_id: &str,
        advisor_id: &str,
        key: &str,
        value: Value,
    ) -> ChatResult<AdvisorMemory> {
        let key = key.trim();
        if key.is_empty() {
            return Err(ChatError::InvalidPayload("memory key must not be empty".into()));
        }
        if key.chars().count() > MAX_MEMORY_KEY_LENGTH {
            return Err(ChatError::InvalidPayload(format!(
                "memory key exceeds {} characters",
                MAX_MEMORY_KEY_LENGTH
            )));
        }

        self.guard
            .validate_conversation_ownership(conversation_id, caller)
            .await?;
        if self.repo.get_advisor(advisor_id).await?.is_none() {
            return Err(CoreError::not_found("Advisor", advisor_id).into());
        }

        let _slot = self
            .locks
            .lock(&format!("{}\u{1f}{}\u{1f}{}", conversation_id, advisor_id, key))
            .await;
        let now = self.clock.now();

        match self.repo.get_memory(conversation_id, advisor_id, key).await? {
            Some(mut existing) => {
                existing.value = value;
                existing.updated_at = now;
                self.repo.update_memory(existing.clone()).await?;
                debug!(
                    "Updated memory {} for advisor {} in {}",
                    key, advisor_id, conversation_id
                );
                Ok(existing)
            }
            None => {
                let memory = AdvisorMemory::new(conversation_id, advisor_id, key, value, now);
                self.repo.insert_memory(memory.clone()).await?;
                debug!(
                    "Stored memory {} for advisor {} in {}",
                    key, advisor_id, conversation_id
                );
                Ok(memory)
            }
        }
    }

    /// Remove every memory one advisor holds in a conversation.
    pub async fn clear_advisor_memories(
        &self,
        caller: &AuthContext,
        conversation_id: &str,
        advisor_id: &str,
    ) -> ChatResult<usize> {
        self.guard
            .validate_conversation_ownership(conversation_id, caller)
            .await?;
        let removed = self.repo.delete_memories(conversation_id, advisor_id).await?;
        info!(
            "Cleared {} memories for advisor {} in {}",
            removed, advisor_id, conversation_id
        );
        Ok(removed)
    }
}
