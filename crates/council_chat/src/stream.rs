//! Streamed advisor replies as a persisted state machine.
//!
//! ```text
//!            append            finalize
//! Pending ──────────▶ Streaming ─────────▶ Finalized
//!    │                    │
//!    └──── abort ─────────┴──────────────▶ Aborted
//! ```
//!
//! Content is persisted after every chunk, so a crash mid-stream leaves the
//! partial reply readable. `partial` flips from true to false exactly once,
//! on the transition into a terminal state. Transitions of one message are
//! serialized, so a concurrent abort is never overwritten by an in-flight
//! append.

use std::sync::Arc;

use council_core::{Clock, Conversation, CoreError, Message, MessageId, Repository, StreamState};
use council_guard::{AuthContext, KeyedLocks, OwnershipGuard};
use tracing::{debug, error, info, warn};

use crate::error::{ChatError, ChatResult};

/// Assembles incremental model output into durable advisor messages.
pub struct StreamAggregator {
    repo: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    guard: OwnershipGuard,
    message_locks: KeyedLocks,
}

impl StreamAggregator {
    pub fn new(repo: Arc<dyn Repository>, clock: Arc<dyn Clock>) -> Self {
        Self {
            guard: OwnershipGuard::new(repo.clone()),
            repo,
            clock,
            message_locks: KeyedLocks::new(),
        }
    }

    /// Start a new, empty reply from `advisor_id`. Each call creates a new message.
    pub async fn open(
        &self,
        caller: &AuthContext,
        conversation_id: &str,
        advisor_id: &str,
    ) -> ChatResult<MessageId> {
        let conversation = self
            .guard
            .validate_conversation_ownership(conversation_id, caller)
            .await?;
        if self.repo.get_advisor(advisor_id).await?.is_none() {
            return Err(CoreError::not_found("Advisor", advisor_id).into());
        }

        let now = self.clock.now();
        let message = Message::advisor_pending(&conversation.id, advisor_id, now);
        let message_id = message.id.clone();
        self.repo.insert_message(message).await?;
        self.touch(conversation).await?;

        debug!(
            "Opened stream {} for advisor {} in {}",
            message_id, advisor_id, conversation_id
        );
        Ok(message_id)
    }

    /// Append one chunk and persist the accumulated content.
    ///
    /// A transient storage failure is retried once. If the retry fails too,
    /// the stream is aborted with the content gathered so far and
    /// `UpstreamStreamFailure` is returned.
    pub async fn append_chunk(
        &self,
        caller: &AuthContext,
        message_id: &str,
        text: &str,
    ) -> ChatResult<Message> {
        let _transition = self.message_locks.lock(message_id).await;
        let (_, mut message) = self.guard.validate_message_ownership(message_id, caller).await?;
        let state = stream_state(&message)?;
        if state.is_terminal() {
            return Err(ChatError::InvalidState {
                current: state,
                operation: "append_chunk",
            });
        }

        message.content.push_str(text);
        message.stream_state = Some(StreamState::Streaming);

        let first = match self.repo.update_message(message.clone()).await {
            Ok(()) => return Ok(message),
            Err(e) if e.is_transient() => e,
            Err(e) => return Err(e.into()),
        };
        warn!(
            "Chunk write for {} failed, retrying once: {}",
            message_id, first
        );

        match self.repo.update_message(message.clone()).await {
            Ok(()) => Ok(message),
            Err(second) => {
                let reason = format!("storage failure: {}", second);
                message.partial = false;
                message.stream_state = Some(StreamState::Aborted);
                message.abort_reason = Some(reason.clone());
                if let Err(e) = self.repo.update_message(message).await {
                    error!("Failed to record abort of {}: {}", message_id, e);
                }
                Err(ChatError::UpstreamStreamFailure(reason))
            }
        }
    }

    /// Mark the reply complete. Finalizing twice is a no-op.
    pub async fn finalize(&self, caller: &AuthContext, message_id: &str) -> ChatResult<Message> {
        let _transition = self.message_locks.lock(message_id).await;
        let (conversation, mut message) =
            self.guard.validate_message_ownership(message_id, caller).await?;
        match stream_state(&message)? {
            StreamState::Finalized => return Ok(message),
            StreamState::Aborted => {
                return Err(ChatError::InvalidState {
                    current: StreamState::Aborted,
                    operation: "finalize",
                })
            }
            StreamState::Pending | StreamState::Streaming => {}
        }

        message.partial = false;
        message.stream_state = Some(StreamState::Finalized);
        self.repo.update_message(message.clone()).await?;
        self.touch(conversation).await?;

        info!(
            "Finalized stream {} ({} chars)",
            message_id,
            message.content.len()
        );
        Ok(message)
    }

    /// Stop the reply, keeping whatever content arrived. Aborting twice is a no-op.
    pub async fn abort(
        &self,
        caller: &AuthContext,
        message_id: &str,
        reason: &str,
    ) -> ChatResult<Message> {
        let _transition = self.message_locks.lock(message_id).await;
        let (_, mut message) = self.guard.validate_message_ownership(message_id, caller).await?;
        match stream_state(&message)? {
            StreamState::Aborted => return Ok(message),
            StreamState::Finalized => {
                return Err(ChatError::InvalidState {
                    current: StreamState::Finalized,
                    operation: "abort",
                })
            }
            StreamState::Pending | StreamState::Streaming => {}
        }

        message.partial = false;
        message.stream_state = Some(StreamState::Aborted);
        message.abort_reason = Some(reason.to_string());
        self.repo.update_message(message.clone()).await?;

        info!("Aborted stream {}: {}", message_id, reason);
        Ok(message)
    }

    pub async fn state(&self, caller: &AuthContext, message_id: &str) -> ChatResult<StreamState> {
        let (_, message) = self.guard.validate_message_ownership(message_id, caller).await?;
        stream_state(&message)
    }

    async fn touch(&self, mut conversation: Conversation) -> ChatResult<()> {
        conversation.updated_at = self.clock.now();
        self.repo.update_conversation(conversation).await?;
        Ok(())
    }
}

fn stream_state(message: &Message) -> ChatResult<StreamState> {
    message
        .stream_state
        .ok_or_else(|| ChatError::NotStreamed(message.id.clone()))
}
