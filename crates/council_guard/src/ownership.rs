//! Ownership checks run before any mutation or memory read.
//!
//! Results are never cached: ownership is re-read from storage on every call.

use std::sync::Arc;

use council_core::{Advisor, Conversation, CoreError, Message, Repository};
use tracing::warn;

use crate::auth::AuthContext;
use crate::error::{GuardError, GuardResult};

/// Verifies that the caller owns the resource being touched.
#[derive(Clone)]
pub struct OwnershipGuard {
    repo: Arc<dyn Repository>,
}

impl OwnershipGuard {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Load a conversation and confirm the caller owns it.
    pub async fn validate_conversation_ownership(
        &self,
        conversation_id: &str,
        caller: &AuthContext,
    ) -> GuardResult<Conversation> {
        let user_id = caller.require_user()?;
        let conversation = self
            .repo
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| CoreError::not_found("Conversation", conversation_id))?;

        if conversation.owner_id != user_id {
            warn!(
                "User {} denied access to conversation {}",
                user_id, conversation_id
            );
            return Err(GuardError::Unauthorized {
                user_id: user_id.to_string(),
                kind: "conversation",
                id: conversation_id.to_string(),
            });
        }
        Ok(conversation)
    }

    /// Load an advisor and confirm the caller owns it.
    pub async fn validate_advisor_ownership(
        &self,
        advisor_id: &str,
        caller: &AuthContext,
    ) -> GuardResult<Advisor> {
        let user_id = caller.require_user()?;
        let advisor = self
            .repo
            .get_advisor(advisor_id)
            .await?
            .ok_or_else(|| CoreError::not_found("Advisor", advisor_id))?;

        if advisor.owner_id != user_id {
            warn!("User {} denied access to advisor {}", user_id, advisor_id);
            return Err(GuardError::Unauthorized {
                user_id: user_id.to_string(),
                kind: "advisor",
                id: advisor_id.to_string(),
            });
        }
        Ok(advisor)
    }

    /// Load a message and confirm the caller owns its conversation.
    pub async fn validate_message_ownership(
        &self,
        message_id: &str,
        caller: &AuthContext,
    ) -> GuardResult<(Conversation, Message)> {
        caller.require_user()?;
        let message = self
            .repo
            .get_message(message_id)
            .await?
            .ok_or_else(|| CoreError::not_found("Message", message_id))?;
        let conversation = self
            .validate_conversation_ownership(&message.conversation_id, caller)
            .await?;
        Ok((conversation, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use council_core::{ArenaRepository, ErrorCode};

    async fn setup() -> (OwnershipGuard, Arc<ArenaRepository>, Conversation) {
        let repo = Arc::new(ArenaRepository::new());
        let conversation = Conversation::new("u1", "Strategy", Utc::now());
        repo.insert_conversation(conversation.clone()).await.unwrap();
        (OwnershipGuard::new(repo.clone()), repo, conversation)
    }

    #[tokio::test]
    async fn test_owner_passes() {
        let (guard, _, conversation) = setup().await;
        let loaded = guard
            .validate_conversation_ownership(&conversation.id, &AuthContext::user("u1"))
            .await
            .unwrap();
        assert_eq!(loaded.id, conversation.id);
    }

    #[tokio::test]
    async fn test_other_user_unauthorized() {
        let (guard, repo, conversation) = setup().await;
        let err = guard
            .validate_conversation_ownership(&conversation.id, &AuthContext::user("u2"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unauthorized);

        // Nothing was touched
        let stored = repo.get_conversation(&conversation.id).await.unwrap().unwrap();
        assert_eq!(stored, conversation);
    }

    #[tokio::test]
    async fn test_missing_conversation_not_found() {
        let (guard, _, _) = setup().await;
        let err = guard
            .validate_conversation_ownership("nope", &AuthContext::user("u1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_anonymous_unauthenticated() {
        let (guard, _, conversation) = setup().await;
        let err = guard
            .validate_conversation_ownership(&conversation.id, &AuthContext::anonymous())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unauthenticated);
    }

    #[tokio::test]
    async fn test_message_ownership_follows_conversation() {
        let (guard, repo, conversation) = setup().await;
        let message = Message::user(&conversation.id, "hi", Utc::now());
        repo.insert_message(message.clone()).await.unwrap();

        let (conv, msg) = guard
            .validate_message_ownership(&message.id, &AuthContext::user("u1"))
            .await
            .unwrap();
        assert_eq!(conv.id, conversation.id);
        assert_eq!(msg.id, message.id);

        let err = guard
            .validate_message_ownership(&message.id, &AuthContext::user("u2"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn test_ownership_rechecked_each_call() {
        let (guard, repo, mut conversation) = setup().await;
        let caller = AuthContext::user("u1");
        guard
            .validate_conversation_ownership(&conversation.id, &caller)
            .await
            .unwrap();

        conversation.owner_id = "u3".to_string();
        repo.update_conversation(conversation.clone()).await.unwrap();

        let err = guard
            .validate_conversation_ownership(&conversation.id, &caller)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unauthorized);
    }
}
