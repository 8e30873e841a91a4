//! Conversation and message management.

use std::sync::Arc;

use council_core::{
    Clock, Conversation, CoreError, Message, Repository, Sender, ACTION_SEND_MESSAGE,
};
use council_guard::{AuthContext, OwnershipGuard, RateLimiter};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info};

use crate::error::{ChatError, ChatResult};

/// Title given to conversations created without one.
pub const DEFAULT_TITLE: &str = "New conversation";

/// Longest accepted conversation title.
pub const MAX_TITLE_LENGTH: usize = 200;

/// Partial update of a conversation. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationUpdate {
    #[serde(default)]
    pub title: Option<String>,
    /// `Some(None)` clears the active advisor
    #[serde(default, deserialize_with = "double_option")]
    pub active_advisor_id: Option<Option<String>>,
}

fn double_option<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

pub struct ConversationService {
    repo: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    guard: OwnershipGuard,
    limiter: Arc<RateLimiter>,
    max_message_length: usize,
}

impl ConversationService {
    pub fn new(
        repo: Arc<dyn Repository>,
        clock: Arc<dyn Clock>,
        limiter: Arc<RateLimiter>,
        max_message_length: usize,
    ) -> Self {
        Self {
            guard: OwnershipGuard::new(repo.clone()),
            repo,
            clock,
            limiter,
            max_message_length,
        }
    }

    pub async fn create(
        &self,
        caller: &AuthContext,
        title: Option<&str>,
    ) -> ChatResult<Conversation> {
        let owner_id = caller.require_user()?;
        let title = match title.map(str::trim).filter(|t| !t.is_empty()) {
            Some(t) => validate_title(t)?,
            None => DEFAULT_TITLE.to_string(),
        };
        let conversation = Conversation::new(owner_id, title, self.clock.now());
        self.repo.insert_conversation(conversation.clone()).await?;
        info!("Created conversation {} for {}", conversation.id, owner_id);
        Ok(conversation)
    }

    pub async fn get(&self, caller: &AuthContext, conversation_id: &str) -> ChatResult<Conversation> {
        Ok(self
            .guard
            .validate_conversation_ownership(conversation_id, caller)
            .await?)
    }

    /// The caller's conversations, most recently active first.
    pub async fn list(&self, caller: &AuthContext) -> ChatResult<Vec<Conversation>> {
        let owner_id = caller.require_user()?;
        Ok(self.repo.list_conversations(owner_id).await?)
    }

    pub async fn update(
        &self,
        caller: &AuthContext,
        conversation_id: &str,
        update: ConversationUpdate,
    ) -> ChatResult<Conversation> {
        let mut conversation = self
            .guard
            .validate_conversation_ownership(conversation_id, caller)
            .await?;

        if let Some(title) = update.title {
            let title = title.trim();
            if title.is_empty() {
                return Err(ChatError::InvalidPayload("title must not be empty".into()));
            }
            conversation.title = validate_title(title)?;
        }
        if let Some(active) = update.active_advisor_id {
            if let Some(advisor_id) = &active {
                if self.repo.get_advisor(advisor_id).await?.is_none() {
                    return Err(CoreError::not_found("Advisor", advisor_id).into());
                }
            }
            conversation.active_advisor_id = active;
        }

        conversation.updated_at = self.clock.now();
        self.repo.update_conversation(conversation.clone()).await?;
        Ok(conversation)
    }

    /// Delete a conversation with all its messages and memories.
    pub async fn delete(&self, caller: &AuthContext, conversation_id: &str) -> ChatResult<()> {
        self.guard
            .validate_conversation_ownership(conversation_id, caller)
            .await?;
        self.repo.delete_conversation(conversation_id).await?;
        info!("Deleted conversation {}", conversation_id);
        Ok(())
    }

    /// Validate and store a user message, refreshing the conversation's `updatedAt`.
    pub async fn append_user_message(
        &self,
        caller: &AuthContext,
        conversation_id: &str,
        content: &str,
    ) -> ChatResult<Message> {
        let mut conversation = self
            .guard
            .validate_conversation_ownership(conversation_id, caller)
            .await?;
        let content = self.validate_content(content)?;
        self.limiter
            .enforce(&conversation.owner_id, ACTION_SEND_MESSAGE)
            .await?;

        let now = self.clock.now();
        let message = Message::user(&conversation.id, content, now);
        self.repo.insert_message(message.clone()).await?;
        conversation.updated_at = now;
        self.repo.update_conversation(conversation).await?;

        debug!("Appended user message {} to {}", message.id, conversation_id);
        Ok(message)
    }

    /// Replace the text of a user message.
    pub async fn edit_message(
        &self,
        caller: &AuthContext,
        message_id: &str,
        content: &str,
    ) -> ChatResult<Message> {
        let (_, mut message) = self.guard.validate_message_ownership(message_id, caller).await?;
        if message.sender != Sender::User {
            return Err(ChatError::InvalidPayload(
                "only user messages can be edited".into(),
            ));
        }
        message.content = self.validate_content(content)?;
        message.edited_at = Some(self.clock.now());
        self.repo.update_message(message.clone()).await?;
        Ok(message)
    }

    pub async fn delete_message(&self, caller: &AuthContext, message_id: &str) -> ChatResult<()> {
        self.guard.validate_message_ownership(message_id, caller).await?;
        self.repo.delete_message(message_id).await?;
        Ok(())
    }

    /// Messages in the order they were appended.
    pub async fn list_messages(
        &self,
        caller: &AuthContext,
        conversation_id: &str,
    ) -> ChatResult<Vec<Message>> {
        self.guard
            .validate_conversation_ownership(conversation_id, caller)
            .await?;
        Ok(self.repo.list_messages(conversation_id).await?)
    }

    fn validate_content(&self, content: &str) -> ChatResult<String> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Err(ChatError::InvalidPayload("message must not be empty".into()));
        }
        if trimmed.chars().count() > self.max_message_length {
            return Err(ChatError::InvalidPayload(format!(
                "message exceeds {} characters",
                self.max_message_length
            )));
        }
        Ok(trimmed.to_string())
    }
}

fn validate_title(title: &str) -> ChatResult<String> {
    if title.chars().count() > MAX_TITLE_LENGTH {
        return Err(ChatError::InvalidPayload(format!(
            "title exceeds {} characters",
            MAX_TITLE_LENGTH
        )));
    }
    Ok(title.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use council_core::{
        AdvisorMemory, ArenaRepository, CouncilConfig, ErrorCode, ManualClock, RateLimitRule,
    };
    use serde_json::json;

    struct Fixture {
        repo: Arc<ArenaRepository>,
        clock: Arc<ManualClock>,
        service: ConversationService,
        caller: AuthContext,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(ArenaRepository::new());
        let clock = Arc::new(ManualClock::default());
        let limiter = Arc::new(
            RateLimiter::new(repo.clone(), clock.clone(), &CouncilConfig::default())
                .with_rule(ACTION_SEND_MESSAGE, RateLimitRule::new(3, 60)),
        );
        Fixture {
            service: ConversationService::new(repo.clone(), clock.clone(), limiter, 20),
            repo,
            clock,
            caller: AuthContext::user("u1"),
        }
    }

    #[tokio::test]
    async fn test_create_defaults_title() {
        let f = fixture();
        let conversation = f.service.create(&f.caller, None).await.unwrap();
        assert_eq!(conversation.title, DEFAULT_TITLE);
        assert_eq!(conversation.owner_id, "u1");

        let named = f.service.create(&f.caller, Some("  Fundraise  ")).await.unwrap();
        assert_eq!(named.title, "Fundraise");
    }

    #[tokio::test]
    async fn test_append_refreshes_updated_at() {
        let f = fixture();
        let conversation = f.service.create(&f.caller, None).await.unwrap();
        f.clock.advance(Duration::minutes(1));

        f.service
            .append_user_message(&f.caller, &conversation.id, "hello")
            .await
            .unwrap();
        let reloaded = f.service.get(&f.caller, &conversation.id).await.unwrap();
        assert_eq!(reloaded.updated_at, f.clock.now());
        assert!(reloaded.updated_at > conversation.updated_at);
    }

    #[tokio::test]
    async fn test_message_validation() {
        let f = fixture();
        let conversation = f.service.create(&f.caller, None).await.unwrap();

        let err = f
            .service
            .append_user_message(&f.caller, &conversation.id, "   ")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPayload);

        let err = f
            .service
            .append_user_message(&f.caller, &conversation.id, &"x".repeat(21))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPayload);
    }

    #[tokio::test]
    async fn test_send_rate_limited() {
        let f = fixture();
        let conversation = f.service.create(&f.caller, None).await.unwrap();
        for i in 0..3 {
            f.service
                .append_user_message(&f.caller, &conversation.id, &format!("m{}", i))
                .await
                .unwrap();
        }
        let err = f
            .service
            .append_user_message(&f.caller, &conversation.id, "one more")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RateLimited);
    }

    #[tokio::test]
    async fn test_edit_only_user_messages() {
        let f = fixture();
        let conversation = f.service.create(&f.caller, None).await.unwrap();
        let message = f
            .service
            .append_user_message(&f.caller, &conversation.id, "draft")
            .await
            .unwrap();

        let edited = f
            .service
            .edit_message(&f.caller, &message.id, "final")
            .await
            .unwrap();
        assert_eq!(edited.content, "final");
        assert!(edited.edited_at.is_some());

        let advisor_reply = Message::advisor_pending(&conversation.id, "a1", f.clock.now());
        f.repo.insert_message(advisor_reply.clone()).await.unwrap();
        let err = f
            .service
            .edit_message(&f.caller, &advisor_reply.id, "rewrite")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPayload);
    }

    #[tokio::test]
    async fn test_update_title_and_active_advisor() {
        let f = fixture();
        let conversation = f.service.create(&f.caller, None).await.unwrap();

        let update: ConversationUpdate =
            serde_json::from_value(json!({"title": "Hiring"})).unwrap();
        assert_eq!(update.active_advisor_id, None);
        let updated = f.service.update(&f.caller, &conversation.id, update).await.unwrap();
        assert_eq!(updated.title, "Hiring");

        let err = f
            .service
            .update(
                &f.caller,
                &conversation.id,
                ConversationUpdate {
                    title: None,
                    active_advisor_id: Some(Some("ghost".into())),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);

        let clear: ConversationUpdate =
            serde_json::from_value(json!({"activeAdvisorId": null})).unwrap();
        assert_eq!(clear.active_advisor_id, Some(None));
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let f = fixture();
        let conversation = f.service.create(&f.caller, None).await.unwrap();
        f.service
            .append_user_message(&f.caller, &conversation.id, "hi")
            .await
            .unwrap();
        f.repo
            .insert_memory(AdvisorMemory::new(
                &conversation.id,
                "a1",
                "k",
                json!(1),
                f.clock.now(),
            ))
            .await
            .unwrap();

        f.service.delete(&f.caller, &conversation.id).await.unwrap();

        assert!(f.repo.list_messages(&conversation.id).await.unwrap().is_empty());
        assert!(f
            .repo
            .list_memories(&conversation.id, None)
            .await
            .unwrap()
            .is_empty());
        let err = f.service.get(&f.caller, &conversation.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_other_user_cannot_delete() {
        let f = fixture();
        let conversation = f.service.create(&f.caller, None).await.unwrap();
        let err = f
            .service
            .delete(&AuthContext::user("u2"), &conversation.id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unauthorized);
        assert!(f.service.get(&f.caller, &conversation.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_list_is_scoped_to_owner() {
        let f = fixture();
        f.service.create(&f.caller, Some("mine")).await.unwrap();
        f.service
            .create(&AuthContext::user("u2"), Some("theirs"))
            .await
            .unwrap();
        let listed = f.service.list(&f.caller).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title, "mine");
    }
}
