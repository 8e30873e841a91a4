//! Core records persisted by Council.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::persona::Persona;

pub type UserId = String;
pub type AdvisorId = String;
pub type ConversationId = String;
pub type MessageId = String;

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Lifecycle status of an advisor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdvisorStatus {
    #[default]
    Active,
    Archived,
}

/// A named AI persona owned by one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Advisor {
    pub id: AdvisorId,
    pub owner_id: UserId,
    /// Full display name ("Marcus Wellington")
    pub name: String,
    /// URL-safe slug, unique within the owner's namespace
    pub handle: String,
    pub one_liner: String,
    pub mission: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope_in: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope_out: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<Persona>,
    #[serde(default)]
    pub status: AdvisorStatus,
    pub created_at: DateTime<Utc>,
}

impl Advisor {
    /// First whitespace-separated token of the display name.
    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or("")
    }

    pub fn is_active(&self) -> bool {
        self.status == AdvisorStatus::Active
    }
}

/// How a user came to have an advisor selected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkSource {
    /// The user created the advisor
    Created,
    /// The user picked the advisor explicitly
    Selected,
    /// The advisor came in as part of a team
    Team,
}

/// Join record for a user's selected advisors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAdvisorLink {
    pub user_id: UserId,
    pub advisor_id: AdvisorId,
    pub source: LinkSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A conversation thread owned by one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub owner_id: UserId,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_advisor_id: Option<AdvisorId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(owner_id: impl Into<String>, title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: new_id(),
            owner_id: owner_id.into(),
            title: title.into(),
            active_advisor_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Who sent a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Advisor,
    System,
}

/// Lifecycle of a streamed advisor reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    /// Opened, no chunk received yet
    Pending,
    /// At least one chunk appended
    Streaming,
    /// Completed normally
    Finalized,
    /// Stopped early; accumulated content is kept
    Aborted,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Aborted)
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Streaming => "streaming",
            Self::Finalized => "finalized",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// A single message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: Sender,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advisor_id: Option<AdvisorId>,
    pub content: String,
    /// True while a streamed reply is still in flight
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_state: Option<StreamState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Create a new user message
    pub fn user(
        conversation_id: impl Into<String>,
        content: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::complete(conversation_id.into(), Sender::User, None, content.into(), now)
    }

    /// Create a new system message
    pub fn system(
        conversation_id: impl Into<String>,
        content: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self::complete(conversation_id.into(), Sender::System, None, content.into(), now)
    }

    /// Create an empty, partial advisor message awaiting its first chunk
    pub fn advisor_pending(
        conversation_id: impl Into<String>,
        advisor_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id(),
            conversation_id: conversation_id.into(),
            sender: Sender::Advisor,
            advisor_id: Some(advisor_id.into()),
            content: String::new(),
            partial: true,
            stream_state: Some(StreamState::Pending),
            abort_reason: None,
            created_at: now,
            edited_at: None,
        }
    }

    fn complete(
        conversation_id: ConversationId,
        sender: Sender,
        advisor_id: Option<AdvisorId>,
        content: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id(),
            conversation_id,
            sender,
            advisor_id,
            content,
            partial: false,
            stream_state: None,
            abort_reason: None,
            created_at: now,
            edited_at: None,
        }
    }
}

/// A key-value fact scoped to one (conversation, advisor) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvisorMemory {
    pub id: String,
    pub conversation_id: ConversationId,
    pub advisor_id: AdvisorId,
    pub key: String,
    pub value: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AdvisorMemory {
    pub fn new(
        conversation_id: impl Into<String>,
        advisor_id: impl Into<String>,
        key: impl Into<String>,
        value: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id(),
            conversation_id: conversation_id.into(),
            advisor_id: advisor_id.into(),
            key: key.into(),
            value,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A stored result for a client-supplied idempotency key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    pub key: String,
    pub result: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Call counter for one (user, action) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitWindow {
    pub user_id: UserId,
    pub action: String,
    pub window_start: DateTime<Utc>,
    pub count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advisor(name: &str) -> Advisor {
        Advisor {
            id: "a1".to_string(),
            owner_id: "u1".to_string(),
            name: name.to_string(),
            handle: "h".to_string(),
            one_liner: "one".to_string(),
            mission: "mission".to_string(),
            tags: Vec::new(),
            scope_in: Vec::new(),
            scope_out: Vec::new(),
            persona: None,
            status: AdvisorStatus::Active,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_first_name() {
        assert_eq!(advisor("Marcus Wellington").first_name(), "Marcus");
        assert_eq!(advisor("  Sarah  Chen ").first_name(), "Sarah");
        assert_eq!(advisor("").first_name(), "");
    }

    #[test]
    fn test_pending_advisor_message() {
        let msg = Message::advisor_pending("c1", "a1", Utc::now());
        assert!(msg.partial);
        assert!(msg.content.is_empty());
        assert_eq!(msg.sender, Sender::Advisor);
        assert_eq!(msg.stream_state, Some(StreamState::Pending));
    }

    #[test]
    fn test_user_message_is_complete() {
        let msg = Message::user("c1", "hello", Utc::now());
        assert!(!msg.partial);
        assert_eq!(msg.stream_state, None);
        assert_eq!(msg.advisor_id, None);
    }

    #[test]
    fn test_message_serializes_camel_case() {
        let msg = Message::advisor_pending("c1", "a1", Utc::now());
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["conversationId"], "c1");
        assert_eq!(json["streamState"], "pending");
        assert!(json.get("abortReason").is_none());
    }

    #[test]
    fn test_idempotency_liveness() {
        let now = Utc::now();
        let record = IdempotencyRecord {
            key: "k".to_string(),
            result: serde_json::Value::Null,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(10),
        };
        assert!(record.is_live(now));
        assert!(!record.is_live(now + chrono::Duration::seconds(10)));
    }
}
