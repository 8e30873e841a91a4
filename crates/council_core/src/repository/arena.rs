//! Arena-backed repository.
//!
//! Rows live in hash maps keyed by generated ids behind a single lock, so
//! every call is atomic with respect to every other call. When opened with a
//! data directory the arena is mirrored to a JSON snapshot after each write.
//! Snapshots are taken and written one at a time, so the file never falls
//! behind a write that has already returned. The directory is locked for the
//! lifetime of the repository; a second opener gets a conflict instead of
//! silently overwriting the first one's writes.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use super::snapshot::{Snapshot, LOCK_FILE, SNAPSHOT_FILE};
use super::Repository;
use crate::error::{CoreError, CoreResult};
use crate::models::{
    Advisor, AdvisorMemory, Conversation, ConversationId, IdempotencyRecord, Message, MessageId,
    RateLimitWindow, UserAdvisorLink,
};

#[derive(Debug, Default)]
struct Tables {
    advisors: HashMap<String, Advisor>,
    links: Vec<UserAdvisorLink>,
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<ConversationId, Vec<Message>>,
    message_index: HashMap<MessageId, ConversationId>,
    memories: HashMap<ConversationId, Vec<AdvisorMemory>>,
    idempotency: HashMap<String, IdempotencyRecord>,
    rate_windows: HashMap<(String, String), RateLimitWindow>,
}

impl Tables {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut tables = Tables::default();
        for advisor in snapshot.advisors {
            tables.advisors.insert(advisor.id.clone(), advisor);
        }
        tables.links = snapshot.links;
        for conversation in snapshot.conversations {
            tables
                .conversations
                .insert(conversation.id.clone(), conversation);
        }
        for message in snapshot.messages {
            tables
                .message_index
                .insert(message.id.clone(), message.conversation_id.clone());
            tables
                .messages
                .entry(message.conversation_id.clone())
                .or_default()
                .push(message);
        }
        for memory in snapshot.memories {
            tables
                .memories
                .entry(memory.conversation_id.clone())
                .or_default()
                .push(memory);
        }
        for record in snapshot.idempotency {
            tables.idempotency.insert(record.key.clone(), record);
        }
        for window in snapshot.rate_windows {
            tables
                .rate_windows
                .insert((window.user_id.clone(), window.action.clone()), window);
        }
        tables
    }

    fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            advisors: self.advisors.values().cloned().collect(),
            links: self.links.clone(),
            conversations: self.conversations.values().cloned().collect(),
            messages: self.messages.values().flatten().cloned().collect(),
            memories: self.memories.values().flatten().cloned().collect(),
            idempotency: self.idempotency.values().cloned().collect(),
            rate_windows: self.rate_windows.values().cloned().collect(),
        }
    }

    fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        let conversation_id = self.message_index.get(id)?;
        self.messages
            .get_mut(conversation_id)?
            .iter_mut()
            .find(|m| m.id == id)
    }
}

/// In-process repository, optionally persisted to a snapshot file.
#[derive(Clone, Default)]
pub struct ArenaRepository {
    tables: Arc<RwLock<Tables>>,
    snapshot_path: Option<PathBuf>,
    /// Serializes snapshot writes.
    persist_lock: Arc<Mutex<()>>,
    /// Held open while the data directory is in use; closing it releases the lock.
    dir_lock: Option<Arc<File>>,
    /// Number of upcoming writes that should fail with a storage error.
    injected_failures: Arc<AtomicUsize>,
    /// Writes allowed through before the injected failures start.
    injected_skip: Arc<AtomicUsize>,
}

impl ArenaRepository {
    /// Create an empty, purely in-memory repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a repository mirrored to `<data_dir>/state.json`.
    ///
    /// Fails with [`CoreError::Conflict`] while another repository holds the
    /// directory.
    pub fn open(data_dir: impl AsRef<Path>) -> CoreResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let dir_lock = lock_data_dir(data_dir)?;
        let path = data_dir.join(SNAPSHOT_FILE);
        let snapshot = Snapshot::load(&path)?;
        info!(
            "Opened repository at {} ({} conversations, {} advisors)",
            path.display(),
            snapshot.conversations.len(),
            snapshot.advisors.len()
        );
        Ok(Self {
            tables: Arc::new(RwLock::new(Tables::from_snapshot(snapshot))),
            snapshot_path: Some(path),
            persist_lock: Arc::new(Mutex::new(())),
            dir_lock: Some(Arc::new(dir_lock)),
            injected_failures: Arc::new(AtomicUsize::new(0)),
            injected_skip: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Make the next `count` write operations fail with [`CoreError::Storage`].
    pub fn fail_next_writes(&self, count: usize) {
        self.fail_writes_after(0, count);
    }

    /// Let `skip` writes succeed, then fail the following `count` writes.
    pub fn fail_writes_after(&self, skip: usize, count: usize) {
        self.injected_skip.store(skip, Ordering::SeqCst);
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Snapshot {
        self.tables.read().to_snapshot()
    }

    fn check_write(&self, operation: &str) -> CoreResult<()> {
        if self.injected_failures.load(Ordering::SeqCst) > 0
            && self
                .injected_skip
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Ok(());
        }
        let injected = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            debug!("Injected storage failure for {}", operation);
            return Err(CoreError::Storage(format!("{} failed", operation)));
        }
        Ok(())
    }

    fn persist(&self) -> CoreResult<()> {
        if let Some(path) = &self.snapshot_path {
            let _ordered = self.persist_lock.lock();
            let snapshot = self.tables.read().to_snapshot();
            snapshot.save(path)?;
        }
        Ok(())
    }
}

fn lock_data_dir(data_dir: &Path) -> CoreResult<File> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(data_dir.join(LOCK_FILE))?;
    match file.try_lock() {
        Ok(()) => Ok(file),
        Err(TryLockError::WouldBlock) => Err(CoreError::Conflict(format!(
            "data directory {} is in use by another process",
            data_dir.display()
        ))),
        Err(TryLockError::Error(e)) => Err(e.into()),
    }
}

impl std::fmt::Debug for ArenaRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaRepository")
            .field("snapshot_path", &self.snapshot_path)
            .field("locked", &self.dir_lock.is_some())
            .finish()
    }
}

#[async_trait]
impl Repository for ArenaRepository {
    async fn insert_advisor(&self, advisor: Advisor) -> CoreResult<()> {
        self.check_write("insert_advisor")?;
        {
            let mut tables = self.tables.write();
            if tables.advisors.contains_key(&advisor.id) {
                return Err(CoreError::Conflict(format!("advisor {} exists", advisor.id)));
            }
            tables.advisors.insert(advisor.id.clone(), advisor);
        }
        self.persist()
    }

    async fn get_advisor(&self, id: &str) -> CoreResult<Option<Advisor>> {
        Ok(self.tables.read().advisors.get(id).cloned())
    }

    async fn find_advisor_by_handle(
        &self,
        owner_id: &str,
        handle: &str,
    ) -> CoreResult<Option<Advisor>> {
        Ok(self
            .tables
            .read()
            .advisors
            .values()
            .find(|a| a.owner_id == owner_id && a.handle == handle)
            .cloned())
    }

    async fn list_advisors_by_owner(&self, owner_id: &str) -> CoreResult<Vec<Advisor>> {
        let mut advisors: Vec<Advisor> = self
            .tables
            .read()
            .advisors
            .values()
            .filter(|a| a.owner_id == owner_id)
            .cloned()
            .collect();
        advisors.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.handle.cmp(&b.handle)));
        Ok(advisors)
    }

    async fn update_advisor(&self, advisor: Advisor) -> CoreResult<()> {
        self.check_write("update_advisor")?;
        {
            let mut tables = self.tables.write();
            let slot = tables
                .advisors
                .get_mut(&advisor.id)
                .ok_or_else(|| CoreError::not_found("Advisor", &advisor.id))?;
            *slot = advisor;
        }
        self.persist()
    }

    async fn delete_advisor(&self, id: &str) -> CoreResult<bool> {
        self.check_write("delete_advisor")?;
        let removed = {
            let mut tables = self.tables.write();
            let removed = tables.advisors.remove(id).is_some();
            tables.links.retain(|l| l.advisor_id != id);
            removed
        };
        self.persist()?;
        Ok(removed)
    }

    async fn insert_link(&self, link: UserAdvisorLink) -> CoreResult<bool> {
        self.check_write("insert_link")?;
        let inserted = {
            let mut tables = self.tables.write();
            let exists = tables
                .links
                .iter()
                .any(|l| l.user_id == link.user_id && l.advisor_id == link.advisor_id);
            if !exists {
                tables.links.push(link);
            }
            !exists
        };
        if inserted {
            self.persist()?;
        }
        Ok(inserted)
    }

    async fn delete_link(&self, user_id: &str, advisor_id: &str) -> CoreResult<bool> {
        self.check_write("delete_link")?;
        let removed = {
            let mut tables = self.tables.write();
            let before = tables.links.len();
            tables
                .links
                .retain(|l| !(l.user_id == user_id && l.advisor_id == advisor_id));
            tables.links.len() != before
        };
        self.persist()?;
        Ok(removed)
    }

    async fn list_links(&self, user_id: &str) -> CoreResult<Vec<UserAdvisorLink>> {
        Ok(self
            .tables
            .read()
            .links
            .iter()
            .filter(|l| l.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn insert_conversation(&self, conversation: Conversation) -> CoreResult<()> {
        self.check_write("insert_conversation")?;
        {
            let mut tables = self.tables.write();
            tables
                .conversations
                .insert(conversation.id.clone(), conversation);
        }
        self.persist()
    }

    async fn get_conversation(&self, id: &str) -> CoreResult<Option<Conversation>> {
        Ok(self.tables.read().conversations.get(id).cloned())
    }

    async fn update_conversation(&self, conversation: Conversation) -> CoreResult<()> {
        self.check_write("update_conversation")?;
        {
            let mut tables = self.tables.write();
            let slot = tables
                .conversations
                .get_mut(&conversation.id)
                .ok_or_else(|| CoreError::not_found("Conversation", &conversation.id))?;
            *slot = conversation;
        }
        self.persist()
    }

    async fn list_conversations(&self, owner_id: &str) -> CoreResult<Vec<Conversation>> {
        let mut conversations: Vec<Conversation> = self
            .tables
            .read()
            .conversations
            .values()
            .filter(|c| c.owner_id == owner_id)
            .cloned()
            .collect();
        // Most recently active first
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    async fn delete_conversation(&self, id: &str) -> CoreResult<bool> {
        self.check_write("delete_conversation")?;
        let removed = {
            let mut tables = self.tables.write();
            let removed = tables.conversations.remove(id).is_some();
            if let Some(messages) = tables.messages.remove(id) {
                for message in messages {
                    tables.message_index.remove(&message.id);
                }
            }
            tables.memories.remove(id);
            removed
        };
        self.persist()?;
        Ok(removed)
    }

    async fn insert_message(&self, message: Message) -> CoreResult<()> {
        self.check_write("insert_message")?;
        {
            let mut tables = self.tables.write();
            if !tables.conversations.contains_key(&message.conversation_id) {
                return Err(CoreError::not_found(
                    "Conversation",
                    &message.conversation_id,
                ));
            }
            tables
                .message_index
                .insert(message.id.clone(), message.conversation_id.clone());
            tables
                .messages
                .entry(message.conversation_id.clone())
                .or_default()
                .push(message);
        }
        self.persist()
    }

    async fn get_message(&self, id: &str) -> CoreResult<Option<Message>> {
        let tables = self.tables.read();
        let found = tables
            .message_index
            .get(id)
            .and_then(|c| tables.messages.get(c))
            .and_then(|messages| messages.iter().find(|m| m.id == id))
            .cloned();
        Ok(found)
    }

    async fn update_message(&self, message: Message) -> CoreResult<()> {
        self.check_write("update_message")?;
        {
            let mut tables = self.tables.write();
            let slot = tables
                .message_mut(&message.id)
                .ok_or_else(|| CoreError::not_found("Message", &message.id))?;
            *slot = message;
        }
        self.persist()
    }

    async fn delete_message(&self, id: &str) -> CoreResult<bool> {
        self.check_write("delete_message")?;
        let removed = {
            let mut tables = self.tables.write();
            match tables.message_index.remove(id) {
                Some(conversation_id) => {
                    if let Some(messages) = tables.messages.get_mut(&conversation_id) {
                        messages.retain(|m| m.id != id);
                    }
                    true
                }
                None => false,
            }
        };
        self.persist()?;
        Ok(removed)
    }

    async fn list_messages(&self, conversation_id: &str) -> CoreResult<Vec<Message>> {
        Ok(self
            .tables
            .read()
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_memory(&self, memory: AdvisorMemory) -> CoreResult<()> {
        self.check_write("insert_memory")?;
        {
            let mut tables = self.tables.write();
            if !tables.conversations.contains_key(&memory.conversation_id) {
                return Err(CoreError::not_found("Conversation", &memory.conversation_id));
            }
            tables
                .memories
                .entry(memory.conversation_id.clone())
                .or_default()
                .push(memory);
        }
        self.persist()
    }

    async fn update_memory(&self, memory: AdvisorMemory) -> CoreResult<()> {
        self.check_write("update_memory")?;
        {
            let mut tables = self.tables.write();
            let slot = tables
                .memories
                .get_mut(&memory.conversation_id)
                .and_then(|rows| rows.iter_mut().find(|m| m.id == memory.id))
                .ok_or_else(|| CoreError::not_found("Memory", &memory.id))?;
            *slot = memory;
        }
        self.persist()
    }

    async fn get_memory(
        &self,
        conversation_id: &str,
        advisor_id: &str,
        key: &str,
    ) -> CoreResult<Option<AdvisorMemory>> {
        Ok(self
            .tables
            .read()
            .memories
            .get(conversation_id)
            .and_then(|rows| {
                rows.iter()
                    .find(|m| m.advisor_id == advisor_id && m.key == key)
            })
            .cloned())
    }

    async fn list_memories(
        &self,
        conversation_id: &str,
        advisor_id: Option<&str>,
    ) -> CoreResult<Vec<AdvisorMemory>> {
        Ok(self
            .tables
            .read()
            .memories
            .get(conversation_id)
            .map(|rows| {
                rows.iter()
                    .filter(|m| advisor_id.map_or(true, |a| m.advisor_id == a))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete_memories(&self, conversation_id: &str, advisor_id: &str) -> CoreResult<usize> {
        self.check_write("delete_memories")?;
        let removed = {
            let mut tables = self.tables.write();
            match tables.memories.get_mut(conversation_id) {
                Some(rows) => {
                    let before = rows.len();
                    rows.retain(|m| m.advisor_id != advisor_id);
                    before - rows.len()
                }
                None => 0,
            }
        };
        self.persist()?;
        Ok(removed)
    }

    async fn get_idempotency(&self, key: &str) -> CoreResult<Option<IdempotencyRecord>> {
        Ok(self.tables.read().idempotency.get(key).cloned())
    }

    async fn put_idempotency(&self, record: IdempotencyRecord) -> CoreResult<()> {
        self.check_write("put_idempotency")?;
        {
            let mut tables = self.tables.write();
            tables.idempotency.insert(record.key.clone(), record);
        }
        self.persist()
    }

    async fn purge_idempotency(&self, now: DateTime<Utc>) -> CoreResult<usize> {
        self.check_write("purge_idempotency")?;
        let removed = {
            let mut tables = self.tables.write();
            let before = tables.idempotency.len();
            tables.idempotency.retain(|_, r| r.is_live(now));
            before - tables.idempotency.len()
        };
        self.persist()?;
        Ok(removed)
    }

    async fn get_rate_window(
        &self,
        user_id: &str,
        action: &str,
    ) -> CoreResult<Option<RateLimitWindow>> {
        Ok(self
            .tables
            .read()
            .rate_windows
            .get(&(user_id.to_string(), action.to_string()))
            .cloned())
    }

    async fn put_rate_window(&self, window: RateLimitWindow) -> CoreResult<()> {
        self.check_write("put_rate_window")?;
        {
            let mut tables = self.tables.write();
            tables
                .rate_windows
                .insert((window.user_id.clone(), window.action.clone()), window);
        }
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LinkSource;
    use serde_json::json;

    async fn seeded() -> (ArenaRepository, Conversation) {
        let repo = ArenaRepository::new();
        let conversation = Conversation::new("u1", "Board prep", Utc::now());
        repo.insert_conversation(conversation.clone()).await.unwrap();
        (repo, conversation)
    }

    #[tokio::test]
    async fn test_messages_keep_insertion_order() {
        let (repo, conversation) = seeded().await;
        let now = Utc::now();
        for text in ["one", "two", "three"] {
            repo.insert_message(Message::user(&conversation.id, text, now))
                .await
                .unwrap();
        }

        let contents: Vec<String> = repo
            .list_messages(&conversation.id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_message_requires_conversation() {
        let repo = ArenaRepository::new();
        let err = repo
            .insert_message(Message::user("missing", "hi", Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_conversation_cascades() {
        let (repo, conversation) = seeded().await;
        let message = Message::user(&conversation.id, "hello", Utc::now());
        let message_id = message.id.clone();
        repo.insert_message(message).await.unwrap();
        repo.insert_memory(AdvisorMemory::new(
            &conversation.id,
            "a1",
            "goal",
            json!("raise seed"),
            Utc::now(),
        ))
        .await
        .unwrap();

        assert!(repo.delete_conversation(&conversation.id).await.unwrap());
        assert!(repo.list_messages(&conversation.id).await.unwrap().is_empty());
        assert!(repo
            .list_memories(&conversation.id, None)
            .await
            .unwrap()
            .is_empty());
        assert!(repo.get_message(&message_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_link_not_inserted() {
        let repo = ArenaRepository::new();
        let link = UserAdvisorLink {
            user_id: "u1".to_string(),
            advisor_id: "a1".to_string(),
            source: LinkSource::Selected,
            team_key: None,
            created_at: Utc::now(),
        };
        assert!(repo.insert_link(link.clone()).await.unwrap());
        assert!(!repo.insert_link(link).await.unwrap());
        assert_eq!(repo.list_links("u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let (repo, conversation) = seeded().await;
        repo.fail_next_writes(1);

        let first = repo
            .insert_message(Message::user(&conversation.id, "a", Utc::now()))
            .await;
        assert!(matches!(first, Err(CoreError::Storage(_))));

        let second = repo
            .insert_message(Message::user(&conversation.id, "b", Utc::now()))
            .await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_injected_failures_after_skip() {
        let (repo, conversation) = seeded().await;
        repo.fail_writes_after(1, 1);

        let results = [
            repo.insert_message(Message::user(&conversation.id, "a", Utc::now())).await,
            repo.insert_message(Message::user(&conversation.id, "b", Utc::now())).await,
            repo.insert_message(Message::user(&conversation.id, "c", Utc::now())).await,
        ];
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(CoreError::Storage(_))));
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn test_update_missing_message_is_not_found() {
        let (repo, conversation) = seeded().await;
        let err = repo
            .update_message(Message::user(&conversation.id, "ghost", Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_purge_idempotency() {
        let repo = ArenaRepository::new();
        let now = Utc::now();
        repo.put_idempotency(IdempotencyRecord {
            key: "old".to_string(),
            result: json!(1),
            created_at: now - chrono::Duration::hours(2),
            expires_at: now - chrono::Duration::hours(1),
        })
        .await
        .unwrap();
        repo.put_idempotency(IdempotencyRecord {
            key: "fresh".to_string(),
            result: json!(2),
            created_at: now,
            expires_at: now + chrono::Duration::hours(1),
        })
        .await
        .unwrap();

        assert_eq!(repo.purge_idempotency(now).await.unwrap(), 1);
        assert!(repo.get_idempotency("old").await.unwrap().is_none());
        assert!(repo.get_idempotency("fresh").await.unwrap().is_some());
    }
}
