//! End-to-end flows through the chat manager.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use council_chat::{
    AdvisorPayload, ChatManager, ChatResult, ChunkStream, CompletionRequest, CompletionSource,
    MentionResolver,
};
use council_core::{
    ArenaRepository, CouncilConfig, ErrorCode, ManualClock, Repository, StreamState,
};
use council_guard::AuthContext;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Replies with a fixed list of chunks and records every request.
struct ScriptedSource {
    chunks: Vec<String>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedSource {
    fn new(chunks: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl CompletionSource for ScriptedSource {
    async fn stream(&self, request: CompletionRequest) -> ChatResult<ChunkStream> {
        self.requests.lock().push(request);
        let items: Vec<ChatResult<String>> = self.chunks.iter().cloned().map(Ok).collect();
        Ok(stream::iter(items).boxed())
    }
}

fn manager(repo: Arc<ArenaRepository>, source: Arc<ScriptedSource>) -> ChatManager {
    ChatManager::new(
        repo,
        Arc::new(ManualClock::default()),
        CouncilConfig::default(),
        source,
    )
}

fn payload(name: &str) -> AdvisorPayload {
    AdvisorPayload::new(name, "Seasoned operator", "Help the founder decide")
}

#[tokio::test]
async fn test_same_name_twice_gets_suffixed_handle() {
    let manager = manager(Arc::new(ArenaRepository::new()), ScriptedSource::new(&[]));
    let caller = AuthContext::user("u1");

    let first = manager.registrar().create(&caller, payload("CEO Coach")).await.unwrap();
    let second = manager.registrar().create(&caller, payload("CEO Coach")).await.unwrap();

    assert_eq!(first.handle, "ceo-coach");
    assert_eq!(second.handle, "ceo-coach-2");
}

#[tokio::test]
async fn test_handles_unique_per_owner() {
    let manager = manager(Arc::new(ArenaRepository::new()), ScriptedSource::new(&[]));
    let caller = AuthContext::user("u1");

    for name in ["Ops", "ops", "OPS!", "  ops  ", "Óps", "***"] {
        manager.registrar().create(&caller, payload(name)).await.unwrap();
    }
    let handles: Vec<String> = manager
        .registrar()
        .list_owned(&caller)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.handle)
        .collect();
    let unique: HashSet<&String> = handles.iter().collect();
    assert_eq!(unique.len(), handles.len());
    assert!(handles.contains(&"advisor".to_string()));
}

#[tokio::test]
async fn test_full_name_mention_resolves() {
    let manager = manager(Arc::new(ArenaRepository::new()), ScriptedSource::new(&[]));
    let caller = AuthContext::user("u1");
    let marcus = manager
        .registrar()
        .create(&caller, payload("Marcus Wellington"))
        .await
        .unwrap();
    manager
        .registrar()
        .create(&caller, payload("Marcus Aurelius"))
        .await
        .unwrap();

    let found = manager
        .resolve_mentions(&caller, "@Marcus Wellington please review")
        .await
        .unwrap();
    let ids: Vec<&str> = found.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, vec![marcus.advisor_id.as_str()]);
}

#[tokio::test]
async fn test_archived_advisor_not_mentionable() {
    let manager = manager(Arc::new(ArenaRepository::new()), ScriptedSource::new(&[]));
    let caller = AuthContext::user("u1");
    let sarah = manager.registrar().create(&caller, payload("Sarah Chen")).await.unwrap();
    manager.registrar().archive(&caller, &sarah.advisor_id).await.unwrap();

    let found = manager.resolve_mentions(&caller, "@Sarah").await.unwrap();
    assert!(found.is_empty());
}

#[tokio::test]
async fn test_stream_hello_world_by_hand() {
    let repo = Arc::new(ArenaRepository::new());
    let manager = manager(repo.clone(), ScriptedSource::new(&[]));
    let caller = AuthContext::user("u1");
    let advisor = manager.registrar().create(&caller, payload("Marcus")).await.unwrap();
    let conversation = manager.conversations().create(&caller, None).await.unwrap();

    let streams = manager.streams();
    let id = streams
        .open(&caller, &conversation.id, &advisor.advisor_id)
        .await
        .unwrap();
    streams.append_chunk(&caller, &id, "Hello").await.unwrap();
    streams.append_chunk(&caller, &id, ", world").await.unwrap();
    streams.finalize(&caller, &id).await.unwrap();

    let stored = repo.get_message(&id).await.unwrap().unwrap();
    assert_eq!(stored.content, "Hello, world");
    assert!(!stored.partial);
    assert_eq!(stored.stream_state, Some(StreamState::Finalized));
}

#[tokio::test]
async fn test_streamed_turn_matches_sink_output() {
    let repo = Arc::new(ArenaRepository::new());
    let source = ScriptedSource::new(&["Raise ", "after ", "traction."]);
    let manager = manager(repo.clone(), source.clone());
    let caller = AuthContext::user("u1");
    manager.registrar().create(&caller, payload("Sarah Chen")).await.unwrap();
    let conversation = manager.conversations().create(&caller, None).await.unwrap();
    manager
        .memory()
        .set_memory(
            &caller,
            &conversation.id,
            &manager.registrar().list_owned(&caller).await.unwrap()[0].id,
            "stage",
            json!("pre-seed"),
        )
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel(8);
    let outcome = manager
        .send_message(&caller, &conversation.id, "@Sarah when should we raise?", Some(tx))
        .await
        .unwrap();

    let mut streamed = String::new();
    while let Some(chunk) = rx.recv().await {
        streamed.push_str(&chunk);
    }
    assert_eq!(streamed, "Raise after traction.");
    assert_eq!(outcome.replies[0].content, streamed);

    let requests = source.requests.lock();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].system.contains("stage: pre-seed"));

    let messages = repo.list_messages(&conversation.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "Raise after traction.");
}

#[tokio::test]
async fn test_other_user_cannot_touch_conversation() {
    let repo = Arc::new(ArenaRepository::new());
    let manager = manager(repo.clone(), ScriptedSource::new(&["hi"]));
    let owner = AuthContext::user("u1");
    let intruder = AuthContext::user("u2");
    let conversation = manager.conversations().create(&owner, None).await.unwrap();

    let err = manager
        .send_message(&intruder, &conversation.id, "hello", None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Unauthorized);
    assert!(repo.list_messages(&conversation.id).await.unwrap().is_empty());

    let err = manager
        .memory()
        .get_conversation_memories(&intruder, &conversation.id, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Unauthorized);
}

#[tokio::test]
async fn test_delete_conversation_removes_everything() {
    let repo = Arc::new(ArenaRepository::new());
    let manager = manager(repo.clone(), ScriptedSource::new(&["noted"]));
    let caller = AuthContext::user("u1");
    let advisor = manager.registrar().create(&caller, payload("Marcus")).await.unwrap();
    let conversation = manager.conversations().create(&caller, None).await.unwrap();

    manager
        .send_message(&caller, &conversation.id, "@Marcus remember this", None)
        .await
        .unwrap();
    manager
        .memory()
        .set_memory(&caller, &conversation.id, &advisor.advisor_id, "fact", json!(42))
        .await
        .unwrap();

    manager.conversations().delete(&caller, &conversation.id).await.unwrap();

    assert!(repo.list_messages(&conversation.id).await.unwrap().is_empty());
    assert!(repo
        .list_memories(&conversation.id, None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_idempotent_create_replays_across_restart() {
    let dir = TempDir::new().unwrap();
    let caller = AuthContext::user("u1");

    let first = {
        let repo = Arc::new(ArenaRepository::open(dir.path()).unwrap());
        manager(repo, ScriptedSource::new(&[]))
            .registrar()
            .create_with_key(&caller, Some("req-1"), payload("CFO"))
            .await
            .unwrap()
    };

    let repo = Arc::new(ArenaRepository::open(dir.path()).unwrap());
    let manager = manager(repo.clone(), ScriptedSource::new(&[]));
    let replay = manager
        .registrar()
        .create_with_key(&caller, Some("req-1"), payload("CFO"))
        .await
        .unwrap();

    assert_eq!(first, replay);
    assert_eq!(repo.list_advisors_by_owner("u1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_mentions_never_invent_ids() {
    let manager = manager(Arc::new(ArenaRepository::new()), ScriptedSource::new(&[]));
    let caller = AuthContext::user("u1");
    for name in ["Ana Lima", "Ana Souza", "Bo Chen"] {
        manager.registrar().create(&caller, payload(name)).await.unwrap();
    }
    let council = manager.registrar().selected_advisors(&caller).await.unwrap();
    let known: HashSet<&str> = council.iter().map(|a| a.id.as_str()).collect();

    for text in [
        "@Ana @Bo @Ana @bo",
        "@Ana Souza and @Ana Lima and @Ana Souza",
        "@Zed @ @@Ana",
        "email me at ana@example.com",
    ] {
        let ids = MentionResolver::new().extract_mentions(text, &council);
        let unique: HashSet<&str> = ids.iter().map(String::as_str).collect();
        assert_eq!(unique.len(), ids.len(), "duplicates for {:?}", text);
        assert!(unique.is_subset(&known), "unknown id for {:?}", text);
    }
}
