//! Chat manager.
//!
//! Entry point for chat operations. Wires the guards, registrar, stores and
//! stream aggregator together and drives one conversational turn:
//!
//! 1. Validate and store the user message (ownership, rate limit, length).
//! 2. Resolve @mentions over the caller's selected advisors. Without a
//!    mention the conversation's active advisor answers, if there is one.
//! 3. For each target advisor, build its prompt, open a stream and pump the
//!    upstream chunks through the aggregator, forwarding each chunk to the
//!    caller's sink. The reply is finalized, or aborted on upstream failure
//!    or when the sink goes away.

use std::sync::Arc;

use council_core::{
    Advisor, Clock, CouncilConfig, Message, MessageId, Repository, StreamState,
};
use council_guard::{AuthContext, IdempotencyStore, RateLimiter};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::conversations::{ConversationService, ConversationUpdate};
use crate::error::ChatResult;
use crate::llm::CompletionSource;
use crate::memory::MemoryStore;
use crate::mentions::MentionResolver;
use crate::prompts::PromptBuilder;
use crate::registrar::IdentityRegistrar;
use crate::stream::StreamAggregator;

/// Receives reply chunks as they arrive.
pub type ChunkSink = mpsc::Sender<String>;

/// Sent to the sink between two advisors' replies.
pub const REPLY_SEPARATOR: &str = "\n\n";

/// Abort reason recorded when the sink is dropped mid-reply.
pub const CLIENT_DISCONNECTED: &str = "client disconnected";

/// A user message that has been stored and routed, ready to be answered.
#[derive(Debug, Clone)]
pub struct PreparedTurn {
    pub caller: AuthContext,
    pub conversation_id: String,
    pub user_message: Message,
    /// Advisors that will reply, in order
    pub targets: Vec<Advisor>,
    /// The caller's selected advisors, used to name speakers in history
    pub council: Vec<Advisor>,
}

/// How one advisor's reply ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvisorReply {
    pub advisor_id: String,
    /// Absent when the reply could not even be opened
    pub message_id: Option<MessageId>,
    pub content: String,
    pub state: StreamState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AdvisorReply {
    pub fn is_complete(&self) -> bool {
        self.state == StreamState::Finalized
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOutcome {
    pub user_message: Message,
    pub replies: Vec<AdvisorReply>,
}

/// Main chat manager
pub struct ChatManager {
    repo: Arc<dyn Repository>,
    config: CouncilConfig,
    completion: Arc<dyn CompletionSource>,
    idempotency: Arc<IdempotencyStore>,
    registrar: IdentityRegistrar,
    conversations: ConversationService,
    memory: MemoryStore,
    streams: StreamAggregator,
    mentions: MentionResolver,
    prompts: PromptBuilder,
}

impl ChatManager {
    pub fn new(
        repo: Arc<dyn Repository>,
        clock: Arc<dyn Clock>,
        config: CouncilConfig,
        completion: Arc<dyn CompletionSource>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(repo.clone(), clock.clone(), &config));
        let idempotency = Arc::new(IdempotencyStore::new(
            repo.clone(),
            clock.clone(),
            config.idempotency_ttl(),
        ));

        Self {
            registrar: IdentityRegistrar::new(
                repo.clone(),
                clock.clone(),
                limiter.clone(),
                idempotency.clone(),
                config.max_handle_attempts,
            ),
            conversations: ConversationService::new(
                repo.clone(),
                clock.clone(),
                limiter,
                config.max_message_length,
            ),
            memory: MemoryStore::new(repo.clone(), clock.clone()),
            streams: StreamAggregator::new(repo.clone(), clock),
            mentions: MentionResolver::new(),
            prompts: PromptBuilder::new(config.history_window),
            idempotency,
            completion,
            config,
            repo,
        }
    }

    pub fn config(&self) -> &CouncilConfig {
        &self.config
    }

    pub fn registrar(&self) -> &IdentityRegistrar {
        &self.registrar
    }

    pub fn conversations(&self) -> &ConversationService {
        &self.conversations
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn streams(&self) -> &StreamAggregator {
        &self.streams
    }

    pub fn idempotency(&self) -> &IdempotencyStore {
        &self.idempotency
    }

    /// Advisors mentioned in `content`, chosen from the caller's active set.
    pub async fn resolve_mentions(
        &self,
        caller: &AuthContext,
        content: &str,
    ) -> ChatResult<Vec<Advisor>> {
        let council = self.registrar.selected_advisors(caller).await?;
        Ok(self
            .mentions
            .resolve(content, &council)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Store the user message and decide which advisors answer it.
    pub async fn prepare_turn(
        &self,
        caller: &AuthContext,
        conversation_id: &str,
        content: &str,
    ) -> ChatResult<PreparedTurn> {
        let user_message = self
            .conversations
            .append_user_message(caller, conversation_id, content)
            .await?;
        let council = self.registrar.selected_advisors(caller).await?;
        let mentioned: Vec<Advisor> = self
            .mentions
            .resolve(&user_message.content, &council)
            .into_iter()
            .cloned()
            .collect();

        let targets = match mentioned.last().map(|a| a.id.clone()) {
            Some(last_id) => {
                self.conversations
                    .update(
                        caller,
                        conversation_id,
                        ConversationUpdate {
                            title: None,
                            active_advisor_id: Some(Some(last_id)),
                        },
                    )
                    .await?;
                mentioned
            }
            None => self.active_advisor(caller, conversation_id).await?,
        };

        debug!(
            "Turn in {} routed to {} advisor(s)",
            conversation_id,
            targets.len()
        );
        Ok(PreparedTurn {
            caller: caller.clone(),
            conversation_id: conversation_id.to_string(),
            user_message,
            targets,
            council,
        })
    }

    async fn active_advisor(
        &self,
        caller: &AuthContext,
        conversation_id: &str,
    ) -> ChatResult<Vec<Advisor>> {
        let conversation = self.conversations.get(caller, conversation_id).await?;
        let Some(advisor_id) = conversation.active_advisor_id else {
            return Ok(Vec::new());
        };
        Ok(self
            .repo
            .get_advisor(&advisor_id)
            .await?
            .filter(Advisor::is_active)
            .into_iter()
            .collect())
    }

    /// Generate every target advisor's reply.
    ///
    /// Upstream failures do not fail the turn: the affected reply is aborted
    /// with whatever content arrived and reported in the outcome. When the
    /// sink closes, the current reply is aborted and remaining advisors are
    /// skipped.
    pub async fn run_turn(
        &self,
        turn: &PreparedTurn,
        sink: Option<ChunkSink>,
    ) -> ChatResult<TurnOutcome> {
        let mut replies = Vec::with_capacity(turn.targets.len());

        for (index, advisor) in turn.targets.iter().enumerate() {
            if let Some(sink) = &sink {
                if sink.is_closed() {
                    break;
                }
                if index > 0 && sink.send(REPLY_SEPARATOR.to_string()).await.is_err() {
                    break;
                }
            }

            let reply = self.run_advisor(turn, advisor, sink.as_ref()).await;
            let disconnected = reply.error.as_deref() == Some(CLIENT_DISCONNECTED);
            replies.push(reply);
            if disconnected {
                break;
            }
        }

        info!(
            "Turn in {} finished: {}/{} replies complete",
            turn.conversation_id,
            replies.iter().filter(|r| r.is_complete()).count(),
            turn.targets.len()
        );
        Ok(TurnOutcome {
            user_message: turn.user_message.clone(),
            replies,
        })
    }

    /// Store a user message and run the resulting turn.
    pub async fn send_message(
        &self,
        caller: &AuthContext,
        conversation_id: &str,
        content: &str,
        sink: Option<ChunkSink>,
    ) -> ChatResult<TurnOutcome> {
        let turn = self.prepare_turn(caller, conversation_id, content).await?;
        self.run_turn(&turn, sink).await
    }

    async fn run_advisor(
        &self,
        turn: &PreparedTurn,
        advisor: &Advisor,
        sink: Option<&ChunkSink>,
    ) -> AdvisorReply {
        let caller = &turn.caller;
        let message_id = match self
            .streams
            .open(caller, &turn.conversation_id, &advisor.id)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!("Could not open reply for advisor {}: {}", advisor.id, e);
                return AdvisorReply {
                    advisor_id: advisor.id.clone(),
                    message_id: None,
                    content: String::new(),
                    state: StreamState::Aborted,
                    error: Some(e.to_string()),
                };
            }
        };

        let memories = self
            .memory
            .get_conversation_memories(caller, &turn.conversation_id, Some(&advisor.id))
            .await
            .unwrap_or_else(|e| {
                warn!("Loading memories for {} failed: {}", advisor.id, e);
                Vec::new()
            });
        let history = self
            .conversations
            .list_messages(caller, &turn.conversation_id)
            .await
            .unwrap_or_else(|e| {
                warn!("Loading history for {} failed: {}", turn.conversation_id, e);
                Vec::new()
            });
        let request = self
            .prompts
            .build(advisor, &turn.council, &memories, &history);

        let mut upstream = match self.completion.stream(request).await {
            Ok(stream) => stream,
            Err(e) => {
                return self
                    .abort_reply(caller, advisor, message_id, String::new(), e.to_string())
                    .await
            }
        };

        let mut content = String::new();
        while let Some(item) = upstream.next().await {
            let chunk = match item {
                Ok(chunk) if chunk.is_empty() => continue,
                Ok(chunk) => chunk,
                Err(e) => {
                    return self
                        .abort_reply(caller, advisor, message_id, content, e.to_string())
                        .await
                }
            };

            if let Err(e) = self.streams.append_chunk(caller, &message_id, &chunk).await {
                return self
                    .abort_reply(caller, advisor, message_id, content, e.to_string())
                    .await;
            }
            content.push_str(&chunk);

            if let Some(sink) = sink {
                if sink.send(chunk).await.is_err() {
                    return self
                        .abort_reply(
                            caller,
                            advisor,
                            message_id,
                            content,
                            CLIENT_DISCONNECTED.to_string(),
                        )
                        .await;
                }
            }
        }

        match self.streams.finalize(caller, &message_id).await {
            Ok(message) => AdvisorReply {
                advisor_id: advisor.id.clone(),
                message_id: Some(message_id),
                content: message.content,
                state: StreamState::Finalized,
                error: None,
            },
            Err(e) => {
                self.abort_reply(caller, advisor, message_id, content, e.to_string())
                    .await
            }
        }
    }

    async fn abort_reply(
        &self,
        caller: &AuthContext,
        advisor: &Advisor,
        message_id: MessageId,
        content: String,
        reason: String,
    ) -> AdvisorReply {
        let (content, state) = match self.streams.abort(caller, &message_id, &reason).await {
            Ok(message) => (
                message.content,
                message.stream_state.unwrap_or(StreamState::Aborted),
            ),
            Err(e) => {
                warn!("Failed to abort reply {}: {}", message_id, e);
                (content, StreamState::Aborted)
            }
        };
        warn!("Reply {} from {} aborted: {}", message_id, advisor.id, reason);
        AdvisorReply {
            advisor_id: advisor.id.clone(),
            message_id: Some(message_id),
            content,
            state,
            error: Some(reason),
        }
    }
}
