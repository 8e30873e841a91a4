//! HTTP endpoint handlers

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use council_chat::{AdvisorPayload, ConversationUpdate, CreatedAdvisor};
use council_core::{Advisor, AdvisorMemory, Conversation, CoreError, Message, StreamState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::auth::{idempotency_key, Caller};
use crate::error::{ApiError, ApiResult};
use crate::AppState;

type JsonBody<T> = Result<Json<T>, JsonRejection>;

/// Buffered chunks between the turn driver and the response body.
const CHAT_CHANNEL_CAPACITY: usize = 32;

// ============================================================================
// Advisors
// ============================================================================

/// Create an advisor, honouring an `Idempotency-Key` header
pub async fn create_advisor(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    headers: HeaderMap,
    body: JsonBody<AdvisorPayload>,
) -> ApiResult<(StatusCode, Json<CreatedAdvisor>)> {
    let Json(payload) = body?;
    let key = idempotency_key(&headers);
    let created = state
        .manager
        .registrar()
        .create_with_key(&caller, key.as_deref(), payload)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn list_advisors(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
) -> ApiResult<Json<Vec<Advisor>>> {
    Ok(Json(state.manager.registrar().list_owned(&caller).await?))
}

/// The caller's active advisor set
pub async fn selected_advisors(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
) -> ApiResult<Json<Vec<Advisor>>> {
    Ok(Json(state.manager.registrar().selected_advisors(&caller).await?))
}

pub async fn get_advisor(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Advisor>> {
    Ok(Json(state.manager.registrar().get(&caller, &id).await?))
}

pub async fn archive_advisor(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Advisor>> {
    Ok(Json(state.manager.registrar().archive(&caller, &id).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectQuery {
    pub team_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChangedResponse {
    pub changed: bool,
}

pub async fn select_advisor(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    query: Result<Query<SelectQuery>, QueryRejection>,
) -> ApiResult<Json<ChangedResponse>> {
    let Query(query) = query?;
    let changed = state
        .manager
        .registrar()
        .select(&caller, &id, query.team_key)
        .await?;
    Ok(Json(ChangedResponse { changed }))
}

pub async fn unselect_advisor(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<ChangedResponse>> {
    let changed = state.manager.registrar().unselect(&caller, &id).await?;
    Ok(Json(ChangedResponse { changed }))
}

// ============================================================================
// Mentions
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ContentRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MentionsResponse {
    pub advisor_ids: Vec<String>,
    pub advisors: Vec<Advisor>,
}

/// Resolve @mentions without storing anything
pub async fn resolve_mentions(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    body: JsonBody<ContentRequest>,
) -> ApiResult<Json<MentionsResponse>> {
    let Json(request) = body?;
    let advisors = state
        .manager
        .resolve_mentions(&caller, &request.content)
        .await?;
    Ok(Json(MentionsResponse {
        advisor_ids: advisors.iter().map(|a| a.id.clone()).collect(),
        advisors,
    }))
}

// ============================================================================
// Conversations
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub title: Option<String>,
}

pub async fn create_conversation(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    body: JsonBody<CreateConversationRequest>,
) -> ApiResult<(StatusCode, Json<Conversation>)> {
    let Json(request) = body?;
    let conversation = state
        .manager
        .conversations()
        .create(&caller, request.title.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
) -> ApiResult<Json<Vec<Conversation>>> {
    Ok(Json(state.manager.conversations().list(&caller).await?))
}

pub async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Conversation>> {
    Ok(Json(state.manager.conversations().get(&caller, &id).await?))
}

pub async fn update_conversation(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    body: JsonBody<ConversationUpdate>,
) -> ApiResult<Json<Conversation>> {
    let Json(update) = body?;
    Ok(Json(
        state
            .manager
            .conversations()
            .update(&caller, &id, update)
            .await?,
    ))
}

pub async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.manager.conversations().delete(&caller, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Messages
// ============================================================================

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Message>>> {
    Ok(Json(
        state
            .manager
            .conversations()
            .list_messages(&caller, &id)
            .await?,
    ))
}

/// Store a user message without asking any advisor
pub async fn append_message(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    body: JsonBody<ContentRequest>,
) -> ApiResult<(StatusCode, Json<Message>)> {
    let Json(request) = body?;
    let message = state
        .manager
        .conversations()
        .append_user_message(&caller, &id, &request.content)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn edit_message(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    body: JsonBody<ContentRequest>,
) -> ApiResult<Json<Message>> {
    let Json(request) = body?;
    Ok(Json(
        state
            .manager
            .conversations()
            .edit_message(&caller, &id, &request.content)
            .await?,
    ))
}

pub async fn delete_message(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .manager
        .conversations()
        .delete_message(&caller, &id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Send a message and stream the advisors' replies as raw text.
///
/// Guard, validation and rate-limit failures are returned as JSON errors
/// before any body is written. Once streaming starts, upstream failures end
/// the body early; the partial reply stays stored.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    body: JsonBody<ContentRequest>,
) -> ApiResult<Response> {
    let Json(request) = body?;
    let turn = state
        .manager
        .prepare_turn(&caller, &id, &request.content)
        .await?;
    debug!(
        "Streaming turn in {} to {} advisor(s)",
        id,
        turn.targets.len()
    );

    let (tx, rx) = mpsc::channel::<String>(CHAT_CHANNEL_CAPACITY);
    let driver = state.clone();
    tokio::spawn(async move {
        if let Err(e) = driver.manager.run_turn(&turn, Some(tx)).await {
            warn!("Turn in {} failed: {}", turn.conversation_id, e);
        }
    });

    let chunks = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|chunk| (Ok::<_, Infallible>(chunk), rx))
    });
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(chunks),
    )
        .into_response())
}

// ============================================================================
// Streams
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenStreamRequest {
    pub advisor_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenStreamResponse {
    pub message_id: String,
}

pub async fn open_stream(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    body: JsonBody<OpenStreamRequest>,
) -> ApiResult<(StatusCode, Json<OpenStreamResponse>)> {
    let Json(request) = body?;
    let message_id = state
        .manager
        .streams()
        .open(&caller, &id, &request.advisor_id)
        .await?;
    Ok((StatusCode::CREATED, Json(OpenStreamResponse { message_id })))
}

#[derive(Debug, Deserialize)]
pub struct ChunkRequest {
    pub text: String,
}

pub async fn append_chunk(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    body: JsonBody<ChunkRequest>,
) -> ApiResult<Json<Message>> {
    let Json(request) = body?;
    Ok(Json(
        state
            .manager
            .streams()
            .append_chunk(&caller, &id, &request.text)
            .await?,
    ))
}

pub async fn finalize_stream(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Message>> {
    Ok(Json(state.manager.streams().finalize(&caller, &id).await?))
}

#[derive(Debug, Deserialize)]
pub struct AbortRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn abort_stream(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    body: JsonBody<AbortRequest>,
) -> ApiResult<Json<Message>> {
    let Json(request) = body?;
    let reason = request.reason.unwrap_or_else(|| "aborted by client".to_string());
    Ok(Json(
        state
            .manager
            .streams()
            .abort(&caller, &id, &reason)
            .await?,
    ))
}

#[derive(Debug, Serialize)]
pub struct StreamStateResponse {
    pub state: StreamState,
}

pub async fn stream_state(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<StreamStateResponse>> {
    let current = state.manager.streams().state(&caller, &id).await?;
    Ok(Json(StreamStateResponse { state: current }))
}

// ============================================================================
// Memory
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryQuery {
    pub advisor_id: Option<String>,
}

pub async fn list_memories(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    query: Result<Query<MemoryQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<AdvisorMemory>>> {
    let Query(query) = query?;
    Ok(Json(
        state
            .manager
            .memory()
            .get_conversation_memories(&caller, &id, query.advisor_id.as_deref())
            .await?,
    ))
}

pub async fn get_memory(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path((id, advisor_id, key)): Path<(String, String, String)>,
) -> ApiResult<Json<AdvisorMemory>> {
    let memory = state
        .manager
        .memory()
        .get_memory_by_key(&caller, &id, &advisor_id, &key)
        .await?;
    memory
        .map(Json)
        .ok_or_else(|| ApiError::from(CoreError::not_found("Memory", key)))
}

#[derive(Debug, Deserialize)]
pub struct SetMemoryRequest {
    pub value: Value,
}

pub async fn set_memory(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path((id, advisor_id, key)): Path<(String, String, String)>,
    body: JsonBody<SetMemoryRequest>,
) -> ApiResult<Json<AdvisorMemory>> {
    let Json(request) = body?;
    Ok(Json(
        state
            .manager
            .memory()
            .set_memory(&caller, &id, &advisor_id, &key, request.value)
            .await?,
    ))
}

#[derive(Debug, Serialize)]
pub struct ClearedResponse {
    pub cleared: usize,
}

pub async fn clear_memories(
    State(state): State<Arc<AppState>>,
    Caller(caller): Caller,
    Path((id, advisor_id)): Path<(String, String)>,
) -> ApiResult<Json<ClearedResponse>> {
    let cleared = state
        .manager
        .memory()
        .clear_advisor_memories(&caller, &id, &advisor_id)
        .await?;
    Ok(Json(ClearedResponse { cleared }))
}

// ============================================================================
// System
// ============================================================================

pub async fn health() -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
