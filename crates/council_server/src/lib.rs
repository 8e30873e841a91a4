//! Council Server - Advisor API Server
//!
//! HTTP front end for the chat manager. Identity arrives in the `x-user-id`
//! header; every failure is a `{error, message}` JSON body.

pub mod auth;
pub mod error;
pub mod http;

use std::path::Path;
use std::sync::Arc;

use axum::{
    routing::{get, patch, post},
    Router,
};
use council_chat::{completion_source_from_settings, ChatError, ChatManager, EchoCompletionSource};
use council_core::{ArenaRepository, CouncilConfig, SystemClock};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use auth::{Caller, IDEMPOTENCY_HEADER, USER_HEADER};
pub use error::{ApiError, ApiResult};

/// Shared application state
pub struct AppState {
    pub manager: ChatManager,
}

impl AppState {
    pub fn new(manager: ChatManager) -> Self {
        Self { manager }
    }

    /// Open the data directory: settings, persisted state and model provider.
    ///
    /// Without an API key for the configured provider, replies fall back to
    /// the offline echo source.
    pub fn open(data_dir: &Path) -> Result<Self, ChatError> {
        let config = CouncilConfig::load(data_dir)?;
        let repo = Arc::new(ArenaRepository::open(data_dir)?);
        let completion = match completion_source_from_settings(&config.llm) {
            Ok(source) => source,
            Err(ChatError::LlmNotConfigured) => {
                tracing::warn!("No model API key configured, using echo replies");
                Arc::new(EchoCompletionSource)
            }
            Err(e) => return Err(e),
        };
        Ok(Self::new(ChatManager::new(
            repo,
            Arc::new(SystemClock),
            config,
            completion,
        )))
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Advisor endpoints
        .route(
            "/advisors",
            get(http::list_advisors).post(http::create_advisor),
        )
        .route("/advisors/selected", get(http::selected_advisors))
        .route("/advisors/{id}", get(http::get_advisor))
        .route("/advisors/{id}/archive", post(http::archive_advisor))
        .route(
            "/advisors/{id}/select",
            post(http::select_advisor).delete(http::unselect_advisor),
        )
        // Mention endpoints
        .route("/mentions", post(http::resolve_mentions))
        // Conversation endpoints
        .route(
            "/conversations",
            get(http::list_conversations).post(http::create_conversation),
        )
        .route(
            "/conversations/{id}",
            get(http::get_conversation)
                .patch(http::update_conversation)
                .delete(http::delete_conversation),
        )
        .route(
            "/conversations/{id}/messages",
            get(http::list_messages).post(http::append_message),
        )
        .route("/conversations/{id}/chat", post(http::chat))
        .route("/conversations/{id}/streams", post(http::open_stream))
        // Stream endpoints
        .route("/streams/{id}", get(http::stream_state))
        .route("/streams/{id}/chunks", post(http::append_chunk))
        .route("/streams/{id}/finalize", post(http::finalize_stream))
        .route("/streams/{id}/abort", post(http::abort_stream))
        // Message endpoints
        .route(
            "/messages/{id}",
            patch(http::edit_message).delete(http::delete_message),
        )
        // Memory endpoints
        .route("/conversations/{id}/memories", get(http::list_memories))
        .route(
            "/conversations/{id}/advisors/{advisor_id}/memories",
            axum::routing::delete(http::clear_memories),
        )
        .route(
            "/conversations/{id}/advisors/{advisor_id}/memories/{key}",
            get(http::get_memory).put(http::set_memory),
        )
        // System endpoints
        .route("/health", get(http::health))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the server
pub async fn serve(addr: &str, state: Arc<AppState>) -> std::io::Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Council server listening on {}", addr);
    axum::serve(listener, app).await
}
