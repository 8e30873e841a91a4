//! Error types for the chat system.

use council_core::{CoreError, ErrorCode, StreamState};
use council_guard::GuardError;
use thiserror::Error;

/// Result type for chat operations
pub type ChatResult<T> = Result<T, ChatError>;

/// Chat system errors
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid state for {operation}: stream is {current}")]
    InvalidState {
        current: StreamState,
        operation: &'static str,
    },

    #[error("Message {0} is not a streamed advisor reply")]
    NotStreamed(String),

    #[error("Upstream stream failure: {0}")]
    UpstreamStreamFailure(String),

    #[error("LLM not configured. Set OPENAI_API_KEY or ANTHROPIC_API_KEY")]
    LlmNotConfigured,

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl ChatError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidPayload(_) => ErrorCode::InvalidPayload,
            Self::Conflict(_) => ErrorCode::Conflict,
            Self::InvalidState { .. } | Self::NotStreamed(_) => ErrorCode::InvalidState,
            Self::UpstreamStreamFailure(_) | Self::LlmNotConfigured | Self::LlmError(_) => {
                ErrorCode::UpstreamStreamFailure
            }
            Self::Guard(e) => e.code(),
            Self::Core(e) => e.code(),
        }
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        Self::Core(CoreError::from(err))
    }
}
