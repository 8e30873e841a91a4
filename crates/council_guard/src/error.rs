//! Error types for request guards.

use council_core::{CoreError, ErrorCode};
use thiserror::Error;

/// Result type alias for guard operations.
pub type GuardResult<T> = Result<T, GuardError>;

/// Errors raised before a request is allowed to touch state.
#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Authentication required")]
    Unauthenticated,

    #[error("User {user_id} does not own {kind} {id}")]
    Unauthorized {
        user_id: String,
        kind: &'static str,
        id: String,
    },

    #[error("Rate limit exceeded for {action}; retry in {retry_after_secs}s")]
    RateLimited {
        action: String,
        retry_after_secs: u64,
    },

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl GuardError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unauthenticated => ErrorCode::Unauthenticated,
            Self::Unauthorized { .. } => ErrorCode::Unauthorized,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::Core(e) => e.code(),
        }
    }
}
