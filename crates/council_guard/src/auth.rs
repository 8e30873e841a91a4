//! Caller identity carried through every request.

use council_core::UserId;

use crate::error::{GuardError, GuardResult};

/// Identity resolved by the transport layer (header, CLI flag, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    user_id: Option<UserId>,
}

impl AuthContext {
    /// A caller with no resolvable identity.
    pub fn anonymous() -> Self {
        Self { user_id: None }
    }

    /// An authenticated caller. Blank ids are treated as anonymous.
    pub fn user(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        if user_id.trim().is_empty() {
            return Self::anonymous();
        }
        Self {
            user_id: Some(user_id),
        }
    }

    pub fn from_optional(user_id: Option<String>) -> Self {
        user_id.map(Self::user).unwrap_or_default()
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }

    /// The caller's id, or `Unauthenticated`.
    pub fn require_user(&self) -> GuardResult<&str> {
        self.user_id.as_deref().ok_or(GuardError::Unauthenticated)
    }
}
