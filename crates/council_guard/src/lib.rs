//! # council_guard
//!
//! Request-level guards for Council.
//!
//! Every mutating entry point runs through these before touching state:
//!
//! - **AuthContext**: resolves the acting user or fails `UNAUTHENTICATED`
//! - **OwnershipGuard**: confirms the caller owns the conversation, advisor or
//!   message being touched
//! - **RateLimiter**: fixed-window throttle per (user, action)
//! - **IdempotencyStore**: replays stored results for retried requests

pub mod auth;
pub mod error;
pub mod idempotency;
pub mod locks;
pub mod ownership;
pub mod rate_limit;

pub use auth::AuthContext;
pub use error::{GuardError, GuardResult};
pub use idempotency::IdempotencyStore;
pub use locks::KeyedLocks;
pub use ownership::OwnershipGuard;
pub use rate_limit::{RateDecision, RateLimiter};
