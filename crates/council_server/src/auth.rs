//! Caller identity extraction.
//!
//! The sign-in flow lives in front of this server; by the time a request
//! arrives here the acting user is carried in the `x-user-id` header.
//! Requests without it run as anonymous and fail `UNAUTHENTICATED` on any
//! operation that needs a user.

use std::convert::Infallible;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use council_guard::AuthContext;

/// Header carrying the authenticated user id.
pub const USER_HEADER: &str = "x-user-id";

/// Header carrying a client-supplied idempotency key.
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// The caller of the current request.
#[derive(Debug, Clone)]
pub struct Caller(pub AuthContext);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = header_value(&parts.headers, USER_HEADER);
        Ok(Caller(AuthContext::from_optional(user_id)))
    }
}

/// The idempotency key of a request, if one was sent.
pub fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    header_value(headers, IDEMPOTENCY_HEADER)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
