//! Fixed-window call counter keyed by (user, action).

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;
use council_core::{Clock, CouncilConfig, RateLimitRule, RateLimitWindow, Repository};
use tracing::{debug, warn};

use crate::error::{GuardError, GuardResult};
use crate::locks::KeyedLocks;

/// Outcome of a single rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Calls counted in the current window, including this one
    pub count: u32,
    /// Time until the current window closes
    pub retry_after: Duration,
}

/// Throttles actions per user.
///
/// A request with no window, or one arriving after the window closed,
/// opens a new window with count 1. Otherwise the count is incremented and
/// the request is allowed while the count stays within the limit. Actions
/// without a configured rule are never throttled.
pub struct RateLimiter {
    repo: Arc<dyn Repository>,
    clock: Arc<dyn Clock>,
    rules: BTreeMap<String, RateLimitRule>,
    locks: KeyedLocks,
}

impl RateLimiter {
    pub fn new(repo: Arc<dyn Repository>, clock: Arc<dyn Clock>, config: &CouncilConfig) -> Self {
        Self {
            repo,
            clock,
            rules: config.rate_limits.clone(),
            locks: KeyedLocks::new(),
        }
    }

    /// Set or replace the rule for an action.
    pub fn with_rule(mut self, action: impl Into<String>, rule: RateLimitRule) -> Self {
        self.rules.insert(action.into(), rule);
        self
    }

    pub fn rule(&self, action: &str) -> Option<RateLimitRule> {
        self.rules.get(action).copied()
    }

    /// Count the call and report whether it is allowed.
    pub async fn check_and_increment(&self, user_id: &str, action: &str) -> GuardResult<bool> {
        Ok(self.check(user_id, action).await?.allowed)
    }

    /// Count the call and fail with `RateLimited` when it is over the limit.
    pub async fn enforce(&self, user_id: &str, action: &str) -> GuardResult<()> {
        let decision = self.check(user_id, action).await?;
        if decision.allowed {
            return Ok(());
        }
        warn!(
            "Rate limit hit: user={} action={} count={}",
            user_id, action, decision.count
        );
        Err(GuardError::RateLimited {
            action: action.to_string(),
            retry_after_secs: decision.retry_after.num_seconds().max(1) as u64,
        })
    }

    /// Count the call and return the full decision.
    pub async fn check(&self, user_id: &str, action: &str) -> GuardResult<RateDecision> {
        let Some(rule) = self.rule(action) else {
            return Ok(RateDecision {
                allowed: true,
                count: 0,
                retry_after: Duration::zero(),
            });
        };

        let _guard = self.locks.lock(&format!("{}\u{1f}{}", user_id, action)).await;
        let now = self.clock.now();
        let window_len = rule.window();

        let window = match self.repo.get_rate_window(user_id, action).await? {
            Some(mut window) if now < window.window_start + window_len => {
                window.count = window.count.saturating_add(1);
                window
            }
            _ => {
                debug!("Opening rate window: user={} action={}", user_id, action);
                RateLimitWindow {
                    user_id: user_id.to_string(),
                    action: action.to_string(),
                    window_start: now,
                    count: 1,
                }
            }
        };

        let decision = RateDecision {
            allowed: window.count <= rule.limit,
            count: window.count,
            retry_after: window.window_start + window_len - now,
        };
        self.repo.put_rate_window(window).await?;
        Ok(decision)
    }
}
