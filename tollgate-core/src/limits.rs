//! Token rate-limit evaluation.
//!
//! A user's policy may cap tokens over the last minute, the last day, and
//! all time. Caps are checked shortest window first and the first one that
//! is already exhausted denies the request. The check happens once, before
//! admission; the request's own usage is not known yet and is not counted.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

use crate::admission::DEFAULT_PRIORITY;
use crate::error::StoreResult;
use crate::store::{PolicyStore, RateLimitPolicy, UsageLedger};

/// The dimension a policy caps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    TokensPerMinute,
    TokensPerDay,
    TokensLifetime,
}

impl LimitKind {
    /// Evaluation order: cheapest and most likely to trip first
    pub const ORDER: [LimitKind; 3] =
        [LimitKind::TokensPerMinute, LimitKind::TokensPerDay, LimitKind::TokensLifetime];

    /// Field name as exposed in the API
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::TokensPerMinute => "tokens_per_minute",
            LimitKind::TokensPerDay => "tokens_per_day",
            LimitKind::TokensLifetime => "tokens_lifetime",
        }
    }

    /// Rolling window length, `None` for the lifetime cap
    pub fn window(&self) -> Option<Duration> {
        match self {
            LimitKind::TokensPerMinute => Some(Duration::seconds(60)),
            LimitKind::TokensPerDay => Some(Duration::hours(24)),
            LimitKind::TokensLifetime => None,
        }
    }

    /// The configured cap for this dimension, if any
    pub fn limit_in(&self, policy: &RateLimitPolicy) -> Option<u64> {
        match self {
            LimitKind::TokensPerMinute => policy.tokens_per_minute,
            LimitKind::TokensPerDay => policy.tokens_per_day,
            LimitKind::TokensLifetime => policy.tokens_lifetime,
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitDecision {
    Allowed,
    Denied { reason: LimitKind, limit: u64, used: u64 },
}

impl LimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, LimitDecision::Allowed)
    }
}

/// Evaluates per-user token caps against the usage ledger
#[derive(Clone)]
pub struct RateLimiter {
    policies: Arc<dyn PolicyStore>,
    ledger: Arc<dyn UsageLedger>,
}

impl RateLimiter {
    pub fn new(policies: Arc<dyn PolicyStore>, ledger: Arc<dyn UsageLedger>) -> Self {
        Self { policies, ledger }
    }

    /// Check `user_id` against its policy as of now
    pub async fn check(&self, user_id: &str) -> StoreResult<LimitDecision> {
        self.check_at(user_id, Utc::now()).await
    }

    /// Check `user_id` against its policy as of `now`
    pub async fn check_at(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<LimitDecision> {
        let Some(policy) = self.policies.policy(user_id).await? else {
            return Ok(LimitDecision::Allowed);
        };

        for kind in LimitKind::ORDER {
            let Some(limit) = kind.limit_in(&policy) else {
                continue;
            };

            let used = match kind.window() {
                Some(window) => self.ledger.tokens_since(user_id, now - window).await?,
                None => self.ledger.lifetime_tokens(user_id).await?,
            };

            if used >= limit {
                debug!(user_id, reason = %kind, limit, used, "Rate limit exceeded");
                return Ok(LimitDecision::Denied { reason: kind, limit, used });
            }
        }

        Ok(LimitDecision::Allowed)
    }

    /// Queue priority configured for `user_id`, or the default
    pub async fn priority_for(&self, user_id: &str) -> StoreResult<u8> {
        Ok(self
            .policies
            .policy(user_id)
            .await?
            .map(|p| p.priority)
            .unwrap_or(DEFAULT_PRIORITY))
    }
}
