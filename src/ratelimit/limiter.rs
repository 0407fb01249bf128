//! Throttling decisions on top of [`RateLimitStore`].

use super::{HitCount, RateLimitStore};
use crate::config::EnvSource;
use crate::storage::ConnectionManager;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Default maximum hits per window.
pub const DEFAULT_RATE_LIMIT_MAX_HITS: u64 = 100;

/// Default window length in seconds.
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 900;

/// Environment variable overriding the hit ceiling.
pub const ENV_MAX_HITS: &str = "DESKBASE_RATE_LIMIT_MAX_HITS";

/// Environment variable overriding the window length.
pub const ENV_WINDOW_SECS: &str = "DESKBASE_RATE_LIMIT_WINDOW_SECS";

/// Hit ceiling per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Maximum hits allowed per window.
    pub max_hits: u64,
    /// Window duration.
    pub window: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_hits: DEFAULT_RATE_LIMIT_MAX_HITS,
            window: Duration::from_secs(DEFAULT_RATE_LIMIT_WINDOW_SECS),
        }
    }
}

impl RateLimitPolicy {
    /// Creates a policy from the process environment.
    ///
    /// Reads `DESKBASE_RATE_LIMIT_MAX_HITS` and
    /// `DESKBASE_RATE_LIMIT_WINDOW_SECS`; unparsable values fall back to the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_source(&EnvSource::process())
    }

    /// Creates a policy from an explicit environment source.
    #[must_use]
    pub fn from_source(env: &EnvSource) -> Self {
        let max_hits = env
            .get(ENV_MAX_HITS)
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(DEFAULT_RATE_LIMIT_MAX_HITS);

        let window_secs = env
            .get(ENV_WINDOW_SECS)
            .and_then(|s| s.trim().parse().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW_SECS);

        Self {
            max_hits,
            window: Duration::from_secs(window_secs),
        }
    }

    /// Sets maximum hits per window.
    #[must_use]
    pub const fn with_max_hits(mut self, max: u64) -> Self {
        self.max_hits = max;
        self
    }

    /// Sets window duration in seconds.
    #[must_use]
    pub const fn with_window_secs(mut self, secs: u64) -> Self {
        self.window = Duration::from_secs(secs);
        self
    }

    /// Decides whether `hit` is within this policy.
    #[must_use]
    pub const fn decide(&self, hit: HitCount) -> RateLimitDecision {
        match hit {
            HitCount::Counted {
                total_hits,
                reset_time,
            } => RateLimitDecision {
                allowed: total_hits <= self.max_hits,
                remaining: self.max_hits.saturating_sub(total_hits),
                reset_time,
                counted: true,
            },
            HitCount::Unavailable { reset_time } => RateLimitDecision {
                allowed: true,
                remaining: self.max_hits,
                reset_time,
                counted: false,
            },
        }
    }
}

/// Result of checking one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Hits left in the current window.
    pub remaining: u64,
    /// When the current window ends.
    pub reset_time: DateTime<Utc>,
    /// False when the store was unavailable and the request was let through.
    pub counted: bool,
}

/// Entry point for a request-throttling layer.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: RateLimitStore,
    policy: RateLimitPolicy,
}

impl RateLimiter {
    /// Creates a limiter whose counters use `policy.window`.
    #[must_use]
    pub const fn new(manager: Arc<ConnectionManager>, policy: RateLimitPolicy) -> Self {
        Self {
            store: RateLimitStore::new(manager, policy.window),
            policy,
        }
    }

    /// Underlying counter store.
    #[must_use]
    pub const fn store(&self) -> &RateLimitStore {
        &self.store
    }

    /// Active policy.
    #[must_use]
    pub const fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Records a hit for `key` and decides whether it is allowed.
    pub async fn check(&self, key: &str) -> RateLimitDecision {
        let decision = self.policy.decide(self.store.increment(key).await);
        if !decision.allowed {
            metrics::counter!("rate_limit_rejected_total").increment(1);
            tracing::debug!(key = %key, reset_time = %decision.reset_time, "Rate limit exceeded");
        }
        decision
    }
}
