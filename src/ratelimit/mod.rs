//! Persistent rate-limit counters.
//!
//! One row per client identity in `rate_limits`, stored in whichever backend
//! is live. Each window starts on the first hit after the previous window
//! expired; hits inside a window never move its reset time.
//!
//! # Fail-open
//!
//! A store outage must never block traffic. [`RateLimitStore::increment`]
//! therefore never returns an error: when the backend is unavailable it
//! reports [`HitCount::Unavailable`], which every consumer treats as allowed.

mod limiter;

pub use limiter::{RateLimitDecision, RateLimitPolicy, RateLimiter};

use crate::storage::{ConnectionManager, Row, row_i64};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of recording one hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HitCount {
    /// The hit was persisted.
    Counted {
        /// Hits recorded in the current window, including this one.
        total_hits: u64,
        /// When the current window ends.
        reset_time: DateTime<Utc>,
    },
    /// The store could not be reached; the hit was not recorded.
    Unavailable {
        /// Provisional window end, `now + window`.
        reset_time: DateTime<Utc>,
    },
}

impl HitCount {
    /// Recorded hits, or 0 when the count is unavailable.
    #[must_use]
    pub const fn total_hits(&self) -> u64 {
        match self {
            Self::Counted { total_hits, .. } => *total_hits,
            Self::Unavailable { .. } => 0,
        }
    }

    /// End of the current window.
    #[must_use]
    pub const fn reset_time(&self) -> DateTime<Utc> {
        match self {
            Self::Counted { reset_time, .. } | Self::Unavailable { reset_time } => *reset_time,
        }
    }

    /// Whether the count came from the store.
    #[must_use]
    pub const fn is_counted(&self) -> bool {
        matches!(self, Self::Counted { .. })
    }
}

/// A stored counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitRecord {
    /// Client identity, e.g. `ip:192.0.2.1`.
    pub key: String,
    /// Hits in the current window.
    pub hit_count: u64,
    /// When the current window ends.
    pub reset_time: DateTime<Utc>,
}

/// Expired windows are overwritten instead of incremented; the whole
/// read-modify-write is a single statement.
const INCREMENT_SQL: &str = r"
    INSERT INTO rate_limits (key, hit_count, reset_time) VALUES (?, 1, ?)
    ON CONFLICT (key) DO UPDATE SET
        hit_count = CASE WHEN rate_limits.reset_time <= ? THEN 1
                         ELSE rate_limits.hit_count + 1 END,
        reset_time = CASE WHEN rate_limits.reset_time <= ? THEN ?
                          ELSE rate_limits.reset_time END
    RETURNING hit_count, reset_time
";

const DECREMENT_SQL: &str = r"
    UPDATE rate_limits
    SET hit_count = CASE WHEN hit_count > 0 THEN hit_count - 1 ELSE 0 END
    WHERE key = ?
";

/// Hit counters persisted through the live backend.
#[derive(Debug, Clone)]
pub struct RateLimitStore {
    manager: Arc<ConnectionManager>,
    window: Duration,
}

impl RateLimitStore {
    /// Creates a store with a fixed window length.
    #[must_use]
    pub const fn new(manager: Arc<ConnectionManager>, window: Duration) -> Self {
        Self { manager, window }
    }

    /// Window length.
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Records one hit for `key`.
    pub async fn increment(&self, key: &str) -> HitCount {
        self.increment_at(key, Utc::now()).await
    }

    /// Records one hit for `key` as of `now`.
    pub async fn increment_at(&self, key: &str, now: DateTime<Utc>) -> HitCount {
        match self.try_increment(key, now).await {
            Ok(hit) => hit,
            Err(e) => {
                metrics::counter!("rate_limit_store_fail_open_total").increment(1);
                tracing::warn!(key = %key, error = %e, "Rate-limit store unavailable, allowing request");
                HitCount::Unavailable {
                    reset_time: self.window_end(now),
                }
            },
        }
    }

    /// Takes one hit back from `key`, never going below zero.
    ///
    /// Unknown keys are left alone. Failures are logged.
    pub async fn decrement(&self, key: &str) {
        let result = async {
            let backend = self.manager.active()?;
            backend.execute(DECREMENT_SQL, &[key.into()]).await
        }
        .await;

        if let Err(e) = result {
            metrics::counter!("rate_limit_store_errors_total", "operation" => "decrement")
                .increment(1);
            tracing::warn!(key = %key, error = %e, "Failed to decrement rate-limit counter");
        }
    }

    /// Deletes the counter for `key`. Failures are logged.
    pub async fn reset_key(&self, key: &str) {
        let result = async {
            let backend = self.manager.active()?;
            backend
                .execute("DELETE FROM rate_limits WHERE key = ?", &[key.into()])
                .await
        }
        .await;

        match result {
            Ok(summary) => {
                tracing::debug!(key = %key, removed = summary.affected_count, "Reset rate-limit counter");
            },
            Err(e) => {
                metrics::counter!("rate_limit_store_errors_total", "operation" => "reset")
                    .increment(1);
                tracing::warn!(key = %key, error = %e, "Failed to reset rate-limit counter");
            },
        }
    }

    /// Reads the counter for `key` without touching it.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn get(&self, key: &str) -> Result<Option<RateLimitRecord>> {
        let backend = self.manager.active()?;
        let rows = backend
            .query_rows(
                "SELECT key, hit_count, reset_time FROM rate_limits WHERE key = ?",
                &[key.into()],
            )
            .await?;

        rows.first()
            .map(|row| {
                let (hit_count, reset_time) = parse_counter(row)?;
                Ok(RateLimitRecord {
                    key: key.to_string(),
                    hit_count,
                    reset_time,
                })
            })
            .transpose()
    }

    /// Deletes every counter whose window ended at or before now.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn purge_expired(&self) -> Result<u64> {
        self.purge_expired_at(Utc::now()).await
    }

    /// Deletes every counter whose window ended at or before `now`.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn purge_expired_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let backend = self.manager.active()?;
        let summary = backend
            .execute(
                "DELETE FROM rate_limits WHERE reset_time <= ?",
                &[now.timestamp_millis().into()],
            )
            .await?;
        if summary.affected_count > 0 {
            tracing::info!(removed = summary.affected_count, "Purged expired rate-limit counters");
        }
        Ok(summary.affected_count)
    }

    async fn try_increment(&self, key: &str, now: DateTime<Utc>) -> Result<HitCount> {
        let backend = self.manager.active()?;
        let now_ms = now.timestamp_millis();
        let next_reset = self.window_end(now).timestamp_millis();

        let rows = backend
            .query_rows(
                INCREMENT_SQL,
                &[
                    key.into(),
                    next_reset.into(),
                    now_ms.into(),
                    now_ms.into(),
                    next_reset.into(),
                ],
            )
            .await?;

        let row = rows
            .first()
            .ok_or_else(|| Error::operation("rate_limit_increment", "no row returned"))?;
        let (total_hits, reset_time) = parse_counter(row)?;
        Ok(HitCount::Counted {
            total_hits,
            reset_time,
        })
    }

    fn window_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let window_ms = i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX);
        from_millis(now.timestamp_millis().saturating_add(window_ms))
    }
}

fn parse_counter(row: &Row) -> Result<(u64, DateTime<Utc>)> {
    let hits = row_i64(row, "hit_count")
        .ok_or_else(|| Error::operation("rate_limit_decode", "missing hit_count"))?;
    let reset = row_i64(row, "reset_time")
        .ok_or_else(|| Error::operation("rate_limit_decode", "missing reset_time"))?;
    Ok((u64::try_from(hits).unwrap_or(0), from_millis(reset)))
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
