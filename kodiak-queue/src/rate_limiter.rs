//! The Rate Limiter (component L): token-bucket and sliding-window
//! admission checks, with a fail-open policy so limiter unavailability
//! never blocks processing.

use tracing::{event, Level};

use crate::scripts::{SlidingWindowScript, TokenBucketScript};
use crate::Queue;

/// Default delay applied to a job moved to `delayed` after a denied
/// admission check, per SPEC_FULL.md §4.4.
pub const DEFAULT_DELAY_ON_LIMIT_MS: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimiterMode {
    TokenBucket,
    SlidingWindow,
}

/// What happens to a waiting job when the sliding-window limiter denies
/// admission. `TokenBucket` denials always behave like `Delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimiterPolicy {
    /// Leave the job on waiting and return nothing from this fetch.
    Reject,
    /// Move the job to delayed with the limiter's reset time.
    Delay,
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub mode: RateLimiterMode,
    /// Tokens/events per second (token bucket) or per window (sliding window).
    pub rate: f64,
    /// Token bucket burst capacity. Ignored in sliding-window mode.
    pub capacity: f64,
    pub window_ms: i64,
    pub limit: u32,
    pub policy: RateLimiterPolicy,
    pub delay_ms: i64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        RateLimiterConfig {
            mode: RateLimiterMode::TokenBucket,
            rate: 10.0,
            capacity: 10.0,
            window_ms: 1000,
            limit: 10,
            policy: RateLimiterPolicy::Delay,
            delay_ms: DEFAULT_DELAY_ON_LIMIT_MS,
        }
    }
}

/// Outcome of an admission check.
pub(crate) enum Admission {
    Allowed,
    /// Denied; carries the time admission should be retried and the
    /// limiter state to record in the job hash's `delayed_meta` field.
    Denied {
        reset_at_ms: i64,
        meta: serde_json::Value,
    },
}

pub(crate) struct RateLimiter {
    config: RateLimiterConfig,
    token_bucket: TokenBucketScript,
    sliding_window: SlidingWindowScript,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        RateLimiter {
            config,
            token_bucket: TokenBucketScript::new(),
            sliding_window: SlidingWindowScript::new(),
        }
    }

    pub fn policy(&self) -> RateLimiterPolicy {
        self.config.policy
    }

    pub fn delay_ms(&self) -> i64 {
        self.config.delay_ms
    }

    /// Check out `cost` units of admission. On any script/store failure
    /// this fails open (`Admission::Allowed`) rather than propagating, per
    /// the limiter's fail-open policy.
    pub async fn check(&self, queue: &Queue, now_ms: i64, cost: f64) -> Admission {
        let result = match self.config.mode {
            RateLimiterMode::TokenBucket => self.check_token_bucket(queue, now_ms, cost).await,
            RateLimiterMode::SlidingWindow => {
                self.check_sliding_window(queue, now_ms, cost).await
            }
        };

        match result {
            Ok(admission) => admission,
            Err(e) => {
                event!(
                    Level::WARN,
                    queue = %queue.0.name,
                    error = %e,
                    "rate limiter script failed, failing open"
                );
                Admission::Allowed
            }
        }
    }

    async fn check_token_bucket(
        &self,
        queue: &Queue,
        now_ms: i64,
        cost: f64,
    ) -> crate::error::Result<Admission> {
        let mut conn = queue.0.pool.get().await?;
        let (allowed, retry_after) = self
            .token_bucket
            .run(
                queue,
                &mut conn,
                &queue.0.keys.rate_limit_bucket,
                now_ms,
                self.config.capacity,
                self.config.rate,
                cost,
            )
            .await?;

        Ok(if allowed {
            Admission::Allowed
        } else {
            Admission::Denied {
                reset_at_ms: now_ms + retry_after,
                meta: serde_json::json!({
                    "mode": "token_bucket",
                    "rate": self.config.rate,
                    "capacity": self.config.capacity,
                    "cost": cost,
                }),
            }
        })
    }

    async fn check_sliding_window(
        &self,
        queue: &Queue,
        now_ms: i64,
        cost: f64,
    ) -> crate::error::Result<Admission> {
        let mut conn = queue.0.pool.get().await?;
        let request_id = uuid::Uuid::new_v4().to_string();
        let cost = cost.max(1.0).round() as u32;
        let (allowed, reset_at) = self
            .sliding_window
            .run(
                queue,
                &mut conn,
                &queue.0.keys.rate_limit_window,
                now_ms,
                self.config.window_ms,
                self.config.limit,
                &request_id,
                cost,
            )
            .await?;

        Ok(if allowed {
            Admission::Allowed
        } else {
            Admission::Denied {
                reset_at_ms: reset_at,
                meta: serde_json::json!({
                    "mode": "sliding_window",
                    "window_ms": self.config.window_ms,
                    "limit": self.config.limit,
                    "cost": cost,
                }),
            }
        })
    }
}
