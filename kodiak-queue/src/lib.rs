//! A distributed, reliable, priority-ordered job queue layered on Redis.
//!
//! Producers enqueue typed jobs through [`Queue::add`]; workers across many
//! processes pull and execute them through a [`Worker`] with
//! exactly-one-active-owner guarantees, configurable retries and backoff,
//! delay scheduling, priority ordering, optional rate limiting, recurring
//! scheduling, and crash recovery via stalled-lock detection.

pub mod entity;
pub mod job;
pub mod rate_limiter;
pub mod retry;
pub mod state;
pub mod worker;

mod error;
mod keys;
mod redis_fields;
mod scheduler;
mod scripts;

pub use entity::{JobEntity, JobRecord};
pub use error::{Error, Result};
pub use job::{BackoffConfig, BackoffKind, Job, JobId, RepeatConfig};
pub use rate_limiter::{RateLimiterConfig, RateLimiterMode, RateLimiterPolicy};
pub use retry::BackoffStrategies;
pub use state::JobState;
pub use worker::{JobProcessor, Worker, WorkerOptions};

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use kodiak_database::RedisPool;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{event, Level};

use keys::QueueKeys;
use rate_limiter::{Admission, RateLimiter};
use redis_fields::JobHashSetCmd;
use scripts::ScriptSet;

pub use scripts::{CompleteOutcome, FailOutcome};

/// Ordering key for the waiting set: `priority * PRIORITY_MULTIPLIER +
/// scheduledEpochMs`, so priority always dominates insertion order.
pub(crate) const PRIORITY_MULTIPLIER: i64 = 10_000_000_000_000;

/// Default per-job lock duration, reused as the default for both
/// `fetch_next`/`fetch_next_jobs` and `WorkerOptions::lock_duration`.
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_millis(30_000);

/// A handle to a single named queue. Cheap to clone; every clone shares
/// the same underlying connection pool, key layout, and background tasks.
pub struct Queue(Arc<QueueInner>);

struct QueueInner {
    pool: RedisPool,
    name: String,
    keys: QueueKeys,
    scripts: ScriptSet,
    rate_limiter: Option<RateLimiter>,
    scheduler_task: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
    delay_timers: Mutex<HashMap<String, JoinHandle<()>>>,
    recovering_stalled: AtomicBool,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("name", &self.0.name).finish()
    }
}

impl Clone for Queue {
    fn clone(&self) -> Self {
        Queue(self.0.clone())
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStatus {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub enqueued: usize,
    pub retrieved: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub errored: usize,
    pub promoted: usize,
    pub recovered: usize,
    pub rate_limited: usize,
}

impl Queue {
    pub fn new(pool: RedisPool, queue_name: impl Into<String>) -> Queue {
        Queue::with_rate_limiter(pool, queue_name, None)
    }

    pub fn with_rate_limiter(
        pool: RedisPool,
        queue_name: impl Into<String>,
        rate_limiter: Option<RateLimiterConfig>,
    ) -> Queue {
        let queue_name = queue_name.into();
        let keys = QueueKeys::new(pool.key_prefix(), &queue_name);

        Queue(Arc::new(QueueInner {
            pool,
            keys,
            name: queue_name,
            scripts: ScriptSet::new(),
            rate_limiter: rate_limiter.map(RateLimiter::new),
            scheduler_task: Mutex::new(None),
            delay_timers: Mutex::new(HashMap::new()),
            recovering_stalled: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    fn composite_score(priority: i64, at_ms: i64) -> i64 {
        priority * PRIORITY_MULTIPLIER + at_ms
    }

    /// Enqueue a job. Fails with `Error::AlreadyExists` if implementations
    /// choose to enforce that (this implementation does not verify
    /// uniqueness server-side; callers are responsible for unique ids, per
    /// SPEC_FULL.md §6).
    pub async fn add(&self, job: &Job<'_>) -> Result<()> {
        let now = Utc::now();
        let job_key = self.0.keys.job_key(&job.id);
        let run_at = job.run_at(now);
        let is_delayed = run_at.is_some();
        let score_basis = run_at.unwrap_or(now).timestamp_millis();
        let priority = job.priority.unwrap_or(Job::DEFAULT_PRIORITY);
        let score = if is_delayed {
            score_basis
        } else {
            Self::composite_score(priority, score_basis)
        };

        let mut fields = JobHashSetCmd::new()
            .data(job.payload.as_ref())
            .state(if is_delayed {
                JobState::Delayed
            } else {
                JobState::Waiting
            })
            .priority(priority)
            .retry_count(0)
            .max_attempts(job.attempts.unwrap_or(1))
            .added_at(now);

        if let Some(backoff) = &job.backoff {
            fields = fields.backoff(&backoff.kind, backoff.delay);
        }
        if let Some(repeat) = &job.repeat {
            fields = fields.repeat(repeat.every.as_millis() as i64, repeat.limit);
        }

        let mut conn = self.0.pool.get().await?;
        self.0
            .scripts
            .add_job
            .run(
                self,
                &mut conn,
                &job.id,
                &job_key,
                score,
                is_delayed,
                &fields.into_args(),
            )
            .await?;

        event!(Level::DEBUG, queue = %self.0.name, job = %job.id, delayed = is_delayed, "job added");

        if let Some(at) = run_at {
            self.schedule_promotion(&job.id, at, now);
        }

        Ok(())
    }

    fn schedule_promotion(&self, id: &str, due_at: DateTime<Utc>, now: DateTime<Utc>) {
        let delay = (due_at - now).to_std().unwrap_or(Duration::from_millis(0));
        self.set_delay_timer_key(id, delay);
        self.arm_delay_timer(id.to_string(), delay);
    }

    /// Optimistic-then-blocking fetch of the next job. Returns `None` if
    /// no job became available within `timeout`.
    pub async fn fetch_next<T: serde::de::DeserializeOwned + Send + Sync>(
        &self,
        timeout: Duration,
    ) -> Result<Option<JobEntity<T>>> {
        match self.fetch_next_raw(timeout, None).await? {
            Some((id, hash)) => {
                let lock_expires_at = Utc::now()
                    + chrono::Duration::from_std(DEFAULT_LOCK_DURATION).unwrap_or_default();
                Ok(Some(JobEntity::from_hash(
                    self.clone(),
                    &id,
                    lock_expires_at,
                    None,
                    &hash,
                )?))
            }
            None => Ok(None),
        }
    }

    async fn fetch_next_raw(
        &self,
        timeout: Duration,
        owner_token: Option<&str>,
    ) -> Result<Option<(String, HashMap<String, Vec<u8>>)>> {
        let now = Utc::now().timestamp_millis();

        if let Some((reset_at_ms, meta)) = self.check_admission(now, 1.0).await? {
            self.apply_denial(reset_at_ms, &meta).await?;
            return Ok(None);
        }

        let mut conn = self.0.pool.get().await?;
        if let Some((id, _expires, hash)) = self
            .0
            .scripts
            .move_job
            .run(self, &mut conn, now, DEFAULT_LOCK_DURATION.as_millis() as i64, true)
            .await?
        {
            self.finish_fetch_hash_write(&id, owner_token).await?;
            return Ok(Some((id, hash)));
        }

        if timeout.is_zero() {
            return Ok(None);
        }

        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&self.0.keys.notify)
            .arg(timeout.as_secs_f64().max(0.001))
            .query_async(&mut *conn)
            .await?;

        if popped.is_none() {
            return Ok(None);
        }

        let now = Utc::now().timestamp_millis();
        if let Some((reset_at_ms, meta)) = self.check_admission(now, 1.0).await? {
            self.apply_denial(reset_at_ms, &meta).await?;
            return Ok(None);
        }

        let result = self
            .0
            .scripts
            .move_job
            .run(self, &mut conn, now, DEFAULT_LOCK_DURATION.as_millis() as i64, false)
            .await?;

        match result {
            Some((id, _expires, hash)) => {
                self.finish_fetch_hash_write(&id, owner_token).await?;
                Ok(Some((id, hash)))
            }
            None => Ok(None),
        }
    }

    async fn finish_fetch_hash_write(&self, id: &str, owner_token: Option<&str>) -> Result<()> {
        if let Some(owner) = owner_token {
            let job_key = self.0.keys.job_key(id);
            let mut conn = self.0.pool.get().await?;
            redis::cmd("HSET")
                .arg(&job_key)
                .arg("lo")
                .arg(owner)
                .query_async::<_, ()>(&mut *conn)
                .await?;
        }
        Ok(())
    }

    /// Batch fetch up to `count` jobs in one round trip. Used by the
    /// worker loop's per-slot prefetch.
    pub async fn fetch_next_jobs_raw(
        &self,
        count: u32,
        lock_duration: Duration,
        owner_token: Option<&str>,
    ) -> Result<Vec<(String, HashMap<String, Vec<u8>>)>> {
        let now = Utc::now().timestamp_millis();

        if let Some((reset_at_ms, meta)) = self.check_admission(now, count as f64).await? {
            self.apply_denial(reset_at_ms, &meta).await?;
            return Ok(Vec::new());
        }

        let mut conn = self.0.pool.get().await?;
        let (lock_expires, items) = self
            .0
            .scripts
            .move_to_active
            .run(self, &mut conn, now, lock_duration.as_millis() as i64, count)
            .await?;

        if let Some(owner) = owner_token {
            for (id, _) in &items {
                let job_key = self.0.keys.job_key(id);
                redis::cmd("HSET")
                    .arg(&job_key)
                    .arg("lo")
                    .arg(owner)
                    .query_async::<_, ()>(&mut *conn)
                    .await?;
            }
        }

        let _ = lock_expires;
        Ok(items)
    }

    async fn check_admission(
        &self,
        now_ms: i64,
        cost: f64,
    ) -> Result<Option<(i64, serde_json::Value)>> {
        let Some(limiter) = &self.0.rate_limiter else {
            return Ok(None);
        };

        match limiter.check(self, now_ms, cost).await {
            Admission::Allowed => Ok(None),
            Admission::Denied { reset_at_ms, meta } => Ok(Some((reset_at_ms, meta))),
        }
    }

    async fn apply_denial(&self, reset_at_ms: i64, meta: &serde_json::Value) -> Result<()> {
        use rate_limiter::RateLimiterPolicy;

        let Some(limiter) = &self.0.rate_limiter else {
            return Ok(());
        };
        if limiter.policy() == RateLimiterPolicy::Reject {
            return Ok(());
        }

        let meta_json = serde_json::to_vec(meta)?;
        let mut conn = self.0.pool.get().await?;
        if let Some(id) = self
            .0
            .scripts
            .move_waiting_to_delayed
            .run(self, &mut conn, reset_at_ms, "rate_limit", &meta_json)
            .await?
        {
            self.schedule_promotion(&id, Utc.timestamp_millis(reset_at_ms), Utc::now());
        }

        event!(Level::DEBUG, queue = %self.0.name, "rate limit denied admission");
        Ok(())
    }

    pub async fn mark_completed(&self, id: &str) -> Result<CompleteOutcome> {
        let job_key = self.0.keys.job_key(id);
        let mut conn = self.0.pool.get().await?;
        self.0
            .scripts
            .complete_job
            .run(self, &mut conn, id, &job_key, Utc::now().timestamp_millis())
            .await
    }

    pub async fn mark_failed(
        &self,
        id: &str,
        error_message: &str,
        forced_next_attempt_at: Option<DateTime<Utc>>,
    ) -> Result<FailOutcome> {
        let job_key = self.0.keys.job_key(id);
        let now = Utc::now();
        let forced_delay = forced_next_attempt_at.map(|at| {
            (at - now).num_milliseconds().max(0)
        });

        let mut conn = self.0.pool.get().await?;
        let outcome = self
            .0
            .scripts
            .fail_job
            .run(
                self,
                &mut conn,
                id,
                &job_key,
                now.timestamp_millis(),
                error_message,
                forced_delay,
            )
            .await?;

        if let FailOutcome::Retrying(next_run_ms) = outcome {
            let due_at = Utc.timestamp_millis(next_run_ms);
            self.schedule_promotion(id, due_at, now);
        }

        Ok(outcome)
    }

    pub async fn update_progress(&self, id: &str, progress: &serde_json::Value) -> Result<bool> {
        let job_key = self.0.keys.job_key(id);
        let payload = serde_json::to_vec(progress)?;
        let mut conn = self.0.pool.get().await?;
        self.0
            .scripts
            .update_progress
            .run(self, &mut conn, &job_key, &payload)
            .await
    }

    pub async fn extend_lock(
        &self,
        id: &str,
        new_expiry: DateTime<Utc>,
        owner_token: Option<&str>,
    ) -> Result<bool> {
        let job_key = self.0.keys.job_key(id);
        let mut conn = self.0.pool.get().await?;
        self.0
            .scripts
            .extend_lock
            .run(
                self,
                &mut conn,
                id,
                &job_key,
                new_expiry.timestamp_millis(),
                owner_token,
            )
            .await
    }

    pub async fn promote_delayed_jobs(&self, limit: u32) -> Result<Vec<String>> {
        let mut conn = self.0.pool.get().await?;
        self.0
            .scripts
            .promote_delayed_jobs
            .run(self, &mut conn, Utc::now().timestamp_millis(), limit)
            .await
    }

    pub async fn recover_stalled_jobs(&self, limit: u32) -> Result<Vec<String>> {
        let mut conn = self.0.pool.get().await?;
        self.0
            .scripts
            .recover_stalled_jobs
            .run(self, &mut conn, Utc::now().timestamp_millis(), limit)
            .await
    }

    pub async fn job_info(&self, id: &str) -> Result<Option<JobRecord>> {
        let job_key = self.0.keys.job_key(id);
        let mut conn = self.0.pool.get().await?;
        let hash: HashMap<String, Vec<u8>> = redis::cmd("HGETALL")
            .arg(&job_key)
            .query_async(&mut *conn)
            .await?;
        if hash.is_empty() {
            return Ok(None);
        }
        JobRecord::from_hash(id, &hash)
    }

    pub async fn status(&self) -> Result<QueueStatus> {
        let mut conn = self.0.pool.get().await?;
        let (waiting, delayed, active, stats): (
            usize,
            usize,
            usize,
            HashMap<String, usize>,
        ) = redis::Pipeline::with_capacity(4)
            .cmd("ZCARD")
            .arg(&self.0.keys.waiting)
            .cmd("ZCARD")
            .arg(&self.0.keys.delayed)
            .cmd("ZCARD")
            .arg(&self.0.keys.active)
            .cmd("HGETALL")
            .arg(&self.0.keys.stats)
            .query_async(&mut *conn)
            .await?;

        Ok(QueueStatus {
            waiting,
            delayed,
            active,
            enqueued: stats.get("enqueued").copied().unwrap_or(0),
            retrieved: stats.get("retrieved").copied().unwrap_or(0),
            succeeded: stats.get("completed").copied().unwrap_or(0),
            failed: stats.get("failed").copied().unwrap_or(0),
            errored: stats.get("errored").copied().unwrap_or(0),
            promoted: stats.get("promoted").copied().unwrap_or(0),
            recovered: stats.get("recovered").copied().unwrap_or(0),
            rate_limited: stats.get("rate_limited").copied().unwrap_or(0),
        })
    }

    /// Stop this queue's scheduler and any outstanding delay timers. Safe
    /// to call twice.
    pub fn close(&self) {
        self.stop_scheduler();
        let mut timers = self.0.delay_timers.lock().unwrap();
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{Future, FutureExt};
    use std::borrow::Cow;

    #[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
    struct SimplePayload {
        data: String,
    }

    async fn run_queue_test<T, Fut>(test: T)
    where
        T: Send + Sync + FnOnce(Queue) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        dotenv::dotenv().ok();
        let queue_name = format!("test-{}", uuid::Uuid::new_v4());
        let pool = kodiak_database::RedisPool::new(None, None).expect("creating pool");
        let queue = Queue::new(pool.clone(), queue_name.clone());

        let result = std::panic::AssertUnwindSafe(test(queue))
            .catch_unwind()
            .await;

        let mut conn = pool.get().await.expect("cleanup: acquiring connection");
        let key_pattern = format!("{}:*{}*", pool.key_prefix(), queue_name);
        let mut cmd = redis::cmd("SCAN");
        let mut iter: redis::AsyncIter<String> = cmd
            .cursor_arg(0)
            .arg("MATCH")
            .arg(&key_pattern)
            .arg("COUNT")
            .arg(100)
            .clone()
            .iter_async(&mut *conn)
            .await
            .expect("cleanup: scanning keyspace");

        let mut del_cmd = redis::cmd("DEL");
        let mut any = false;
        while let Some(key) = iter.next_item().await {
            any = true;
            del_cmd.arg(key);
        }
        if any {
            del_cmd
                .query_async::<_, ()>(&mut *conn)
                .await
                .expect("cleanup: deleting keys");
        }

        result.expect("panicked").expect("test returned error");
    }

    #[test]
    fn composite_score_orders_by_priority_then_time() {
        let high = Queue::composite_score(1, 1_000);
        let normal = Queue::composite_score(10, 500);
        let low = Queue::composite_score(100, 0);
        assert!(high < normal);
        assert!(normal < low);
    }

    #[cfg_attr(not(feature = "test-redis"), ignore)]
    #[tokio::test]
    async fn enqueue_and_fetch() {
        run_queue_test(|queue| async move {
            let payload = serde_json::to_vec(&SimplePayload {
                data: "hello".into(),
            })?;
            let job = Job {
                id: "job-1".into(),
                payload: Cow::Owned(payload),
                ..Default::default()
            };
            queue.add(&job).await?;

            let fetched = queue
                .fetch_next::<SimplePayload>(Duration::from_millis(0))
                .await?
                .expect("job should be available");
            assert_eq!(fetched.id, "job-1");
            assert_eq!(fetched.data.data, "hello");

            queue.mark_completed(&fetched.id).await?;
            let info = queue.job_info("job-1").await?.expect("job info");
            assert_eq!(info.state, JobState::Completed);

            Ok(())
        })
        .await;
    }

    #[cfg_attr(not(feature = "test-redis"), ignore)]
    #[tokio::test]
    async fn priority_then_fifo_ordering() {
        run_queue_test(|queue| async move {
            for (id, priority) in [("low", 100), ("normal", 10), ("high", 1)] {
                let payload = serde_json::to_vec(&SimplePayload { data: id.into() })?;
                let job = Job {
                    id: id.into(),
                    payload: Cow::Owned(payload),
                    priority: Some(priority),
                    ..Default::default()
                };
                queue.add(&job).await?;
            }

            for expected in ["high", "normal", "low"] {
                let fetched = queue
                    .fetch_next::<SimplePayload>(Duration::from_millis(0))
                    .await?
                    .expect("job should be available");
                assert_eq!(fetched.id, expected);
                queue.mark_completed(&fetched.id).await?;
            }

            Ok(())
        })
        .await;
    }

    #[cfg_attr(not(feature = "test-redis"), ignore)]
    #[tokio::test]
    async fn stalled_job_is_recovered() {
        run_queue_test(|queue| async move {
            let payload = serde_json::to_vec(&SimplePayload {
                data: "stalled".into(),
            })?;
            let job = Job {
                id: "stalled-job".into(),
                payload: Cow::Owned(payload),
                ..Default::default()
            };
            queue.add(&job).await?;

            // Pull it onto active with an already-expired lock.
            let mut conn = queue.0.pool.get().await?;
            queue
                .0
                .scripts
                .move_job
                .run(&queue, &mut conn, Utc::now().timestamp_millis() - 60_000, 1, false)
                .await?;

            let recovered = queue.recover_stalled_jobs(50).await?;
            assert_eq!(recovered, vec!["stalled-job".to_string()]);

            let info = queue.job_info("stalled-job").await?.expect("job info");
            assert_eq!(info.state, JobState::Waiting);
            assert_eq!(info.retry_count, 1);

            Ok(())
        })
        .await;
    }

    #[cfg_attr(not(feature = "test-redis"), ignore)]
    #[tokio::test]
    async fn recurring_job_reschedules_until_limit() {
        run_queue_test(|queue| async move {
            let payload = serde_json::to_vec(&SimplePayload {
                data: "tick".into(),
            })?;
            let job = Job {
                id: "recurring-job".into(),
                payload: Cow::Owned(payload),
                repeat: Some(RepeatConfig {
                    every: Duration::from_millis(1000),
                    limit: Some(3),
                }),
                ..Default::default()
            };
            queue.add(&job).await?;

            for expected_count in [1u32, 2, 3] {
                let fetched = queue
                    .fetch_next::<SimplePayload>(Duration::from_millis(0))
                    .await?
                    .expect("job should be available");
                let outcome = queue.mark_completed(&fetched.id).await?;

                let info = queue.job_info("recurring-job").await?.expect("job info");
                if expected_count < 3 {
                    assert!(matches!(outcome, CompleteOutcome::Rescheduled(_)));
                    assert_eq!(info.state, JobState::Delayed);
                    assert_eq!(info.repeat_count, Some(expected_count));

                    // Force the due time into the past so the next fetch can proceed.
                    let mut conn = queue.0.pool.get().await?;
                    redis::cmd("ZADD")
                        .arg(&queue.0.keys.delayed)
                        .arg(Utc::now().timestamp_millis() - 1)
                        .arg("recurring-job")
                        .query_async::<_, ()>(&mut *conn)
                        .await?;
                    queue.promote_delayed_jobs(50).await?;
                } else {
                    assert_eq!(outcome, CompleteOutcome::Completed);
                    assert_eq!(info.state, JobState::Completed);
                }
            }

            Ok(())
        })
        .await;
    }
}
