use lazy_static::lazy_static;

use crate::error::Result;
use crate::Queue;

/// Outcome of a `fail_job` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailOutcome {
    /// The job wasn't found on `active` (lock lost to stalled recovery).
    NotOwned,
    /// Retries exhausted; marked permanently failed.
    Failed,
    /// Rescheduled into `delayed`; carries the next attempt time in ms.
    Retrying(i64),
}

// Record a processor failure and either reschedule into delayed (computing
// the backoff in-script, so concurrent stalled recovery can't race a
// half-applied retry) or mark the job permanently failed.
// KEYS:
//  1. active
//  2. delayed
//  3. job hash key
//  4. stats
// ARGV:
//  1. job id
//  2. now (ms)
//  3. error message
//  4. forced delay (ms), or -1 to use the job's configured backoff
const FAIL_JOB_SCRIPT: &str = r##"
    local removed = redis.call("ZREM", KEYS[1], ARGV[1])
    if removed == 0 then
        return -1
    end

    local retry_count = tonumber(redis.call("HGET", KEYS[3], "rc") or "0")
    local max_attempts = tonumber(redis.call("HGET", KEYS[3], "ma") or "1")
    local next_retry = retry_count + 1

    redis.call("HSET", KEYS[3], "err", ARGV[3], "fa", ARGV[2])

    if next_retry < max_attempts then
        local delay
        local forced = tonumber(ARGV[4])
        if forced >= 0 then
            delay = forced
        else
            local backoff_type = redis.call("HGET", KEYS[3], "bt") or "fixed"
            local backoff_delay = tonumber(redis.call("HGET", KEYS[3], "bd") or "0")
            if backoff_type == "exponential" then
                delay = backoff_delay * (2 ^ (next_retry - 1))
            else
                delay = backoff_delay
            end
        end

        local next_run = tonumber(ARGV[2]) + delay
        redis.call("HSET", KEYS[3], "rc", next_retry, "st", "delayed")
        redis.call("ZADD", KEYS[2], next_run, ARGV[1])
        redis.call("HINCRBY", KEYS[4], "errored", 1)
        return next_run
    end

    redis.call("HSET", KEYS[3], "rc", next_retry, "st", "failed")
    redis.call("HINCRBY", KEYS[4], "failed", 1)
    return 0
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(FAIL_JOB_SCRIPT);
}

pub(crate) struct FailJobScript(&'static redis::Script);

impl FailJobScript {
    pub fn new() -> Self {
        FailJobScript(&SCRIPT)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        queue: &Queue,
        conn: &mut deadpool_redis::Connection,
        job_id: &str,
        job_key: &str,
        now_ms: i64,
        error_message: &str,
        forced_delay_ms: Option<i64>,
    ) -> Result<FailOutcome> {
        let result: i64 = self
            .0
            .key(&queue.0.keys.active)
            .key(&queue.0.keys.delayed)
            .key(job_key)
            .key(&queue.0.keys.stats)
            .arg(job_id)
            .arg(now_ms)
            .arg(error_message)
            .arg(forced_delay_ms.unwrap_or(-1))
            .invoke_async(&mut **conn)
            .await?;

        Ok(match result {
            -1 => FailOutcome::NotOwned,
            0 => FailOutcome::Failed,
            next_run => FailOutcome::Retrying(next_run),
        })
    }
}
