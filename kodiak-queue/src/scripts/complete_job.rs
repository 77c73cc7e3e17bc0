use lazy_static::lazy_static;

use crate::error::Result;
use crate::Queue;

/// Outcome of a `complete_job` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompleteOutcome {
    /// The job wasn't found on `active` (lock lost to stalled recovery).
    NotOwned,
    /// Marked completed, terminal.
    Completed,
    /// A `repeat` job was re-armed; carries the next run time in ms.
    Rescheduled(i64),
}

// Mark a job done, handling the recurring-job re-arm in the same
// round trip so a crash between "complete" and "reschedule" can't happen.
// KEYS:
//  1. active
//  2. delayed
//  3. job hash key
//  4. stats
// ARGV:
//  1. job id
//  2. now (ms)
const COMPLETE_JOB_SCRIPT: &str = r##"
    local removed = redis.call("ZREM", KEYS[1], ARGV[1])
    if removed == 0 then
        return -1
    end

    local repeat_every = redis.call("HGET", KEYS[3], "re")
    if repeat_every then
        local limit = tonumber(redis.call("HGET", KEYS[3], "rl") or "-1")
        local count = tonumber(redis.call("HGET", KEYS[3], "rn") or "0")
        if limit < 0 or count + 1 < limit then
            local next_count = count + 1
            local next_run = tonumber(ARGV[2]) + tonumber(repeat_every)
            redis.call("HSET", KEYS[3], "rn", next_count, "st", "delayed", "ca", ARGV[2])
            redis.call("ZADD", KEYS[2], next_run, ARGV[1])
            redis.call("HINCRBY", KEYS[4], "completed", 1)
            return next_run
        end
    end

    redis.call("HSET", KEYS[3], "st", "completed", "ca", ARGV[2])
    redis.call("HINCRBY", KEYS[4], "completed", 1)
    return 0
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(COMPLETE_JOB_SCRIPT);
}

pub(crate) struct CompleteJobScript(&'static redis::Script);

impl CompleteJobScript {
    pub fn new() -> Self {
        CompleteJobScript(&SCRIPT)
    }

    pub async fn run(
        &self,
        queue: &Queue,
        conn: &mut deadpool_redis::Connection,
        job_id: &str,
        job_key: &str,
        now_ms: i64,
    ) -> Result<CompleteOutcome> {
        let result: i64 = self
            .0
            .key(&queue.0.keys.active)
            .key(&queue.0.keys.delayed)
            .key(job_key)
            .key(&queue.0.keys.stats)
            .arg(job_id)
            .arg(now_ms)
            .invoke_async(&mut **conn)
            .await?;

        Ok(match result {
            -1 => CompleteOutcome::NotOwned,
            0 => CompleteOutcome::Completed,
            next_run => CompleteOutcome::Rescheduled(next_run),
        })
    }
}
