use lazy_static::lazy_static;

use crate::error::Result;
use crate::Queue;

// Pop a job directly off waiting and move it to delayed, for a rate-limit
// denial. Must not touch active, since the job was never handed to a
// worker; touching active would steal a lock slot and confuse stalled
// recovery.
// KEYS:
//  1. waiting
//  2. delayed
//  3. stats
// ARGV:
//  1. job prefix
//  2. next attempt (ms), also stored as rate_limit_reset_at
//  3. reason
//  4. delayed_meta (JSON bytes, may be empty)
const MOVE_WAITING_TO_DELAYED_SCRIPT: &str = r##"
    local popped = redis.call("ZPOPMIN", KEYS[1], 1)
    if #popped == 0 then
        return false
    end

    local job_id = popped[1]
    redis.call("ZADD", KEYS[2], tonumber(ARGV[2]), job_id)

    local job_key = ARGV[1] .. job_id
    redis.call("HSET", job_key, "st", "delayed", "dr", ARGV[3], "rr", ARGV[2])
    if ARGV[4] ~= "" then
        redis.call("HSET", job_key, "dm", ARGV[4])
    end
    redis.call("HINCRBY", KEYS[3], "rate_limited", 1)

    return job_id
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(MOVE_WAITING_TO_DELAYED_SCRIPT);
}

pub(crate) struct MoveWaitingToDelayedScript(&'static redis::Script);

impl MoveWaitingToDelayedScript {
    pub fn new() -> Self {
        MoveWaitingToDelayedScript(&SCRIPT)
    }

    /// Returns the id of the job moved, or `None` if waiting was empty.
    /// `meta` is the serialized `delayed_meta` JSON value to store on the
    /// job hash, or empty bytes to skip writing that field.
    pub async fn run(
        &self,
        queue: &Queue,
        conn: &mut deadpool_redis::Connection,
        next_attempt_ms: i64,
        reason: &str,
        meta: &[u8],
    ) -> Result<Option<String>> {
        let moved: Option<String> = self
            .0
            .key(&queue.0.keys.waiting)
            .key(&queue.0.keys.delayed)
            .key(&queue.0.keys.stats)
            .arg(&queue.0.keys.job_prefix)
            .arg(next_attempt_ms)
            .arg(reason)
            .arg(meta)
            .invoke_async(&mut **conn)
            .await?;
        Ok(moved)
    }
}
