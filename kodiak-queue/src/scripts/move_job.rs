use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::error::Result;
use crate::Queue;

// Pop a single job off waiting and place it on active with a lock expiry.
// On the first optimistic attempt (before any BRPOP), the caller also wants
// this call to consume the notify token `add_job`/`promote_delayed_jobs`/
// `recover_stalled_jobs` pushed for this job, so a later blocking BRPOP
// doesn't wake on a phantom token for a job that's already gone.
// KEYS:
//  1. waiting
//  2. active
//  3. notify
//  4. stats
// ARGV:
//  1. job prefix (e.g. "kodiak:jobs:")
//  2. now (ms)
//  3. lock duration (ms)
//  4. should_pop_notify ("1"/"0")
const MOVE_JOB_SCRIPT: &str = r##"
    local popped = redis.call("ZPOPMIN", KEYS[1], 1)
    if #popped == 0 then
        return false
    end

    local job_id = popped[1]
    local lock_expires = tonumber(ARGV[2]) + tonumber(ARGV[3])
    redis.call("ZADD", KEYS[2], lock_expires, job_id)

    if ARGV[4] == "1" then
        redis.call("RPOP", KEYS[3])
    end

    local job_key = ARGV[1] .. job_id
    redis.call("HSET", job_key, "st", "active", "sa", ARGV[2])
    local hash = redis.call("HGETALL", job_key)
    redis.call("HINCRBY", KEYS[4], "retrieved", 1)

    return {job_id, lock_expires, hash}
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(MOVE_JOB_SCRIPT);
}

pub(crate) struct MoveJobScript(&'static redis::Script);

type MoveJobResult = Option<(String, i64, HashMap<String, Vec<u8>>)>;

impl MoveJobScript {
    pub fn new() -> Self {
        MoveJobScript(&SCRIPT)
    }

    /// `should_pop_notify` must be `true` on the first optimistic attempt
    /// (before any BRPOP) and `false` on the retry made right after a BRPOP
    /// already consumed a token.
    pub async fn run(
        &self,
        queue: &Queue,
        conn: &mut deadpool_redis::Connection,
        now_ms: i64,
        lock_duration_ms: i64,
        should_pop_notify: bool,
    ) -> Result<MoveJobResult> {
        let result: MoveJobResult = self
            .0
            .key(&queue.0.keys.waiting)
            .key(&queue.0.keys.active)
            .key(&queue.0.keys.notify)
            .key(&queue.0.keys.stats)
            .arg(&queue.0.keys.job_prefix)
            .arg(now_ms)
            .arg(lock_duration_ms)
            .arg(if should_pop_notify { "1" } else { "0" })
            .invoke_async(&mut **conn)
            .await?;
        Ok(result)
    }
}
