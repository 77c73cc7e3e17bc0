use lazy_static::lazy_static;

use crate::error::Result;
use crate::Queue;

// Reclaim jobs whose lock has expired (the worker holding them died or
// stalled) and return them to waiting with an incremented retry count, the
// same way a scripted `ZRANGEBYSCORE` sweep reclaims work in this
// codebase's other lock-timeout paths. Like `promote_delayed_jobs`, the
// priority used for rescoring is read from the job hash rather than passed
// in, since the caller only knows the queue, not which jobs stalled.
// KEYS:
//  1. active
//  2. waiting
//  3. notify
//  4. stats
// ARGV:
//  1. job prefix
//  2. now (ms)
//  3. limit
//  4. priority score multiplier
const RECOVER_STALLED_JOBS_SCRIPT: &str = r##"
    local stalled = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[2], "LIMIT", 0, tonumber(ARGV[3]))
    local mult = tonumber(ARGV[4])
    local recovered = {}

    for _, id in ipairs(stalled) do
        redis.call("ZREM", KEYS[1], id)

        local job_key = ARGV[1] .. id
        local priority = tonumber(redis.call("HGET", job_key, "pr") or "10")
        local retry_count = tonumber(redis.call("HGET", job_key, "rc") or "0")
        local next_retry = retry_count + 1
        local score = priority * mult + tonumber(ARGV[2])

        redis.call("ZADD", KEYS[2], score, id)
        redis.call("HSET", job_key, "st", "waiting", "rc", next_retry, "lo", "")
        redis.call("LPUSH", KEYS[3], id)
        table.insert(recovered, id)
    end

    if #recovered > 0 then
        redis.call("HINCRBY", KEYS[4], "recovered", #recovered)
    end

    return recovered
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(RECOVER_STALLED_JOBS_SCRIPT);
}

pub(crate) struct RecoverStalledJobsScript(&'static redis::Script);

impl RecoverStalledJobsScript {
    pub fn new() -> Self {
        RecoverStalledJobsScript(&SCRIPT)
    }

    pub async fn run(
        &self,
        queue: &Queue,
        conn: &mut deadpool_redis::Connection,
        now_ms: i64,
        limit: u32,
    ) -> Result<Vec<String>> {
        let recovered: Vec<String> = self
            .0
            .key(&queue.0.keys.active)
            .key(&queue.0.keys.waiting)
            .key(&queue.0.keys.notify)
            .key(&queue.0.keys.stats)
            .arg(&queue.0.keys.job_prefix)
            .arg(now_ms)
            .arg(limit)
            .arg(crate::PRIORITY_MULTIPLIER)
            .invoke_async(&mut **conn)
            .await?;
        Ok(recovered)
    }
}
