use lazy_static::lazy_static;

use crate::error::Result;
use crate::Queue;

// Move due delayed jobs onto waiting, recomputing each one's composite
// score from its stored priority (the priority isn't known until the
// script reads the job hash, so it can't be precomputed on the Rust side
// the way a fresh `add` can).
// KEYS:
//  1. delayed
//  2. waiting
//  3. notify
//  4. stats
// ARGV:
//  1. job prefix
//  2. now (ms)
//  3. limit
//  4. priority score multiplier
const PROMOTE_DELAYED_JOBS_SCRIPT: &str = r##"
    local due = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[2], "LIMIT", 0, tonumber(ARGV[3]))
    local mult = tonumber(ARGV[4])
    local moved = {}

    for _, id in ipairs(due) do
        redis.call("ZREM", KEYS[1], id)

        local job_key = ARGV[1] .. id
        local priority = tonumber(redis.call("HGET", job_key, "pr") or "10")
        local score = priority * mult + tonumber(ARGV[2])

        redis.call("ZADD", KEYS[2], score, id)
        redis.call("HSET", job_key, "st", "waiting")
        redis.call("LPUSH", KEYS[3], id)
        table.insert(moved, id)
    end

    if #moved > 0 then
        redis.call("HINCRBY", KEYS[4], "promoted", #moved)
    end

    return moved
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(PROMOTE_DELAYED_JOBS_SCRIPT);
}

pub(crate) struct PromoteDelayedJobsScript(&'static redis::Script);

impl PromoteDelayedJobsScript {
    pub fn new() -> Self {
        PromoteDelayedJobsScript(&SCRIPT)
    }

    pub async fn run(
        &self,
        queue: &Queue,
        conn: &mut deadpool_redis::Connection,
        now_ms: i64,
        limit: u32,
    ) -> Result<Vec<String>> {
        let moved: Vec<String> = self
            .0
            .key(&queue.0.keys.delayed)
            .key(&queue.0.keys.waiting)
            .key(&queue.0.keys.notify)
            .key(&queue.0.keys.stats)
            .arg(&queue.0.keys.job_prefix)
            .arg(now_ms)
            .arg(limit)
            .arg(crate::PRIORITY_MULTIPLIER)
            .invoke_async(&mut **conn)
            .await?;
        Ok(moved)
    }
}
