use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::error::Result;
use crate::Queue;

// Pop up to `count` jobs off waiting in one round trip, for prefetch.
// KEYS:
//  1. waiting
//  2. active
//  3. stats
// ARGV:
//  1. job prefix
//  2. now (ms)
//  3. lock duration (ms)
//  4. count
const MOVE_TO_ACTIVE_SCRIPT: &str = r##"
    local popped = redis.call("ZPOPMIN", KEYS[1], tonumber(ARGV[4]))
    local lock_expires = tonumber(ARGV[2]) + tonumber(ARGV[3])
    local results = {}

    for i = 1, #popped, 2 do
        local job_id = popped[i]
        redis.call("ZADD", KEYS[2], lock_expires, job_id)

        local job_key = ARGV[1] .. job_id
        redis.call("HSET", job_key, "st", "active", "sa", ARGV[2])
        local hash = redis.call("HGETALL", job_key)

        table.insert(results, {job_id, hash})
    end

    if #results > 0 then
        redis.call("HINCRBY", KEYS[3], "retrieved", #results)
    end

    return {lock_expires, results}
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(MOVE_TO_ACTIVE_SCRIPT);
}

pub(crate) struct MoveToActiveScript(&'static redis::Script);

impl MoveToActiveScript {
    pub fn new() -> Self {
        MoveToActiveScript(&SCRIPT)
    }

    pub async fn run(
        &self,
        queue: &Queue,
        conn: &mut deadpool_redis::Connection,
        now_ms: i64,
        lock_duration_ms: i64,
        count: u32,
    ) -> Result<(i64, Vec<(String, HashMap<String, Vec<u8>>)>)> {
        let result = self
            .0
            .key(&queue.0.keys.waiting)
            .key(&queue.0.keys.active)
            .key(&queue.0.keys.stats)
            .arg(&queue.0.keys.job_prefix)
            .arg(now_ms)
            .arg(lock_duration_ms)
            .arg(count)
            .invoke_async(&mut **conn)
            .await?;
        Ok(result)
    }
}
