use lazy_static::lazy_static;

use crate::error::Result;
use crate::Queue;

// Sliding-window admission check: trims entries older than the window,
// then admits `cost` units if the remaining count plus cost stays under
// the limit, inserting one distinct member per unit so a batch request
// reserves its full weight in the window rather than a single slot.
// KEYS:
//  1. window zset
// ARGV:
//  1. now (ms)
//  2. window length (ms)
//  3. limit
//  4. unique member id prefix for this request
//  5. cost (number of units to admit)
const SLIDING_WINDOW_SCRIPT: &str = r##"
    local now = tonumber(ARGV[1])
    local window = tonumber(ARGV[2])
    local limit = tonumber(ARGV[3])
    local cost = tonumber(ARGV[5])

    redis.call("ZREMRANGEBYSCORE", KEYS[1], "-inf", now - window)
    local count = redis.call("ZCARD", KEYS[1])

    if count + cost <= limit then
        for i = 1, cost do
            redis.call("ZADD", KEYS[1], now, ARGV[4] .. ":" .. i)
        end
        redis.call("EXPIRE", KEYS[1], math.ceil(window / 1000) + 1)
        return {1, 0}
    end

    local earliest = redis.call("ZRANGE", KEYS[1], 0, 0, "WITHSCORES")
    local reset_at = now + window
    if #earliest == 2 then
        reset_at = tonumber(earliest[2]) + window
    end
    return {0, reset_at}
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(SLIDING_WINDOW_SCRIPT);
}

pub(crate) struct SlidingWindowScript(&'static redis::Script);

impl SlidingWindowScript {
    pub fn new() -> Self {
        SlidingWindowScript(&SCRIPT)
    }

    /// Returns `(allowed, reset_at_ms)`. `cost` units are admitted
    /// atomically, or none at all.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        _queue: &Queue,
        conn: &mut deadpool_redis::Connection,
        window_key: &str,
        now_ms: i64,
        window_ms: i64,
        limit: u32,
        request_id: &str,
        cost: u32,
    ) -> Result<(bool, i64)> {
        let (allowed, reset_at): (i64, i64) = self
            .0
            .key(window_key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .arg(request_id)
            .arg(cost.max(1))
            .invoke_async(&mut **conn)
            .await?;
        Ok((allowed == 1, reset_at))
    }
}
