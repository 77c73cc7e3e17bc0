use lazy_static::lazy_static;

use crate::error::Result;
use crate::Queue;

// Classic token-bucket admission check, refilling lazily on each call
// rather than on a timer so idle buckets cost nothing.
// KEYS:
//  1. bucket hash
// ARGV:
//  1. now (ms)
//  2. capacity
//  3. refill rate (tokens/sec)
//  4. cost of this request
const TOKEN_BUCKET_SCRIPT: &str = r##"
    local data = redis.call("HMGET", KEYS[1], "tokens", "ts")
    local capacity = tonumber(ARGV[2])
    local rate = tonumber(ARGV[3])
    local now = tonumber(ARGV[1])
    local cost = tonumber(ARGV[4])

    local tokens = tonumber(data[1])
    local last = tonumber(data[2])
    if tokens == nil then
        tokens = capacity
        last = now
    end

    local elapsed = math.max(0, now - last)
    tokens = math.min(capacity, tokens + elapsed * rate / 1000.0)

    local allowed = 0
    local retry_after = 0
    if tokens >= cost then
        tokens = tokens - cost
        allowed = 1
    else
        local deficit = cost - tokens
        retry_after = math.ceil(deficit / rate * 1000.0)
    end

    redis.call("HSET", KEYS[1], "tokens", tokens, "ts", now)
    redis.call("EXPIRE", KEYS[1], 3600)

    return {allowed, retry_after}
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(TOKEN_BUCKET_SCRIPT);
}

pub(crate) struct TokenBucketScript(&'static redis::Script);

impl TokenBucketScript {
    pub fn new() -> Self {
        TokenBucketScript(&SCRIPT)
    }

    /// Returns `(allowed, retry_after_ms)`. On any Redis failure the caller
    /// is expected to fail open rather than propagate, per the rate
    /// limiter's fail-open policy.
    pub async fn run(
        &self,
        _queue: &Queue,
        conn: &mut deadpool_redis::Connection,
        bucket_key: &str,
        now_ms: i64,
        capacity: f64,
        refill_rate_per_sec: f64,
        cost: f64,
    ) -> Result<(bool, i64)> {
        let (allowed, retry_after): (i64, i64) = self
            .0
            .key(bucket_key)
            .arg(now_ms)
            .arg(capacity)
            .arg(refill_rate_per_sec)
            .arg(cost)
            .invoke_async(&mut **conn)
            .await?;
        Ok((allowed == 1, retry_after))
    }
}
