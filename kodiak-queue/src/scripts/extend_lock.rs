use lazy_static::lazy_static;

use crate::error::Result;
use crate::Queue;

// Extend a held lock's expiry, optionally verifying the caller still owns
// it. Used by the worker loop's heartbeat and by `JobEntity::extend_lock`.
// KEYS:
//  1. active
//  2. job hash key
// ARGV:
//  1. job id
//  2. new expiry (ms)
//  3. owner token to verify against, or "" to skip the check
const EXTEND_LOCK_SCRIPT: &str = r##"
    local exists = redis.call("ZSCORE", KEYS[1], ARGV[1])
    if not exists then
        return 0
    end

    if ARGV[3] ~= "" then
        local owner = redis.call("HGET", KEYS[2], "lo")
        if owner and owner ~= ARGV[3] then
            return 0
        end
    end

    redis.call("ZADD", KEYS[1], ARGV[2], ARGV[1])
    return 1
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(EXTEND_LOCK_SCRIPT);
}

pub(crate) struct ExtendLockScript(&'static redis::Script);

impl ExtendLockScript {
    pub fn new() -> Self {
        ExtendLockScript(&SCRIPT)
    }

    pub async fn run(
        &self,
        queue: &Queue,
        conn: &mut deadpool_redis::Connection,
        job_id: &str,
        job_key: &str,
        new_expiry_ms: i64,
        owner_token: Option<&str>,
    ) -> Result<bool> {
        let result: i64 = self
            .0
            .key(&queue.0.keys.active)
            .key(job_key)
            .arg(job_id)
            .arg(new_expiry_ms)
            .arg(owner_token.unwrap_or(""))
            .invoke_async(&mut **conn)
            .await?;
        Ok(result == 1)
    }
}
