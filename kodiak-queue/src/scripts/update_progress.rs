use lazy_static::lazy_static;

use crate::error::Result;
use crate::Queue;

// Record a progress update. Returns false if the job hash no longer
// exists (the job was never added, or has since been evicted).
// KEYS:
//  1. job hash key
// ARGV:
//  1. progress payload (JSON)
const UPDATE_PROGRESS_SCRIPT: &str = r##"
    if redis.call("EXISTS", KEYS[1]) == 0 then
        return 0
    end
    redis.call("HSET", KEYS[1], "pg", ARGV[1])
    return 1
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(UPDATE_PROGRESS_SCRIPT);
}

pub(crate) struct UpdateProgressScript(&'static redis::Script);

impl UpdateProgressScript {
    pub fn new() -> Self {
        UpdateProgressScript(&SCRIPT)
    }

    pub async fn run(
        &self,
        _queue: &Queue,
        conn: &mut deadpool_redis::Connection,
        job_key: &str,
        progress_json: &[u8],
    ) -> Result<bool> {
        let result: i64 = self
            .0
            .key(job_key)
            .arg(progress_json)
            .invoke_async(&mut **conn)
            .await?;
        Ok(result == 1)
    }
}
