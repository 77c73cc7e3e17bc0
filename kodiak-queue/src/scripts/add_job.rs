use lazy_static::lazy_static;

use crate::error::Result;
use crate::Queue;

// Write a new job's hash fields and place it on the waiting or delayed set.
// KEYS:
//  1. waiting
//  2. delayed
//  3. job hash key
//  4. notify
//  5. stats
// ARGV:
//  1. job id
//  2. score (composite priority/time score if waiting, due-time ms if delayed)
//  3. is_delayed ("1"/"0")
//  4..N. field/value pairs to HSET on the job hash
const ADD_JOB_SCRIPT: &str = r##"
    local id = ARGV[1]
    local score = tonumber(ARGV[2])
    local is_delayed = ARGV[3] == "1"

    if #ARGV > 3 then
        local hset_args = {}
        for i = 4, #ARGV do
            table.insert(hset_args, ARGV[i])
        end
        redis.call("HSET", KEYS[3], unpack(hset_args))
    end

    redis.call("HINCRBY", KEYS[5], "enqueued", 1)

    if is_delayed then
        redis.call("ZADD", KEYS[2], score, id)
        return score
    else
        redis.call("ZADD", KEYS[1], score, id)
        redis.call("LPUSH", KEYS[4], id)
        return -1
    end
"##;

lazy_static! {
    static ref SCRIPT: redis::Script = redis::Script::new(ADD_JOB_SCRIPT);
}

pub(crate) struct AddJobScript(&'static redis::Script);

impl AddJobScript {
    pub fn new() -> Self {
        AddJobScript(&SCRIPT)
    }

    /// Returns the delayed due-time score if the job was inserted delayed,
    /// or `-1` if it went straight to waiting.
    pub async fn run(
        &self,
        queue: &Queue,
        conn: &mut deadpool_redis::Connection,
        id: &str,
        job_key: &str,
        score: i64,
        is_delayed: bool,
        fields: &[Vec<u8>],
    ) -> Result<i64> {
        let mut invocation = self
            .0
            .key(&queue.0.keys.waiting)
            .key(&queue.0.keys.delayed)
            .key(job_key)
            .key(&queue.0.keys.notify)
            .key(&queue.0.keys.stats)
            .arg(id)
            .arg(score)
            .arg(if is_delayed { "1" } else { "0" })
            .to_owned();

        for field in fields {
            invocation.arg(field.as_slice());
        }

        let result: i64 = invocation.invoke_async(&mut **conn).await?;
        Ok(result)
    }
}
