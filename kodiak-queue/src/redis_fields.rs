use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::job::BackoffKind;
use crate::state::JobState;

/// The job hash fields from SPEC_FULL.md §3, as the short keys actually
/// stored on the wire.
pub(crate) enum JobField {
    Data,
    State,
    Priority,
    RetryCount,
    MaxAttempts,
    AddedAt,
    StartedAt,
    CompletedAt,
    FailedAt,
    Error,
    Progress,
    BackoffType,
    BackoffDelay,
    RepeatEvery,
    RepeatCount,
    RepeatLimit,
    LockOwner,
    UpdatedAt,
    DelayedMeta,
    DelayedReason,
    RateLimitResetAt,
}

impl JobField {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobField::Data => "d",
            JobField::State => "st",
            JobField::Priority => "pr",
            JobField::RetryCount => "rc",
            JobField::MaxAttempts => "ma",
            JobField::AddedAt => "at",
            JobField::StartedAt => "sa",
            JobField::CompletedAt => "ca",
            JobField::FailedAt => "fa",
            JobField::Error => "err",
            JobField::Progress => "pg",
            JobField::BackoffType => "bt",
            JobField::BackoffDelay => "bd",
            JobField::RepeatEvery => "re",
            JobField::RepeatCount => "rn",
            JobField::RepeatLimit => "rl",
            JobField::LockOwner => "lo",
            JobField::UpdatedAt => "ua",
            JobField::DelayedMeta => "dm",
            JobField::DelayedReason => "dr",
            JobField::RateLimitResetAt => "rr",
        }
    }
}

impl redis::ToRedisArgs for JobField {
    fn write_redis_args<W>(&self, out: &mut W)
    where
        W: ?Sized + redis::RedisWrite,
    {
        out.write_arg(self.as_str().as_bytes())
    }
}

/// Builder for the field/value pairs written to a job hash on `add`,
/// mirroring the field-by-field command builders the rest of this
/// codebase's Redis job hashes use. Accumulates raw args rather than a
/// `redis::Cmd` directly so the same pairs can feed either a plain `HSET`
/// or the extra `ARGV` tail of `add_job`'s script.
pub(crate) struct JobHashSetCmd(Vec<Vec<u8>>);

fn encode<T: redis::ToRedisArgs>(value: T) -> Vec<u8> {
    value.to_redis_args().into_iter().next().unwrap_or_default()
}

impl JobHashSetCmd {
    pub fn new() -> Self {
        JobHashSetCmd(Vec::new())
    }

    fn push(&mut self, field: JobField, value: Vec<u8>) {
        self.0.push(encode(field.as_str()));
        self.0.push(value);
    }

    /// Flattened `[field, value, field, value, ...]` pairs, ready to append
    /// as extra `ARGV` entries or as the tail of an `HSET` command.
    pub fn into_args(self) -> Vec<Vec<u8>> {
        self.0
    }

    pub fn data(mut self, data: &[u8]) -> Self {
        self.push(JobField::Data, data.to_vec());
        self
    }

    pub fn state(mut self, state: JobState) -> Self {
        self.push(JobField::State, encode(state.as_str()));
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.push(JobField::Priority, encode(priority));
        self
    }

    pub fn retry_count(mut self, count: u32) -> Self {
        self.push(JobField::RetryCount, encode(count));
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.push(JobField::MaxAttempts, encode(attempts));
        self
    }

    pub fn added_at(mut self, at: DateTime<Utc>) -> Self {
        self.push(JobField::AddedAt, encode(at.timestamp_millis()));
        self
    }

    pub fn backoff(mut self, kind: &BackoffKind, delay: Duration) -> Self {
        self.push(JobField::BackoffType, encode(kind.as_str()));
        self.push(JobField::BackoffDelay, encode(delay.as_millis() as i64));
        self
    }

    pub fn repeat(mut self, every_ms: i64, limit: Option<u32>) -> Self {
        self.push(JobField::RepeatEvery, encode(every_ms));
        self.push(JobField::RepeatCount, encode(0u32));
        self.push(
            JobField::RepeatLimit,
            encode(limit.map(|l| l as i64).unwrap_or(-1)),
        );
        self
    }
}
