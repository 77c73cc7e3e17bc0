use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::job::{BackoffConfig, BackoffKind};
use crate::redis_fields::JobField;
use crate::state::JobState;
use crate::Queue;

fn field(hash: &HashMap<String, Vec<u8>>, field: JobField) -> Option<Vec<u8>> {
    hash.get(field.as_str()).cloned()
}

fn field_str(hash: &HashMap<String, Vec<u8>>, f: JobField) -> Option<String> {
    field(hash, f).map(|v| String::from_utf8_lossy(&v).into_owned())
}

fn field_i64(hash: &HashMap<String, Vec<u8>>, f: JobField) -> Option<i64> {
    field_str(hash, f).and_then(|s| s.parse::<i64>().ok())
}

fn field_millis(hash: &HashMap<String, Vec<u8>>, f: JobField) -> Option<DateTime<Utc>> {
    field_i64(hash, f).map(|ms| Utc.timestamp_millis(ms))
}

/// A full point-in-time snapshot of a job's metadata, as returned by
/// `Queue::job_info`. This is an introspection/debugging view; the
/// processor itself receives a `JobEntity`.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub state: JobState,
    pub priority: i64,
    pub retry_count: u32,
    pub max_attempts: u32,
    pub added_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub progress: Option<serde_json::Value>,
    pub backoff: Option<BackoffConfig>,
    pub repeat_every: Option<Duration>,
    pub repeat_count: Option<u32>,
    pub repeat_limit: Option<u32>,
    pub lock_owner: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub delayed_meta: Option<serde_json::Value>,
    pub delayed_reason: Option<String>,
    pub rate_limit_reset_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub(crate) fn from_hash(id: &str, hash: &HashMap<String, Vec<u8>>) -> Result<Option<Self>> {
        let state = match field_str(hash, JobField::State).and_then(|s| JobState::from_str(&s)) {
            Some(s) => s,
            None => return Ok(None),
        };

        let backoff = match field_str(hash, JobField::BackoffType) {
            Some(kind) => field_i64(hash, JobField::BackoffDelay).map(|ms| BackoffConfig {
                kind: BackoffKind::from_str(&kind),
                delay: Duration::from_millis(ms.max(0) as u64),
            }),
            None => None,
        };

        let progress = field(hash, JobField::Progress)
            .map(|v| serde_json::from_slice(&v))
            .transpose()?;
        let delayed_meta = field(hash, JobField::DelayedMeta)
            .map(|v| serde_json::from_slice(&v))
            .transpose()?;

        Ok(Some(JobRecord {
            id: id.to_string(),
            state,
            priority: field_i64(hash, JobField::Priority).unwrap_or(crate::job::Job::DEFAULT_PRIORITY),
            retry_count: field_i64(hash, JobField::RetryCount).unwrap_or(0) as u32,
            max_attempts: field_i64(hash, JobField::MaxAttempts).unwrap_or(1) as u32,
            added_at: field_millis(hash, JobField::AddedAt).unwrap_or_else(Utc::now),
            started_at: field_millis(hash, JobField::StartedAt),
            completed_at: field_millis(hash, JobField::CompletedAt),
            failed_at: field_millis(hash, JobField::FailedAt),
            error: field_str(hash, JobField::Error),
            progress,
            backoff,
            repeat_every: field_i64(hash, JobField::RepeatEvery).map(|ms| Duration::from_millis(ms as u64)),
            repeat_count: field_i64(hash, JobField::RepeatCount).map(|c| c as u32),
            repeat_limit: field_i64(hash, JobField::RepeatLimit).and_then(|l| if l < 0 { None } else { Some(l as u32) }),
            lock_owner: field_str(hash, JobField::LockOwner),
            updated_at: field_millis(hash, JobField::UpdatedAt),
            delayed_meta,
            delayed_reason: field_str(hash, JobField::DelayedReason),
            rate_limit_reset_at: field_millis(hash, JobField::RateLimitResetAt),
        }))
    }
}

/// The typed, actionable job handed to a worker's processor. Carries enough
/// context (queue handle, owner token, lock expiry) to report progress and
/// to check whether it's still owned by the caller, per SPEC_FULL.md §4.8.
#[derive(Debug)]
pub struct JobEntity<T: Send + Sync> {
    queue: Queue,
    pub id: String,
    pub data: T,
    pub priority: i64,
    pub retry_count: u32,
    pub max_attempts: u32,
    pub backoff: Option<BackoffConfig>,
    pub lock_expires_at: DateTime<Utc>,
    pub(crate) owner_token: Option<String>,
}

impl<T: DeserializeOwned + Send + Sync> JobEntity<T> {
    pub(crate) fn from_hash(
        queue: Queue,
        id: &str,
        lock_expires_at: DateTime<Utc>,
        owner_token: Option<String>,
        hash: &HashMap<String, Vec<u8>>,
    ) -> Result<Self> {
        let data_bytes = field(hash, JobField::Data).ok_or_else(|| {
            Error::ScriptError(format!("job {} is missing its data field", id))
        })?;
        let data: T = serde_json::from_slice(&data_bytes)?;

        let backoff = match field_str(hash, JobField::BackoffType) {
            Some(kind) => field_i64(hash, JobField::BackoffDelay).map(|ms| BackoffConfig {
                kind: BackoffKind::from_str(&kind),
                delay: Duration::from_millis(ms.max(0) as u64),
            }),
            None => None,
        };

        Ok(JobEntity {
            queue,
            id: id.to_string(),
            data,
            priority: field_i64(hash, JobField::Priority).unwrap_or(crate::job::Job::DEFAULT_PRIORITY),
            retry_count: field_i64(hash, JobField::RetryCount).unwrap_or(0) as u32,
            max_attempts: field_i64(hash, JobField::MaxAttempts).unwrap_or(1) as u32,
            backoff,
            lock_expires_at,
            owner_token,
        })
    }

    /// Report progress. Visible to anyone calling `Queue::job_info` while
    /// this job is active.
    pub async fn update_progress(&self, progress: &serde_json::Value) -> Result<()> {
        self.queue.update_progress(&self.id, progress).await?;
        Ok(())
    }

    /// Extend this job's lock, e.g. from a heartbeat outside the normal
    /// worker-loop heartbeat. Returns `false` if the lock was lost (another
    /// worker may now own it, or stalled recovery already reclaimed it).
    pub async fn extend_lock(&self, new_expiry: DateTime<Utc>) -> Result<bool> {
        self.queue
            .extend_lock(&self.id, new_expiry, self.owner_token.as_deref())
            .await
    }
}
