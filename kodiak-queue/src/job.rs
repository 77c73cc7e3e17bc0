use chrono::{DateTime, Utc};
use serde::Serialize;
use std::borrow::Cow;

/// How a job's next-attempt delay is computed after a processor failure.
/// See SPEC_FULL.md §4.7.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffKind {
    Fixed,
    Exponential,
    /// A named strategy registered on the `Worker` that owns this job's
    /// queue (`WorkerOptions::backoff_strategies`).
    Custom(String),
}

impl BackoffKind {
    pub(crate) fn as_str(&self) -> &str {
        match self {
            BackoffKind::Fixed => "fixed",
            BackoffKind::Exponential => "exponential",
            BackoffKind::Custom(name) => name.as_str(),
        }
    }

    pub(crate) fn from_str(s: &str) -> BackoffKind {
        match s {
            "fixed" => BackoffKind::Fixed,
            "exponential" => BackoffKind::Exponential,
            other => BackoffKind::Custom(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub kind: BackoffKind,
    pub delay: std::time::Duration,
}

/// Recurring-job configuration. A job carrying this is re-inserted into
/// `delayed` after each successful completion until `limit` runs have
/// happened (or indefinitely, if `limit` is `None`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RepeatConfig {
    pub every: std::time::Duration,
    pub limit: Option<u32>,
}

/// Determines how to generate a job ID.
pub enum JobId<'a> {
    /// Autogenerate a v4 UUID.
    Auto,
    /// Concatenate the given prefix with a v4 UUID.
    Prefix(&'a str),
    /// Use this value as the job ID. It's up to you to make sure that the ID
    /// is unique within the queue.
    Value(&'a str),
}

impl<'a> JobId<'a> {
    pub fn make_id(&self) -> String {
        match self {
            JobId::Auto => uuid::Uuid::new_v4().to_string(),
            JobId::Prefix(prefix) => format!("{}:{}", prefix, uuid::Uuid::new_v4()),
            JobId::Value(s) => s.to_string(),
        }
    }
}

/// A job to be enqueued, matching the producer-facing `add` contract in
/// SPEC_FULL.md §6.
#[derive(Default)]
pub struct Job<'a> {
    pub id: String,
    pub payload: Cow<'a, [u8]>,
    /// Lower runs first. Default 10 (see `Job::default_priority`).
    pub priority: Option<i64>,
    /// Delay, relative to now, before the job becomes waiting.
    pub delay: Option<std::time::Duration>,
    /// Absolute time the job should become waiting. Takes precedence over
    /// `delay` if both are set.
    pub wait_until: Option<DateTime<Utc>>,
    pub attempts: Option<u32>,
    pub backoff: Option<BackoffConfig>,
    pub repeat: Option<RepeatConfig>,
}

impl<'a> std::fmt::Debug for Job<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("payload", &String::from_utf8_lossy(&self.payload))
            .field("priority", &self.priority)
            .field("delay", &self.delay)
            .field("wait_until", &self.wait_until)
            .field("attempts", &self.attempts)
            .field("repeat", &self.repeat)
            .finish()
    }
}

impl<'a> Job<'a> {
    /// Default priority when a job doesn't specify one: lower runs first,
    /// so new jobs without an opinion sit in the middle of the range.
    pub const DEFAULT_PRIORITY: i64 = 10;

    pub fn from_bytes(id: JobId<'_>, bytes: &'a [u8]) -> Job<'a> {
        Job {
            id: id.make_id(),
            payload: Cow::Borrowed(bytes),
            ..Default::default()
        }
    }

    pub fn from_json_payload<T: Serialize>(
        id: JobId<'_>,
        payload: &T,
    ) -> Result<Job<'static>, serde_json::Error> {
        let data = serde_json::to_vec(&payload)?;
        Ok(Job {
            id: id.make_id(),
            payload: Cow::Owned(data),
            ..Default::default()
        })
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn wait_until(mut self, at: DateTime<Utc>) -> Self {
        self.wait_until = Some(at);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn backoff(mut self, kind: BackoffKind, delay: std::time::Duration) -> Self {
        self.backoff = Some(BackoffConfig { kind, delay });
        self
    }

    pub fn repeat(mut self, every: std::time::Duration, limit: Option<u32>) -> Self {
        self.repeat = Some(RepeatConfig { every, limit });
        self
    }

    /// The absolute time this job should first become eligible to run, or
    /// `None` if it should be immediately waiting.
    pub(crate) fn run_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(at) = self.wait_until {
            return Some(at);
        }
        self.delay
            .filter(|d| !d.is_zero())
            .map(|d| now + chrono::Duration::from_std(d).unwrap_or_default())
    }
}
