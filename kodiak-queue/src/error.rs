use thiserror::Error;

/// The error taxonomy from SPEC_FULL.md §7. `ScriptError`, `StoreError` and
/// the pool/serde variants below are all transport-level failures that a
/// caller may retry; `ProcessorError` is the only variant that originates
/// from user code.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Redis error {0}")]
    RedisError(#[from] redis::RedisError),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),

    #[error(transparent)]
    DatabaseError(#[from] kodiak_database::Error),

    #[error("Redis connection error {0}")]
    RedisPoolError(#[from] deadpool::managed::PoolError<::redis::RedisError>),

    #[error(transparent)]
    ParseIntError(#[from] std::num::ParseIntError),

    #[error("Invalid script result: {0}")]
    ScriptError(String),

    #[error("Queue configuration error: {0}")]
    ConfigError(String),

    #[error("Job already exists: {0}")]
    AlreadyExists(String),

    #[error("Worker is already running")]
    AlreadyRunning,

    #[error("Job processor error: {0}")]
    ProcessorError(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
