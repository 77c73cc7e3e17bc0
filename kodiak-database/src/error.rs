use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Redis connection error {0}")]
    RedisPoolError(#[from] deadpool::managed::PoolError<::redis::RedisError>),

    #[error("Redis pool creation error {0}")]
    RedisPoolCreationError(#[from] deadpool_redis::CreatePoolError),

    #[error("Store Configuration Error: {0}")]
    ConfigError(String),
}

pub type Result<T> = std::result::Result<T, Error>;
