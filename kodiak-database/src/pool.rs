use crate::error::{Error, Result};
use std::{env, ops::Deref, sync::Arc};

/// A cloneable handle to a pooled connection to the store, plus the key
/// prefix every queue built on top of it should namespace its keys under.
#[derive(Clone)]
pub struct RedisPool(Arc<RedisPoolInner>);

struct RedisPoolInner {
    pool: deadpool_redis::Pool,
    key_prefix: String,
}

impl Deref for RedisPool {
    type Target = deadpool_redis::Pool;

    fn deref(&self) -> &Self::Target {
        &self.0.pool
    }
}

impl RedisPool {
    /// Build a pool from an explicit connection string, or fall back to
    /// `KODIAK_REDIS_URL`, or `REDIS_URL` for compatibility with hosts that
    /// already export that variable for other services.
    pub fn new(connection: Option<String>, key_prefix: Option<String>) -> Result<RedisPool> {
        Self::with_pool_size(connection, key_prefix, None)
    }

    pub fn with_pool_size(
        connection: Option<String>,
        key_prefix: Option<String>,
        pool_size: Option<usize>,
    ) -> Result<RedisPool> {
        let redis_url = connection
            .or_else(|| env::var("KODIAK_REDIS_URL").ok())
            .or_else(|| env::var("REDIS_URL").ok())
            .ok_or_else(|| {
                Error::ConfigError("KODIAK_REDIS_URL or REDIS_URL is required".to_string())
            })?;

        let pool = deadpool_redis::Config {
            url: Some(redis_url),
            connection: None,
            pool: pool_size.map(deadpool_redis::PoolConfig::new),
        }
        .create_pool()?;

        Ok(RedisPool(Arc::new(RedisPoolInner {
            pool,
            key_prefix: key_prefix.unwrap_or_else(|| "kodiak".to_string()),
        })))
    }

    pub fn pool(&self) -> &deadpool_redis::Pool {
        &self.0.pool
    }

    pub fn key_prefix(&self) -> &str {
        self.0.key_prefix.as_str()
    }
}
