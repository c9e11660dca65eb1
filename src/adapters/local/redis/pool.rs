//! Redis connection pool.

use crate::ports::queue::QueueError;
use deadpool_redis::{Config, Pool, Runtime};

/// Redis-backed adapter for queue operations.
#[derive(Clone)]
pub struct RedisPool {
    pub(super) pool: Pool,
}

impl RedisPool {
    /// Create a new RedisPool with connection pool.
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(Self { pool })
    }
}
