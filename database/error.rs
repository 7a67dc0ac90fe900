use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("SQL Error")]
    SqlError(#[from] sqlx::error::Error),

    #[error("Database Configuration Error: {0}")]
    ConfigError(String),

    #[error("Redis error {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Redis connection error {0}")]
    RedisPoolError(#[from] deadpool_redis::PoolError),

    #[error("Redis pool creation error {0}")]
    RedisPoolCreationError(#[from] deadpool_redis::CreatePoolError),
}
