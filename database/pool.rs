use std::env;
use std::str::FromStr;

use sqlx::{
    postgres::PgPoolOptions,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use tracing::{event, Level};

use crate::error::Error;

pub type PostgresPool = sqlx::PgPool;
pub type SqlitePool = sqlx::SqlitePool;

/// Connect a PostgreSQL pool from a DSN.
pub async fn connect_postgres(url: &str, max_connections: u32) -> Result<PostgresPool, Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?;
    event!(Level::INFO, max_connections, "Connected Postgres pool");
    Ok(pool)
}

/// Connect a SQLite pool. The pool is capped at a single connection: the
/// engine is a single-writer and the queue's guarded-update claim path
/// depends on writes being serialized.
pub async fn connect_sqlite(url: &str) -> Result<SqlitePool, Error> {
    let options = SqliteConnectOptions::from_str(url)
        .map_err(|e| Error::ConfigError(format!("invalid sqlite url: {}", e)))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    event!(Level::INFO, url, "Connected SQLite pool");
    Ok(pool)
}

/// Redis pool plus the key prefix that namespaces every queue structure, for
/// deployments sharing one Redis server.
#[derive(Clone)]
pub struct RedisPool {
    pool: deadpool_redis::Pool,
    key_prefix: Option<String>,
}

impl std::fmt::Debug for RedisPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPool")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RedisPool {
    /// Create a pool. `url` falls back to the `REDIS_URL` environment
    /// variable and `key_prefix` to `QUEUE_REDIS_PREFIX`.
    pub fn new(url: Option<String>, key_prefix: Option<String>) -> Result<RedisPool, Error> {
        let url = match url {
            Some(u) => u,
            None => env::var("REDIS_URL")
                .map_err(|_| Error::ConfigError("REDIS_URL is required".to_string()))?,
        };
        let key_prefix = key_prefix.or_else(|| env::var("QUEUE_REDIS_PREFIX").ok());

        let pool = deadpool_redis::Config::from_url(url)
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))?;

        Ok(RedisPool { pool, key_prefix })
    }

    pub async fn get(&self) -> Result<deadpool_redis::Connection, Error> {
        Ok(self.pool.get().await?)
    }

    pub fn key_prefix(&self) -> Option<&str> {
        self.key_prefix.as_deref()
    }
}
