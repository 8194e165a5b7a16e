//! Redis-backed cache store.

use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use url::Url;

use super::{CacheError, CacheStore};
use crate::config::CacheConfig;

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Unavailable(err.to_string())
    }
}

/// Redis store with automatic reconnection.
///
/// `ConnectionManager` multiplexes one connection and is cheap to clone, so
/// every call works on its own clone.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(config: &CacheConfig) -> Result<Self, CacheError> {
        let url = connection_url(config)?;
        tracing::info!(host = %config.host, port = config.port, db = config.db, "Connecting to Redis");

        let client = redis::Client::open(url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

/// `redis://[:password@]host:port/db`, with the password percent-encoded.
fn connection_url(config: &CacheConfig) -> Result<Url, CacheError> {
    let mut url = Url::parse(&format!("redis://{}:{}/{}", config.host, config.port, config.db))
        .map_err(|e| CacheError::Unavailable(format!("invalid cache address: {e}")))?;

    if let Some(password) = config.password.as_deref().filter(|p| !p.is_empty()) {
        url.set_password(Some(password))
            .map_err(|_| CacheError::Unavailable("cache password cannot be encoded".to_string()))?;
    }
    Ok(url)
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: String, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        // SET NX replies nil when the key already exists.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let mut conn = self.conn.clone();
        // PTTL: -2 missing key, -1 no expiry.
        let millis: i64 = conn.pttl(key).await?;
        Ok((millis >= 0).then(|| Duration::from_millis(millis as u64)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.pexpire(key, ttl_millis(ttl) as i64).await?)
    }

    async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, 1).await?)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
