//! Shared key-value cache used by the request pipeline.
//!
//! # Data Flow
//! ```text
//! pipeline stage (rate limit, idempotency) / health aggregator
//!     → Cache (typed get/set via serde_json)
//!     → CacheStore (raw string values with TTL)
//!         → redis.rs  (Redis, shared between gateway instances)
//!         → memory.rs (DashMap, single process)
//! ```
//!
//! # Design Decisions
//! - One cloneable handle, constructed at startup and passed to every component
//! - Values are JSON text, so integer counters stay compatible with INCR
//! - Callers decide the failure policy; the cache only reports `CacheError`

pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::config::{CacheBackend, CacheConfig};

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

#[derive(Debug, Error)]
pub enum CacheError {
    /// The store could not be reached or rejected the command.
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache value could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Raw operations a backing store must provide.
///
/// Implementations must be safe to call concurrently without external locking.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Store `value` only when `key` does not exist. Returns whether it was stored.
    async fn set_if_absent(&self, key: &str, value: String, ttl: Duration) -> Result<bool, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Remaining time to live; `None` when the key is missing or never expires.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// Atomically add one, creating the key at 1 when missing.
    async fn incr(&self, key: &str) -> Result<i64, CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;
}

/// Typed handle over a [`CacheStore`].
#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn CacheStore>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").finish_non_exhaustive()
    }
}

impl Cache {
    pub fn new(store: impl CacheStore + 'static) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    /// In-process cache, used for local development and tests.
    pub fn memory() -> Self {
        Self::new(MemoryStore::new())
    }

    /// Build the cache described by the configuration.
    pub async fn connect(config: &CacheConfig) -> Result<Self, CacheError> {
        match config.backend {
            CacheBackend::Redis => Ok(Self::new(RedisStore::connect(config).await?)),
            CacheBackend::Memory => {
                tracing::warn!("Using in-memory cache; limits and idempotency are per-instance");
                Ok(Self::memory())
            }
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.store.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), CacheError> {
        let raw = serde_json::to_string(value)?;
        self.store.set(key, raw, ttl).await
    }

    pub async fn set_if_absent<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let raw = serde_json::to_string(value)?;
        self.store.set_if_absent(key, raw, ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.store.delete(key).await
    }

    pub async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        self.store.ttl(key).await
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        self.store.expire(key, ttl).await
    }

    pub async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        self.store.incr(key).await
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        self.store.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        hits: u32,
    }

    #[tokio::test]
    async fn typed_values_round_trip_through_json() {
        let cache = Cache::memory();
        let value = Sample { name: "orders".into(), hits: 3 };

        cache.set("sample", &value, Duration::from_secs(60)).await.unwrap();
        let loaded: Option<Sample> = cache.get("sample").await.unwrap();
        assert_eq!(loaded, Some(value));
    }

    #[tokio::test]
    async fn counters_written_as_json_can_be_incremented() {
        let cache = Cache::memory();
        cache.set("counter", &1i64, Duration::from_secs(60)).await.unwrap();

        assert_eq!(cache.incr("counter").await.unwrap(), 2);
        assert_eq!(cache.get::<i64>("counter").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn wrong_shape_is_serialization_error() {
        let cache = Cache::memory();
        cache.set("counter", &7i64, Duration::from_secs(60)).await.unwrap();

        let err = cache.get::<Sample>("counter").await.unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
    }
}
