//! Process-local cache store.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{CacheError, CacheStore};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: String, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Some(Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Minimum time between full sweeps of expired entries.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A [`CacheStore`] backed by a `DashMap`.
///
/// Expired entries are dropped on access, and writes sweep the whole map at
/// most once per [`SWEEP_INTERVAL`]. Time is read from tokio's clock so
/// paused-time tests can advance windows deterministically.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    last_sweep: Mutex<Instant>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently held, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    fn sweep_if_due(&self) {
        let now = Instant::now();
        // Contended: another writer is sweeping.
        let Ok(mut last) = self.last_sweep.try_lock() else {
            return;
        };
        if now.saturating_duration_since(*last) < SWEEP_INTERVAL {
            return;
        }
        *last = now;
        drop(last);

        let removed = self.purge_expired();
        if removed > 0 {
            tracing::debug!(removed, remaining = self.entries.len(), "Swept expired cache entries");
        }
    }

    fn live(&self, key: &str) -> Option<StoredValue> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(key)
            .and_then(|entry| (!entry.is_expired(now)).then(|| entry.clone()));

        if hit.is_none() {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        hit
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.live(key).map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.sweep_if_due();
        self.entries.insert(key.to_string(), StoredValue::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: String, ttl: Duration) -> Result<bool, CacheError> {
        self.sweep_if_due();
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(StoredValue::new(value, ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, ttl));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let now = Instant::now();
        Ok(self
            .live(key)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64, CacheError> {
        self.sweep_if_due();
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if !occupied.get().is_expired(now) => {
                let entry = occupied.get_mut();
                let current: i64 = entry.value.parse().map_err(|_| {
                    CacheError::Unavailable(format!("value at '{key}' is not an integer"))
                })?;
                let next = current + 1;
                entry.value = next.to_string();
                Ok(next)
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(StoredValue {
                    value: "1".to_string(),
                    expires_at: None,
                });
                Ok(1)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue {
                    value: "1".to_string(),
                    expires_at: None,
                });
                Ok(1)
            }
        }
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = MemoryStore::new();
        store.set("k", "v".into(), Duration::from_secs(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.ttl("k").await.unwrap(), Some(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn set_if_absent_respects_live_entries_only() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(10);

        assert!(store.set_if_absent("lock", "true".into(), ttl).await.unwrap());
        assert!(!store.set_if_absent("lock", "true".into(), ttl).await.unwrap());

        tokio::time::advance(ttl).await;
        assert!(store.set_if_absent("lock", "true".into(), ttl).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn writes_sweep_keys_that_are_never_read_again() {
        let store = MemoryStore::new();
        for i in 0..1000 {
            store
                .set(&format!("ratelimit:10.0.{}.{}", i / 256, i % 256), "1".into(), Duration::from_secs(1))
                .await
                .unwrap();
        }
        assert_eq!(store.len(), 1000);

        tokio::time::advance(Duration::from_secs(3600)).await;
        store.set("fresh", "v".into(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeps_are_throttled() {
        let store = MemoryStore::new();
        tokio::time::advance(SWEEP_INTERVAL).await;
        store.set("short", "v".into(), Duration::from_secs(1)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        store.set("other", "v".into(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn incr_creates_missing_keys_without_expiry() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("n").await.unwrap(), 1);
        assert_eq!(store.incr("n").await.unwrap(), 2);
        assert_eq!(store.ttl("n").await.unwrap(), None);

        assert!(store.expire("n", Duration::from_secs(5)).await.unwrap());
        assert!(store.ttl("n").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn incr_rejects_non_integers() {
        let store = MemoryStore::new();
        store.set("n", "\"text\"".into(), Duration::from_secs(5)).await.unwrap();
        assert!(store.incr("n").await.is_err());
    }

    #[tokio::test]
    async fn concurrent_set_if_absent_has_one_winner() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .set_if_absent("race", "true".into(), Duration::from_secs(10))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
