//! In-process TTL cache backed by a `DashMap`.
//!
//! Expired entries are dropped lazily on read and in bulk by
//! [`InMemoryCacheBackend::purge_expired`]. After `close` every operation
//! reports [`CacheError::Unavailable`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use nodeflow_core::cache::{CacheBackend, CacheError};
use serde_json::Value;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCacheBackend {
    entries: DashMap<String, Entry>,
    closed: AtomicBool,
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included until purged.
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

    fn check_open(&self) -> Result<(), CacheError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Unavailable("cache is closed".to_string()));
        }
        Ok(())
    }
}

impl CacheBackend for InMemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        self.check_open()?;
        let now = Instant::now();
        let hit = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if hit {
            self.entries
                .remove_if(key, |_, entry| entry.is_expired(now));
            tracing::trace!(key, "cache entry expired");
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.check_open()?;
        let expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.check_open()?;
        Ok(self.entries.remove(key).is_some())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.check_open()?;
        self.entries.clear();
        Ok(())
    }

    async fn close(&self) -> Result<(), CacheError> {
        self.closed.store(true, Ordering::Release);
        self.entries.clear();
        Ok(())
    }
}
