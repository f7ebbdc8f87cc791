//! Cache backend port and its object-safe wrapper.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::Value;

/// Errors from a cache backend.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache serialization failed: {0}")]
    Serialization(String),
}

/// String-keyed store of JSON values with optional expiry.
///
/// Uses RPITIT (native async fn in traits, Rust 2024 edition).
/// Implementations live in nodeflow-infra.
pub trait CacheBackend: Send + Sync {
    /// Get a live value. Expired entries are absent.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Value>, CacheError>> + Send;

    /// Store a value, replacing any previous one.
    fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;

    /// Remove a key. Returns whether it existed.
    fn delete(&self, key: &str) -> impl Future<Output = Result<bool, CacheError>> + Send;

    /// Remove every entry.
    fn clear(&self) -> impl Future<Output = Result<(), CacheError>> + Send;

    /// Release backend resources.
    fn close(&self) -> impl Future<Output = Result<(), CacheError>> + Send;
}

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, CacheError>> + Send + 'a>>;

/// Object-safe version of [`CacheBackend`] with boxed futures.
pub trait CacheBackendDyn: Send + Sync {
    fn get_boxed<'a>(&'a self, key: &'a str) -> BoxFut<'a, Option<Value>>;
    fn set_boxed<'a>(&'a self, key: &'a str, value: Value, ttl: Option<Duration>) -> BoxFut<'a, ()>;
    fn delete_boxed<'a>(&'a self, key: &'a str) -> BoxFut<'a, bool>;
    fn clear_boxed(&self) -> BoxFut<'_, ()>;
    fn close_boxed(&self) -> BoxFut<'_, ()>;
}

impl<T: CacheBackend> CacheBackendDyn for T {
    fn get_boxed<'a>(&'a self, key: &'a str) -> BoxFut<'a, Option<Value>> {
        Box::pin(self.get(key))
    }

    fn set_boxed<'a>(&'a self, key: &'a str, value: Value, ttl: Option<Duration>) -> BoxFut<'a, ()> {
        Box::pin(self.set(key, value, ttl))
    }

    fn delete_boxed<'a>(&'a self, key: &'a str) -> BoxFut<'a, bool> {
        Box::pin(self.delete(key))
    }

    fn clear_boxed(&self) -> BoxFut<'_, ()> {
        Box::pin(self.clear())
    }

    fn close_boxed(&self) -> BoxFut<'_, ()> {
        Box::pin(self.close())
    }
}

/// Type-erased cache backend.
pub struct BoxCacheBackend {
    inner: Box<dyn CacheBackendDyn>,
}

impl BoxCacheBackend {
    pub fn new<T: CacheBackend + 'static>(backend: T) -> Self {
        Self {
            inner: Box::new(backend),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        self.inner.get_boxed(key).await
    }

    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.inner.set_boxed(key, value, ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.inner.delete_boxed(key).await
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        self.inner.clear_boxed().await
    }

    pub async fn close(&self) -> Result<(), CacheError> {
        self.inner.close_boxed().await
    }
}

impl std::fmt::Debug for BoxCacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxCacheBackend").finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::TestCache;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn boxed_backend_delegates() {
        let cache = BoxCacheBackend::new(TestCache::default());
        cache.set("k", json!(1), None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(json!(1)));
        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.delete("k").await.unwrap());
        cache.clear().await.unwrap();
        cache.close().await.unwrap();
    }
}
