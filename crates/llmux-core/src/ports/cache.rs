//! Response cache port.
//!
//! The executor treats the cache as an opaque key/value store. Uses RPITIT
//! like the other ports; [`BoxCacheStore`] provides the object-safe handle
//! the client holds.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use llmux_types::error::CacheError;
use llmux_types::llm::ChatResponse;

/// Trait for response cache backends.
pub trait CacheStore: Send + Sync {
    /// Get a cached response. Returns None if absent or expired.
    fn get(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<ChatResponse>, CacheError>> + Send;

    /// Store a response, optionally overriding the backend's default TTL.
    fn set(
        &self,
        key: &str,
        value: ChatResponse,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe version of [`CacheStore`].
pub trait CacheStoreDyn: Send + Sync {
    fn get_boxed<'a>(&'a self, key: &'a str)
    -> BoxFuture<'a, Result<Option<ChatResponse>, CacheError>>;

    fn set_boxed<'a>(
        &'a self,
        key: &'a str,
        value: ChatResponse,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), CacheError>>;
}

impl<T: CacheStore> CacheStoreDyn for T {
    fn get_boxed<'a>(
        &'a self,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<ChatResponse>, CacheError>> {
        Box::pin(self.get(key))
    }

    fn set_boxed<'a>(
        &'a self,
        key: &'a str,
        value: ChatResponse,
        ttl: Option<Duration>,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(self.set(key, value, ttl))
    }
}

/// Shared, type-erased cache handle.
#[derive(Clone)]
pub struct BoxCacheStore {
    inner: Arc<dyn CacheStoreDyn>,
}

impl BoxCacheStore {
    pub fn new<T: CacheStore + 'static>(store: T) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    /// Wrap an already shared store, keeping the caller's handle usable.
    pub fn from_arc<T: CacheStore + 'static>(store: Arc<T>) -> Self {
        Self { inner: store }
    }

    pub async fn get(&self, key: &str) -> Result<Option<ChatResponse>, CacheError> {
        self.inner.get_boxed(key).await
    }

    pub async fn set(
        &self,
        key: &str,
        value: ChatResponse,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.inner.set_boxed(key, value, ttl).await
    }
}

impl std::fmt::Debug for BoxCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxCacheStore").finish_non_exhaustive()
    }
}
