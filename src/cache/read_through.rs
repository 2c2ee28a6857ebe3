//! Read-through caching that never turns a cache outage into a request failure.

use crate::error::Result;
use crate::traits::cache::Cache;
use serde::{Serialize, de::DeserializeOwned};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Best-effort read-through cache in front of an authoritative fetcher.
///
/// Hits within TTL skip the fetcher. Misses call the fetcher and store its
/// result. Any backend error (read, write or decode) is logged and the
/// fetcher's result is returned as if the cache were absent.
#[derive(Clone)]
pub struct ReadThroughCache {
    backend: Arc<dyn Cache>,
}

impl ReadThroughCache {
    pub fn new(backend: Arc<dyn Cache>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn Cache> {
        &self.backend
    }

    /// Return the cached value for `key`, or compute it with `fetcher` and cache it for `ttl_seconds`.
    ///
    /// Only errors from `fetcher` propagate.
    pub async fn get_cached<T, F, Fut>(&self, key: &str, ttl_seconds: u64, fetcher: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.backend.get_bytes(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<T>(&bytes) {
                Ok(value) => {
                    tracing::trace!(target: "tollgate::cache", key, "cache hit");
                    return Ok(value);
                }
                Err(e) => {
                    tracing::warn!(
                        target: "tollgate::cache",
                        key,
                        error = %e,
                        "Discarding undecodable cache entry"
                    );
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    target: "tollgate::cache",
                    key,
                    error = %e,
                    "Cache read failed, calling fetcher directly"
                );
                return fetcher().await;
            }
        }

        let value = fetcher().await?;

        match serde_json::to_vec(&value) {
            Ok(bytes) => {
                let ttl = Some(Duration::from_secs(ttl_seconds));
                if let Err(e) = self.backend.set_bytes(key, bytes, ttl).await {
                    tracing::warn!(
                        target: "tollgate::cache",
                        key,
                        error = %e,
                        "Cache write failed"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    target: "tollgate::cache",
                    key,
                    error = %e,
                    "Value not cacheable"
                );
            }
        }

        Ok(value)
    }

    /// Evict every key matching `pattern` (`*` wildcard). Returns how many were removed.
    ///
    /// Backend errors are logged and reported as zero removals.
    pub async fn invalidate_cache(&self, pattern: &str) -> u64 {
        match self.backend.delete_matching(pattern).await {
            Ok(removed) => {
                tracing::debug!(target: "tollgate::cache", pattern, removed, "cache invalidated");
                removed
            }
            Err(e) => {
                tracing::warn!(
                    target: "tollgate::cache",
                    pattern,
                    error = %e,
                    "Cache invalidation failed"
                );
                0
            }
        }
    }

    /// Evict exactly `key`. Backend errors are logged and swallowed.
    pub async fn invalidate_key(&self, key: &str) {
        match self.backend.delete(key).await {
            Ok(()) => tracing::debug!(target: "tollgate::cache", key, "cache key invalidated"),
            Err(e) => tracing::warn!(
                target: "tollgate::cache",
                key,
                error = %e,
                "Cache invalidation failed"
            ),
        }
    }
}
