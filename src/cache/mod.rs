//! Caching abstractions with multiple backend implementations.
//!
//! The default backend is in-memory (moka). Redis is available with the
//! `cache-redis` feature. Request-path reads go through [`ReadThroughCache`].

mod config;
mod in_memory;
mod noop;
mod read_through;

#[cfg(feature = "cache-redis")]
mod redis;

pub use config::{CacheBackend, CacheConfig};
pub use in_memory::{InMemoryCache, InMemoryCacheBuilder};
pub use noop::NoOpCache;
pub use read_through::ReadThroughCache;

#[cfg(feature = "cache-redis")]
pub use redis::RedisCache;

use crate::error::Result;
use crate::traits::cache::Cache;
use std::sync::Arc;
use std::time::Duration;

/// Build the configured cache backend.
pub fn build_cache(config: &CacheConfig) -> Result<Arc<dyn Cache>> {
    let ttl = Duration::from_secs(config.default_ttl_seconds);
    let cache: Arc<dyn Cache> = match config.backend {
        CacheBackend::InMemory => {
            Arc::new(InMemoryCache::with_ttl(config.max_entries as u64, ttl))
        }
        #[cfg(feature = "cache-redis")]
        CacheBackend::Redis => {
            let url = config.redis_url.as_deref().ok_or_else(|| {
                crate::error::TollgateError::service_unavailable(
                    "Redis cache selected but no redis_url configured",
                )
            })?;
            Arc::new(RedisCache::new(url, ttl)?)
        }
        CacheBackend::NoOp => Arc::new(NoOpCache),
    };
    Ok(cache)
}
