//! In-memory cache backed by moka
//!
//! Bounded TinyLFU cache with per-entry TTL. Suitable for a single instance;
//! use Redis when several instances must share invalidations.

use crate::error::Result;
use crate::traits::cache::{Cache, matches_pattern};
use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache as MokaCache;
use std::time::{Duration, Instant};

const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Clone)]
struct CacheEntry {
    value: Vec<u8>,
    ttl: Option<Duration>,
}

/// Per-entry TTL. Reads never extend an entry's life.
struct EntryExpiry {
    default_ttl: Duration,
}

impl Expiry<String, CacheEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl.unwrap_or(self.default_ttl))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl.unwrap_or(self.default_ttl))
    }
}

/// In-memory cache implementation backed by moka
///
/// ```rust,ignore
/// use tollgate::cache::InMemoryCache;
/// use tollgate::traits::CacheExt;
///
/// let cache = InMemoryCache::new(10_000);
/// cache.set("entitlements:org_1", &summary, Some(Duration::from_secs(30))).await?;
/// ```
#[derive(Clone)]
pub struct InMemoryCache {
    inner: MokaCache<String, CacheEntry>,
}

impl InMemoryCache {
    pub fn new(max_entries: u64) -> Self {
        Self::with_ttl(max_entries, DEFAULT_TTL)
    }

    pub fn with_ttl(max_entries: u64, default_ttl: Duration) -> Self {
        let inner = MokaCache::builder()
            .max_capacity(max_entries)
            .expire_after(EntryExpiry { default_ttl })
            .build();

        Self { inner }
    }

    pub fn builder() -> InMemoryCacheBuilder {
        InMemoryCacheBuilder::new()
    }

    /// Force pending eviction and expiration work to run now.
    pub async fn run_pending_tasks(&self) {
        self.inner.run_pending_tasks().await;
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[must_use = "builder does nothing until you call build()"]
pub struct InMemoryCacheBuilder {
    max_entries: u64,
    default_ttl: Duration,
}

impl InMemoryCacheBuilder {
    pub fn new() -> Self {
        Self {
            max_entries: 10_000,
            default_ttl: DEFAULT_TTL,
        }
    }

    pub fn max_entries(mut self, max: u64) -> Self {
        self.max_entries = max;
        self
    }

    pub fn time_to_live(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn build(self) -> InMemoryCache {
        InMemoryCache::with_ttl(self.max_entries, self.default_ttl)
    }
}

impl Default for InMemoryCacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.get(key).await.map(|entry| entry.value))
    }

    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.inner
            .insert(key.to_string(), CacheEntry { value, ttl })
            .await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.remove(key).await;
        Ok(())
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        let keys: Vec<String> = self
            .inner
            .iter()
            .filter(|(key, _)| matches_pattern(pattern, key))
            .map(|(key, _)| key.as_ref().clone())
            .collect();

        for key in &keys {
            self.inner.invalidate(key).await;
        }
        Ok(keys.len() as u64)
    }

    async fn clear(&self) -> Result<()> {
        self.inner.invalidate_all();
        self.inner.run_pending_tasks().await;
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        true
    }
}
