//! Cache trait for key-value storage
//!
//! Backends are swappable (in-memory, Redis, no-op). Callers on the request path
//! go through [`ReadThroughCache`](crate::cache::ReadThroughCache), which absorbs
//! backend failures.

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Cache trait for key-value storage with optional TTL
///
/// Values are opaque bytes so the trait stays object-safe. `CacheExt`
/// adds typed JSON helpers on top.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Returns `Ok(None)` if the key doesn't exist or has expired.
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a value. `None` uses the backend's default TTL.
    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete every key matching a glob pattern where `*` matches any run of characters.
    ///
    /// Returns the number of keys removed.
    async fn delete_matching(&self, pattern: &str) -> Result<u64>;

    /// Clear all values from the cache
    async fn clear(&self) -> Result<()>;

    /// Check if the cache backend is healthy
    fn is_healthy(&self) -> bool;
}

/// Typed JSON helpers for concrete cache backends
pub trait CacheExt: Cache {
    async fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        if let Some(bytes) = self.get_bytes(key).await? {
            serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                crate::error::TollgateError::internal(format!("Failed to deserialize: {}", e))
            })
        } else {
            Ok(None)
        }
    }

    async fn set<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()>
    where
        T: serde::Serialize + Send + Sync,
    {
        let bytes = serde_json::to_vec(value).map_err(|e| {
            crate::error::TollgateError::internal(format!("Failed to serialize: {}", e))
        })?;
        self.set_bytes(key, bytes, ttl).await
    }
}

impl<T: Cache> CacheExt for T {}

/// Glob match supporting only `*`, the subset shared by every backend.
pub fn matches_pattern(pattern: &str, key: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return key.is_empty();
    };
    let Some(mut rest) = key.strip_prefix(first) else {
        return false;
    };

    let segments: Vec<&str> = parts.collect();
    let Some((last, middle)) = segments.split_last() else {
        // No wildcard at all: exact match.
        return rest.is_empty();
    };

    for segment in middle {
        match rest.find(segment) {
            Some(idx) => rest = &rest[idx + segment.len()..],
            None => return false,
        }
    }

    rest.len() >= last.len() && rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_pattern() {
        assert!(matches_pattern("entitlements:S", "entitlements:S"));
        assert!(!matches_pattern("entitlements:S", "entitlements:S2"));
    }

    #[test]
    fn test_trailing_wildcard() {
        assert!(matches_pattern("entitlements:S*", "entitlements:S"));
        assert!(matches_pattern("entitlements:S*", "entitlements:S:features"));
        assert!(!matches_pattern("entitlements:S*", "usage:S"));
    }

    #[test]
    fn test_inner_wildcards() {
        assert!(matches_pattern("stats:*:daily:*", "stats:org_1:daily:2026-01-01"));
        assert!(!matches_pattern("stats:*:daily:*", "stats:org_1:monthly:2026-01"));
        assert!(matches_pattern("*", "anything"));
        assert!(matches_pattern("a*c", "abc"));
        assert!(!matches_pattern("a*c", "ab"));
    }
}
