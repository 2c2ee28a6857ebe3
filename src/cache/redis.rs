use crate::error::{Result, TollgateError};
use crate::traits::cache::Cache;
use async_trait::async_trait;
use std::time::Duration;

/// Redis cache backend shared across service instances
#[derive(Clone)]
pub struct RedisCache {
    client: redis::Client,
    default_ttl: Duration,
}

impl RedisCache {
    pub fn new(url: &str, default_ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| TollgateError::internal(format!("Failed to create Redis client: {}", e)))?;

        Ok(Self {
            client,
            default_ttl,
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TollgateError::internal(format!("Failed to get Redis connection: {}", e)))
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;

        redis::cmd("GET")
            .arg(key)
            .query_async::<Option<Vec<u8>>>(&mut conn)
            .await
            .map_err(|e| TollgateError::internal(format!("Redis GET failed: {}", e)))
    }

    async fn set_bytes(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection().await?;
        let ttl_secs = ttl.unwrap_or(self.default_ttl).as_secs().max(1);

        redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_secs)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| TollgateError::internal(format!("Redis SETEX failed: {}", e)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;

        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| TollgateError::internal(format!("Redis DEL failed: {}", e)))
    }

    async fn delete_matching(&self, pattern: &str) -> Result<u64> {
        let mut conn = self.connection().await?;
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await
                .map_err(|e| TollgateError::internal(format!("Redis SCAN failed: {}", e)))?;

            if !keys.is_empty() {
                removed += redis::cmd("DEL")
                    .arg(&keys)
                    .query_async::<u64>(&mut conn)
                    .await
                    .map_err(|e| TollgateError::internal(format!("Redis DEL failed: {}", e)))?;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(removed)
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.connection().await?;

        redis::cmd("FLUSHDB")
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| TollgateError::internal(format!("Redis FLUSHDB failed: {}", e)))
    }

    fn is_healthy(&self) -> bool {
        self.client.get_connection().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::cache::CacheExt;

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_pattern_invalidation() {
        let cache = RedisCache::new("redis://127.0.0.1/", Duration::from_secs(60)).unwrap();

        cache.set("entitlements:S", &"pro", None).await.unwrap();
        cache.set("entitlements:T", &"free", None).await.unwrap();

        assert_eq!(cache.delete_matching("entitlements:S*").await.unwrap(), 1);
        assert_eq!(cache.get::<String>("entitlements:S").await.unwrap(), None);
        assert_eq!(
            cache.get::<String>("entitlements:T").await.unwrap(),
            Some("free".to_string())
        );
    }
}
