use crate::utils::{get_env_with_prefix, parse_env_with_prefix};
use serde::{Deserialize, Serialize};

/// Cache backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    #[default]
    InMemory,
    /// Requires the `cache-redis` feature
    #[cfg(feature = "cache-redis")]
    Redis,
    /// Stores nothing; every read is a miss
    NoOp,
}

/// Cache configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,

    /// Redis connection URL (only used for the Redis backend)
    #[serde(default)]
    pub redis_url: Option<String>,

    /// TTL applied when a caller does not pass one (seconds)
    #[serde(default = "default_ttl_seconds")]
    pub default_ttl_seconds: u64,

    /// Maximum number of entries for the in-memory backend
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            redis_url: None,
            default_ttl_seconds: default_ttl_seconds(),
            max_entries: default_max_entries(),
        }
    }
}

impl CacheConfig {
    /// Load cache configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(backend) = get_env_with_prefix("CACHE_BACKEND") {
            config.backend = match backend.to_lowercase().as_str() {
                "redis" => {
                    #[cfg(feature = "cache-redis")]
                    {
                        CacheBackend::Redis
                    }
                    #[cfg(not(feature = "cache-redis"))]
                    {
                        tracing::warn!(
                            target: "tollgate::cache",
                            "Redis cache requested but cache-redis feature not enabled, using in-memory"
                        );
                        CacheBackend::InMemory
                    }
                }
                "noop" | "none" => CacheBackend::NoOp,
                _ => CacheBackend::InMemory,
            };
        }

        if let Some(url) =
            get_env_with_prefix("CACHE_REDIS_URL").or_else(|| get_env_with_prefix("REDIS_URL"))
        {
            config.redis_url = Some(url);
        }

        if let Some(seconds) = parse_env_with_prefix("CACHE_DEFAULT_TTL_SECONDS") {
            config.default_ttl_seconds = seconds;
        }

        if let Some(entries) = parse_env_with_prefix("CACHE_MAX_ENTRIES") {
            config.max_entries = entries;
        }

        config
    }
}

fn default_ttl_seconds() -> u64 {
    300
}

fn default_max_entries() -> usize {
    10_000
}
