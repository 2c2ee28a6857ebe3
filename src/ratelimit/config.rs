use crate::utils::{get_env_with_prefix, parse_env_with_prefix};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Named rate-limit presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    /// Sensitive or expensive operations (checkout, bulk imports)
    Strict,
    /// Read-heavy stat endpoints
    Relaxed,
    /// High-frequency telemetry such as click tracking
    Generous,
}

impl Preset {
    pub const ALL: [Preset; 3] = [Preset::Strict, Preset::Relaxed, Preset::Generous];

    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::Strict => "strict",
            Preset::Relaxed => "relaxed",
            Preset::Generous => "generous",
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maximum requests allowed per window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct PresetLimit {
    pub max_requests: u32,
    pub window_seconds: u64,
}

impl PresetLimit {
    pub const fn new(max_requests: u32, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window_seconds,
        }
    }

    pub const fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, 60)
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_strict")]
    pub strict: PresetLimit,

    #[serde(default = "default_relaxed")]
    pub relaxed: PresetLimit,

    #[serde(default = "default_generous")]
    pub generous: PresetLimit,

    /// Trust `X-Forwarded-For` / `X-Real-IP` for the client identifier.
    ///
    /// Only enable behind a reverse proxy that overwrites these headers,
    /// otherwise clients can pick their own key.
    #[serde(default)]
    pub trust_proxy: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            strict: default_strict(),
            relaxed: default_relaxed(),
            generous: default_generous(),
            trust_proxy: false,
        }
    }
}

impl RateLimitConfig {
    pub fn builder() -> RateLimitConfigBuilder {
        RateLimitConfigBuilder::new()
    }

    pub fn limit_for(&self, preset: Preset) -> PresetLimit {
        match preset {
            Preset::Strict => self.strict,
            Preset::Relaxed => self.relaxed,
            Preset::Generous => self.generous,
        }
    }

    /// Load rate limit configuration from environment variables
    ///
    /// `RATE_LIMIT_STRICT_MAX`, `RATE_LIMIT_STRICT_WINDOW_SECONDS`, and the same
    /// for `RELAXED` and `GENEROUS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(enabled) = get_env_with_prefix("RATE_LIMIT_ENABLED") {
            config.enabled = enabled.parse().unwrap_or(true);
        }

        for preset in Preset::ALL {
            let name = preset.as_str().to_uppercase();
            let slot = match preset {
                Preset::Strict => &mut config.strict,
                Preset::Relaxed => &mut config.relaxed,
                Preset::Generous => &mut config.generous,
            };
            if let Some(max) = parse_env_with_prefix(&format!("RATE_LIMIT_{}_MAX", name)) {
                slot.max_requests = max;
            }
            if let Some(window) =
                parse_env_with_prefix(&format!("RATE_LIMIT_{}_WINDOW_SECONDS", name))
            {
                slot.window_seconds = window;
            }
        }

        if let Some(trust_proxy) = get_env_with_prefix("RATE_LIMIT_TRUST_PROXY") {
            config.trust_proxy = trust_proxy.parse().unwrap_or(false);
        }

        config
    }
}

/// Builder for RateLimitConfig
#[must_use = "builder does nothing until you call build()"]
pub struct RateLimitConfigBuilder {
    config: RateLimitConfig,
}

impl RateLimitConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RateLimitConfig::default(),
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    pub fn preset(mut self, preset: Preset, max_requests: u32, window_seconds: u64) -> Self {
        let limit = PresetLimit::new(max_requests, window_seconds);
        match preset {
            Preset::Strict => self.config.strict = limit,
            Preset::Relaxed => self.config.relaxed = limit,
            Preset::Generous => self.config.generous = limit,
        }
        self
    }

    pub fn trust_proxy(mut self, trust: bool) -> Self {
        self.config.trust_proxy = trust;
        self
    }

    pub fn build(self) -> RateLimitConfig {
        self.config
    }
}

impl Default for RateLimitConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn default_enabled() -> bool {
    true
}

fn default_strict() -> PresetLimit {
    PresetLimit::per_minute(5)
}

fn default_relaxed() -> PresetLimit {
    PresetLimit::per_minute(100)
}

fn default_generous() -> PresetLimit {
    PresetLimit::per_minute(300)
}
