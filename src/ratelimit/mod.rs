//! Request-admission throttling, independent of subscription entitlements.
//!
//! Named presets map to (max requests, window). Counters are keyed by
//! (client, route) and stale keys are evicted periodically.

mod config;
mod layer;
mod limiter;

pub use config::{Preset, PresetLimit, RateLimitConfig, RateLimitConfigBuilder};
pub use layer::{RateLimitLayer, RateLimitService, client_identifier};
pub use limiter::PresetRateLimiter;
