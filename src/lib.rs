//! Tollgate - subscription entitlements and usage quotas for axum services
//!
//! Tollgate keeps a local copy of each subject's subscription in sync with a
//! payment provider through signed webhooks, opens hosted checkout and portal
//! sessions, and decides whether a subject may use a metered feature right now.
//!
//! # Features
//!
//! - **Webhooks**: Signature-verified, idempotent, out-of-order safe reconciliation
//! - **Quotas**: Per-tier daily and billing-period limits with atomic counters
//! - **Sessions**: Checkout and billing portal sessions with coupon validation
//! - **Rate limiting**: Named presets keyed by client and route
//! - **Caching**: Read-through cache with in-memory and Redis backends
//! - **Database**: SeaORM stores and migrations
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use tollgate::{AppContext, ConfigBuilder, EntitlementRoutes};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     tollgate::init_tracing();
//!
//!     let config = ConfigBuilder::new().from_env().build()?;
//!     let context = AppContext::builder().with_config(&config)?.build()?;
//!
//!     // An authentication layer in front of these routes inserts a `SubjectId`.
//!     let app = EntitlementRoutes::router(context);
//!
//!     let listener = tokio::net::TcpListener::bind(config.server.addr()?).await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

#![allow(async_fn_in_trait)] // CacheExt is only used on concrete backends

mod app;
pub mod billing;
pub mod cache;
mod config;
mod error;
pub mod http;
pub mod ratelimit;
pub mod traits;
pub mod utils;
pub mod validation;

// Re-exports for public API
pub use app::{AppContext, AppContextBuilder, MaintenanceReport};
pub use config::{Config, ConfigBuilder, LoggingConfig, ServerConfig};
pub use error::{ErrorResponse, Result, TollgateError};
pub use http::{AuthenticatedSubject, EntitlementRoutes, RouteModule, SubjectId};
pub use ratelimit::{Preset, RateLimitConfig, RateLimitConfigBuilder};
pub use cache::{CacheConfig, ReadThroughCache};
pub use traits::cache::{Cache, CacheExt};
pub use validation::{ValidatedJson, validate_json, validator};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// Call this early in main(), before building the [`AppContext`].
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "tollgate::webhook=debug")
/// - `TOLLGATE_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("TOLLGATE_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialize tracing with a custom configuration
pub fn init_tracing_with_config(config: &Config) {
    let env_filter = EnvFilter::new(&config.logging.level);

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
