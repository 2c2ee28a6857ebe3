use crate::app::AppContext;
use crate::http::handlers;
use crate::ratelimit::{Preset, PresetRateLimiter, RateLimitLayer};
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

/// Trait for composable route modules
///
/// Implement this trait to create modular, reusable route groups.
/// Each module can register its own routes and be composed into the host router.
///
/// # Example
///
/// ```ignore
/// struct PricingModule;
///
/// impl RouteModule for PricingModule {
///     fn routes(&self) -> Router<AppContext> {
///         Router::new().route("/pricing", get(list_tiers))
///     }
/// }
/// ```
pub trait RouteModule {
    /// Returns a router with all routes for this module
    ///
    /// The router should NOT have state applied. Handlers use
    /// `State<AppContext>` and the state is provided once the modules are merged.
    fn routes(&self) -> Router<AppContext>
    where
        Self: Sized;

    /// Optional: specify a path prefix for all routes in this module
    fn prefix(&self) -> Option<&str> {
        None
    }

    /// Registers this module's routes into the application router
    fn register(self, router: Router<AppContext>) -> Router<AppContext>
    where
        Self: Sized,
    {
        let routes = self.routes();

        if let Some(prefix) = self.prefix() {
            router.nest(prefix, routes)
        } else {
            router.merge(routes)
        }
    }
}

/// Webhook, checkout, portal, usage and entitlement endpoints.
///
/// Session endpoints use the `strict` preset, usage and entitlement reads use
/// `relaxed`. The webhook endpoint is never rate limited.
pub struct EntitlementRoutes {
    limiter: Arc<PresetRateLimiter>,
    trust_proxy: bool,
}

impl EntitlementRoutes {
    pub fn new(context: &AppContext) -> Self {
        Self {
            limiter: context.rate_limiter.clone(),
            trust_proxy: context.trust_proxy,
        }
    }

    /// Build the routes with `context` applied as state.
    pub fn router(context: AppContext) -> Router {
        Self::new(&context).routes().with_state(context)
    }

    fn layer(&self, preset: Preset) -> RateLimitLayer {
        RateLimitLayer::new(self.limiter.clone(), preset).trust_proxy(self.trust_proxy)
    }
}

impl RouteModule for EntitlementRoutes {
    fn routes(&self) -> Router<AppContext> {
        let webhooks = Router::new().route("/webhooks/payments", post(handlers::payment_webhook));

        let sessions = Router::new()
            .route("/billing/checkout", post(handlers::create_checkout))
            .route("/billing/portal", post(handlers::create_portal))
            .route_layer(self.layer(Preset::Strict));

        let usage = Router::new()
            .route("/usage/check", post(handlers::check_usage))
            .route("/billing/entitlements", get(handlers::entitlements))
            .route_layer(self.layer(Preset::Relaxed));

        webhooks.merge(sessions).merge(usage)
    }
}
