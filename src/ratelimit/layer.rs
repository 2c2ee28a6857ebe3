//! Tower layer applying a preset to every request it wraps.

use super::config::Preset;
use super::limiter::PresetRateLimiter;
use crate::error::TollgateError;
use axum::{
    extract::{ConnectInfo, MatchedPath, Request},
    response::{IntoResponse, Response},
};
use std::{future::Future, net::SocketAddr, pin::Pin, sync::Arc, task::Context, task::Poll};
use tower::{Layer, Service};

/// Apply with `Router::route_layer` so the matched route template is available
/// and `/items/1` and `/items/2` share one counter.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<PresetRateLimiter>,
    preset: Preset,
    trust_proxy: bool,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<PresetRateLimiter>, preset: Preset) -> Self {
        Self {
            limiter,
            preset,
            trust_proxy: false,
        }
    }

    #[must_use]
    pub fn trust_proxy(mut self, trust: bool) -> Self {
        self.trust_proxy = trust;
        self
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            layer: self.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    layer: RateLimitLayer,
}

impl<S> Service<Request> for RateLimitService<S>
where
    S: Service<Request> + Clone + Send + Sync + 'static,
    S::Response: IntoResponse,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let client = client_identifier(&req, self.layer.trust_proxy);
        let route = req
            .extensions()
            .get::<MatchedPath>()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| req.uri().path().to_string());

        match self.layer.limiter.check(&client, &route, self.layer.preset) {
            Ok(()) => {
                let clone = self.inner.clone();
                let mut inner = std::mem::replace(&mut self.inner, clone);
                Box::pin(async move { Ok(inner.call(req).await?.into_response()) })
            }
            Err(retry_after) => {
                tracing::warn!(
                    target: "tollgate::ratelimit",
                    client = %client,
                    route = %route,
                    preset = %self.layer.preset,
                    retry_after,
                    "Request rate limited"
                );
                let response = TollgateError::too_many_requests(
                    format!("Rate limit exceeded. Please try again in {} seconds", retry_after),
                    retry_after,
                )
                .into_response();
                Box::pin(async move { Ok(response) })
            }
        }
    }
}

/// Resolve the client identifier used as half of the limiter key.
///
/// Proxy headers are only consulted when `trust_proxy` is set. Requests with
/// no resolvable address share the `unknown` bucket.
pub fn client_identifier(req: &Request, trust_proxy: bool) -> String {
    let forwarded = if trust_proxy {
        req.headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.split(',').next())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| {
                req.headers()
                    .get("x-real-ip")
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.trim().to_string())
            })
    } else {
        None
    };

    forwarded
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}
