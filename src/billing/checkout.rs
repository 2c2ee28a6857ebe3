//! Checkout session creation.
//!
//! Validates the request and builds the provider call. No local state changes:
//! the subscription row appears when `checkout.session.completed` arrives.

use super::client::{CheckoutProvider, CheckoutSession, CreateCheckoutSessionRequest};
use super::error::{BillingError, CouponRejection};
use super::storage::CouponStore;
use super::subscription::SubscriptionStateStore;
use super::tiers::{BillingInterval, PriceTable, Tier};
use crate::error::Result;
use serde::Deserialize;
use std::sync::Arc;
use url::Url;
use validator::Validate;

/// Configuration for checkout sessions.
#[derive(Debug, Clone, Default)]
pub struct CheckoutConfig {
    pub success_url: String,
    pub cancel_url: String,
    /// Allowed redirect domains. Empty means any https host.
    pub allowed_redirect_domains: Vec<String>,
    pub allow_promotion_codes: bool,
}

impl CheckoutConfig {
    #[must_use]
    pub fn new(success_url: impl Into<String>, cancel_url: impl Into<String>) -> Self {
        Self {
            success_url: success_url.into(),
            cancel_url: cancel_url.into(),
            ..Self::default()
        }
    }

    /// Set allowed redirect domains.
    ///
    /// When set, only these domains (and their subdomains) are accepted.
    #[must_use]
    pub fn allowed_redirect_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_redirect_domains = domains.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn allow_promotion_codes(mut self, allow: bool) -> Self {
        self.allow_promotion_codes = allow;
        self
    }

    /// Validate a success, cancel or return URL.
    ///
    /// The URL must use https (plain http only for localhost) and, when an
    /// allowlist is configured, point at an allowed domain or subdomain.
    pub fn validate_redirect_url(&self, url: &str) -> std::result::Result<(), BillingError> {
        let invalid = |reason: &str| BillingError::InvalidRedirectUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let parsed = Url::parse(url).map_err(|e| invalid(&e.to_string()))?;
        let host = parsed.host_str().ok_or_else(|| invalid("missing host"))?;
        let local = matches!(host, "localhost" | "127.0.0.1" | "[::1]");

        match parsed.scheme() {
            "https" => {}
            "http" if local => {}
            _ => return Err(invalid("must use https")),
        }

        if !self.allowed_redirect_domains.is_empty() {
            let allowed = self.allowed_redirect_domains.iter().any(|domain| {
                host == domain || host.ends_with(&format!(".{}", domain))
            });
            if !allowed {
                return Err(BillingError::RedirectDomainNotAllowed {
                    domain: host.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Checkout request body.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    #[validate(length(min = 1, max = 255, message = "subjectId is required"))]
    pub subject_id: String,
    #[validate(email(message = "email must be a valid address"))]
    pub email: String,
    #[validate(length(min = 1, message = "tier is required"))]
    pub tier: String,
    #[validate(length(min = 1, message = "interval is required"))]
    pub interval: String,
    #[validate(range(min = 1, max = 730))]
    pub trial_days: Option<u32>,
    #[validate(length(min = 1, max = 64))]
    pub coupon_code: Option<String>,
    /// Overrides the configured success URL.
    pub success_url: Option<String>,
    /// Overrides the configured cancel URL.
    pub cancel_url: Option<String>,
}

/// Checkout/Portal Session Factory, checkout half.
pub struct CheckoutManager {
    subscriptions: SubscriptionStateStore,
    coupons: Arc<dyn CouponStore>,
    client: Option<Arc<dyn CheckoutProvider>>,
    prices: PriceTable,
    config: CheckoutConfig,
}

impl CheckoutManager {
    #[must_use]
    pub fn new(
        subscriptions: SubscriptionStateStore,
        coupons: Arc<dyn CouponStore>,
        prices: PriceTable,
        config: CheckoutConfig,
    ) -> Self {
        Self {
            subscriptions,
            coupons,
            client: None,
            prices,
            config,
        }
    }

    #[must_use]
    pub fn with_client(mut self, client: Arc<dyn CheckoutProvider>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn config(&self) -> &CheckoutConfig {
        &self.config
    }

    /// Create a hosted checkout session for a paid tier.
    pub async fn create_checkout_session(&self, request: CheckoutRequest) -> Result<CheckoutSession> {
        request.validate()?;

        let tier: Tier = request.tier.parse()?;
        if !tier.is_purchasable() {
            return Err(BillingError::InvalidTier { tier: request.tier }.into());
        }
        let interval: BillingInterval = request.interval.parse()?;

        let success_url = request
            .success_url
            .unwrap_or_else(|| self.config.success_url.clone());
        let cancel_url = request
            .cancel_url
            .unwrap_or_else(|| self.config.cancel_url.clone());
        self.config.validate_redirect_url(&success_url)?;
        self.config.validate_redirect_url(&cancel_url)?;

        let provider_coupon_id = match &request.coupon_code {
            Some(code) => Some(self.redeemable_coupon(code).await?),
            None => None,
        };

        let client = self
            .client
            .as_ref()
            .ok_or_else(|| BillingError::ProviderNotConfigured {
                what: "payment client".to_string(),
            })?;
        let price_id = self
            .prices
            .price_for(tier, interval)
            .ok_or_else(|| BillingError::ProviderNotConfigured {
                what: format!("price for {} {}", tier, interval),
            })?
            .to_string();

        // Reuse the customer from a previous (possibly canceled) subscription.
        let customer_id = self
            .subscriptions
            .get_subscription(&request.subject_id)
            .await?
            .and_then(|sub| sub.provider_customer_id);

        let session = client
            .create_checkout_session(CreateCheckoutSessionRequest {
                subject_id: request.subject_id.clone(),
                email: request.email,
                customer_id,
                price_id,
                tier,
                interval,
                success_url,
                cancel_url,
                trial_period_days: request.trial_days,
                provider_coupon_id,
                allow_promotion_codes: self.config.allow_promotion_codes,
            })
            .await
            .inspect_err(|e| {
                tracing::error!(
                    subject_id = %request.subject_id,
                    error = %e,
                    "Checkout session creation failed"
                );
            })?;

        tracing::info!(
            subject_id = %request.subject_id,
            session_id = %session.session_id,
            tier = %tier,
            interval = %interval,
            "Checkout session created"
        );
        Ok(session)
    }

    async fn redeemable_coupon(&self, code: &str) -> Result<String> {
        let rejected = |reason| BillingError::InvalidCoupon {
            code: code.to_string(),
            reason,
        };

        let coupon = self
            .coupons
            .get_coupon(code)
            .await?
            .ok_or_else(|| rejected(CouponRejection::Unknown))?;

        match coupon.rejection(chrono::Utc::now().timestamp()) {
            Some(reason) => Err(rejected(reason).into()),
            None => Ok(coupon.provider_coupon_id),
        }
    }
}
