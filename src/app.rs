use std::sync::Arc;
use std::time::Duration;

use crate::billing::client::{CheckoutProvider, PortalProvider};
use crate::billing::{
    BillingConfig, CheckoutManager, CouponStore, FeatureGate, InMemoryStore, LimitTable,
    OperatorChannel, PortalManager, SubscriptionStateStore, SubscriptionStore, TracingOperatorChannel,
    UsageLedgerStore, WebhookLedger, WebhookReconciler,
};
use crate::cache::{CacheConfig, InMemoryCache, ReadThroughCache, build_cache};
use crate::config::Config;
use crate::error::Result;
use crate::ratelimit::{PresetRateLimiter, RateLimitConfig};
use crate::traits::cache::Cache;

/// Shared state for every handler.
///
/// All members are cheap to clone and safe to use from concurrent requests.
#[derive(Clone)]
pub struct AppContext {
    pub subscriptions: SubscriptionStateStore,
    pub reconciler: Arc<WebhookReconciler>,
    pub checkout: Arc<CheckoutManager>,
    pub portal: Arc<PortalManager>,
    pub gate: FeatureGate,
    pub cache: ReadThroughCache,
    pub rate_limiter: Arc<PresetRateLimiter>,
    /// Trust proxy headers when deriving the rate-limit client identifier.
    pub trust_proxy: bool,
}

impl AppContext {
    pub fn builder() -> AppContextBuilder {
        AppContextBuilder::new()
    }

    /// Run one maintenance pass.
    ///
    /// Deletes processed webhook rows older than `retention`, purges counters of
    /// finished quota periods and evicts idle rate-limit keys.
    pub async fn run_maintenance(&self, retention: Duration) -> Result<MaintenanceReport> {
        let now = chrono::Utc::now().timestamp();
        let retention = i64::try_from(retention.as_secs()).unwrap_or(i64::MAX);

        let events_removed = self
            .reconciler
            .cleanup_processed_events(now.saturating_sub(retention))
            .await?;
        let counters_removed = self.gate.purge_expired_counters().await?;
        self.rate_limiter.evict_stale();

        tracing::info!(
            events_removed,
            counters_removed,
            rate_limit_keys = self.rate_limiter.tracked_keys(),
            "Maintenance pass completed"
        );

        Ok(MaintenanceReport {
            events_removed,
            counters_removed,
        })
    }

    /// Spawn a task running [`run_maintenance`](Self::run_maintenance) every `every`.
    pub fn spawn_maintenance(
        &self,
        every: Duration,
        retention: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let context = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = context.run_maintenance(retention).await {
                    tracing::warn!(error = %e, "Maintenance pass failed");
                }
            }
        })
    }
}

/// Rows removed by one maintenance pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub events_removed: u64,
    pub counters_removed: u64,
}

/// Builder for AppContext with fluent API
///
/// Every store defaults to one shared [`InMemoryStore`] and the cache to a
/// moka-backed [`InMemoryCache`].
#[must_use = "builder does nothing until you call build()"]
pub struct AppContextBuilder {
    subscription_store: Arc<dyn SubscriptionStore>,
    webhook_ledger: Arc<dyn WebhookLedger>,
    usage_ledger: Arc<dyn UsageLedgerStore>,
    coupons: Arc<dyn CouponStore>,
    cache: Option<Arc<dyn Cache>>,
    cache_config: CacheConfig,
    checkout_provider: Option<Arc<dyn CheckoutProvider>>,
    portal_provider: Option<Arc<dyn PortalProvider>>,
    operator: Arc<dyn OperatorChannel>,
    billing: BillingConfig,
    limits: LimitTable,
    rate_limit: RateLimitConfig,
}

impl AppContextBuilder {
    pub fn new() -> Self {
        let store = InMemoryStore::new();
        Self {
            subscription_store: Arc::new(store.clone()),
            webhook_ledger: Arc::new(store.clone()),
            usage_ledger: Arc::new(store.clone()),
            coupons: Arc::new(store),
            cache: None,
            cache_config: CacheConfig::default(),
            checkout_provider: None,
            portal_provider: None,
            operator: Arc::new(TracingOperatorChannel),
            billing: BillingConfig::default(),
            limits: LimitTable::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }

    /// Apply the billing, cache and rate-limit sections of `config`.
    ///
    /// With the `billing-live` feature and a configured secret key, the live
    /// provider client is installed as well.
    pub fn with_config(mut self, config: &Config) -> Result<Self> {
        self.billing = config.billing.clone();
        self.cache_config = config.cache.clone();
        self.rate_limit = config.rate_limit.clone();

        #[cfg(feature = "billing-live")]
        if let Some(key) = &config.billing.secret_key {
            let client = crate::billing::LiveStripeClient::with_default_config(key.clone())?;
            self = self.with_payment_provider(client);
        }

        Ok(self)
    }

    /// Use one store for subscriptions, the webhook ledger, usage counters and coupons.
    pub fn with_store<S>(mut self, store: S) -> Self
    where
        S: SubscriptionStore + WebhookLedger + UsageLedgerStore + CouponStore + 'static,
    {
        let store = Arc::new(store);
        self.subscription_store = store.clone();
        self.webhook_ledger = store.clone();
        self.usage_ledger = store.clone();
        self.coupons = store;
        self
    }

    pub fn with_subscription_store(mut self, store: Arc<dyn SubscriptionStore>) -> Self {
        self.subscription_store = store;
        self
    }

    pub fn with_webhook_ledger(mut self, ledger: Arc<dyn WebhookLedger>) -> Self {
        self.webhook_ledger = ledger;
        self
    }

    pub fn with_usage_ledger(mut self, ledger: Arc<dyn UsageLedgerStore>) -> Self {
        self.usage_ledger = ledger;
        self
    }

    pub fn with_coupon_store(mut self, coupons: Arc<dyn CouponStore>) -> Self {
        self.coupons = coupons;
        self
    }

    /// Set the cache backend. Overrides the configured backend.
    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Set the payment provider client used for both checkout and portal sessions.
    pub fn with_payment_provider<P>(mut self, provider: P) -> Self
    where
        P: CheckoutProvider + PortalProvider + 'static,
    {
        let provider = Arc::new(provider);
        self.checkout_provider = Some(provider.clone());
        self.portal_provider = Some(provider);
        self
    }

    pub fn with_operator_channel(mut self, operator: Arc<dyn OperatorChannel>) -> Self {
        self.operator = operator;
        self
    }

    pub fn with_billing_config(mut self, billing: BillingConfig) -> Self {
        self.billing = billing;
        self
    }

    pub fn with_limits(mut self, limits: LimitTable) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Build the context.
    ///
    /// # Errors
    ///
    /// Fails if a rate-limit preset is zero. A cache backend that cannot be
    /// created falls back to the in-memory cache.
    pub fn build(self) -> Result<AppContext> {
        let backend: Arc<dyn Cache> = match self.cache {
            Some(cache) => cache,
            None => match build_cache(&self.cache_config) {
                Ok(cache) => cache,
                Err(e) => {
                    tracing::warn!(
                        target: "tollgate::cache",
                        error = %e,
                        "Configured cache unavailable, using in-memory"
                    );
                    Arc::new(InMemoryCache::default())
                }
            },
        };
        let cache = ReadThroughCache::new(backend);

        let subscriptions = SubscriptionStateStore::new(self.subscription_store);
        let prices = self.billing.price_table();
        let redirects = self.billing.checkout_config();

        let reconciler = WebhookReconciler::new(subscriptions.clone(), self.webhook_ledger)
            .with_secret(self.billing.webhook_secret.clone())
            .with_tolerance(self.billing.webhook_tolerance_seconds)
            .with_prices(prices.clone())
            .with_operator(self.operator)
            .with_cache(cache.clone())
            .with_ack_policy(self.billing.webhook_ack_policy);

        let mut checkout = CheckoutManager::new(
            subscriptions.clone(),
            self.coupons,
            prices,
            redirects.clone(),
        );
        if let Some(client) = self.checkout_provider {
            checkout = checkout.with_client(client);
        }

        let mut portal = PortalManager::new(
            subscriptions.clone(),
            self.billing.portal_return_url.clone(),
            redirects,
        );
        if let Some(client) = self.portal_provider {
            portal = portal.with_client(client);
        }

        let gate = FeatureGate::new(subscriptions.clone(), self.usage_ledger)
            .with_limits(self.limits)
            .with_cache(cache.clone());

        let rate_limiter = Arc::new(PresetRateLimiter::new(&self.rate_limit)?);

        Ok(AppContext {
            subscriptions,
            reconciler: Arc::new(reconciler),
            checkout: Arc::new(checkout),
            portal: Arc::new(portal),
            gate,
            cache,
            rate_limiter,
            trust_proxy: self.rate_limit.trust_proxy,
        })
    }
}

impl Default for AppContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
