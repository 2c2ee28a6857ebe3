//! Feature Gate & Usage Ledger.
//!
//! Resolves a subject's limit for a feature from its tier and enforces it with
//! one atomic check-and-increment per (subject, feature, period) counter.

use super::reconcile::Period;
use super::storage::{IncrementOutcome, Subscription, SubscriptionStatus, UsageKey, UsageLedgerStore};
use super::subscription::SubscriptionStateStore;
use super::tiers::{Feature, Limit, LimitTable, QuotaPeriod, Tier};
use crate::cache::ReadThroughCache;
use crate::error::Result;
use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const SECONDS_PER_DAY: i64 = 86_400;

/// Cache TTL for entitlement summaries.
pub const SUMMARY_TTL_SECONDS: u64 = 30;

/// Cache key for a subject's entitlement summary.
pub fn summary_cache_key(subject_id: &str) -> String {
    format!("entitlements:{}", subject_id)
}

/// Result of a usage check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Uses left in the period after this one. `None` for unlimited features.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
}

impl UsageDecision {
    fn allowed(remaining: Option<u64>) -> Self {
        Self {
            allowed: true,
            message: None,
            remaining,
        }
    }

    fn denied(message: String, remaining: Option<u64>) -> Self {
        Self {
            allowed: false,
            message: Some(message),
            remaining,
        }
    }
}

/// Per-feature line of an entitlement summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureUsage {
    pub feature: Feature,
    /// `-1` for unlimited.
    pub limit: i64,
    pub used: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
}

/// A subject's tier and current usage of every gated feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementSummary {
    pub tier: Tier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SubscriptionStatus>,
    pub features: Vec<FeatureUsage>,
}

/// Gates feature usage against tier limits.
#[derive(Clone)]
pub struct FeatureGate {
    subscriptions: SubscriptionStateStore,
    ledger: Arc<dyn UsageLedgerStore>,
    limits: LimitTable,
    cache: Option<ReadThroughCache>,
}

impl FeatureGate {
    #[must_use]
    pub fn new(subscriptions: SubscriptionStateStore, ledger: Arc<dyn UsageLedgerStore>) -> Self {
        Self {
            subscriptions,
            ledger,
            limits: LimitTable::default(),
            cache: None,
        }
    }

    #[must_use]
    pub fn with_limits(mut self, limits: LimitTable) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: ReadThroughCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn limits(&self) -> &LimitTable {
        &self.limits
    }

    /// Check the subject's quota for `feature_key` and record one use if allowed.
    ///
    /// Unknown feature keys are an error. Store failures deny the use.
    pub async fn check_and_record_usage(
        &self,
        subject_id: &str,
        feature_key: &str,
    ) -> Result<UsageDecision> {
        let feature: Feature = feature_key.parse()?;
        let now = Utc::now().timestamp();

        let subscription = match self.subscriptions.get_subscription(subject_id).await {
            Ok(subscription) => subscription,
            Err(e) => return Ok(fail_closed(subject_id, feature, &e)),
        };
        let tier = subscription
            .as_ref()
            .map_or(Tier::Free, Subscription::effective_tier);
        let window = quota_window(feature.period(), subscription.as_ref(), now);
        let key = UsageKey::new(subject_id, feature, window.start);

        let max = match self.limits.limit(tier, feature) {
            Limit::Unlimited => {
                self.record_unlimited(key, window.end);
                return Ok(UsageDecision::allowed(None));
            }
            Limit::Max(max) => max,
        };

        match self.ledger.try_increment(&key, max, window.end).await {
            Ok(IncrementOutcome::Allowed { count }) => {
                self.invalidate_summary(subject_id).await;
                Ok(UsageDecision::allowed(Some(max.saturating_sub(count))))
            }
            Ok(IncrementOutcome::Rejected { .. }) => {
                tracing::debug!(
                    target: "tollgate::usage",
                    subject_id = %subject_id,
                    feature = %feature,
                    tier = %tier,
                    limit = max,
                    "Usage limit reached"
                );
                Ok(UsageDecision::denied(limit_message(tier, feature, max), Some(0)))
            }
            Err(e) => Ok(fail_closed(subject_id, feature, &e)),
        }
    }

    /// Usage for unlimited tiers is recorded off the request path.
    fn record_unlimited(&self, key: UsageKey, period_end: i64) {
        let ledger = Arc::clone(&self.ledger);
        tokio::spawn(async move {
            if let Err(e) = ledger.record_usage(&key, period_end).await {
                tracing::debug!(
                    target: "tollgate::usage",
                    subject_id = %key.subject_id,
                    feature = %key.feature,
                    error = %e,
                    "Could not record unlimited usage"
                );
            }
        });
    }

    /// Tier and current usage for every feature, served through the cache.
    pub async fn usage_summary(&self, subject_id: &str) -> Result<EntitlementSummary> {
        match &self.cache {
            Some(cache) => {
                cache
                    .get_cached(&summary_cache_key(subject_id), SUMMARY_TTL_SECONDS, || {
                        self.compute_summary(subject_id)
                    })
                    .await
            }
            None => self.compute_summary(subject_id).await,
        }
    }

    async fn compute_summary(&self, subject_id: &str) -> Result<EntitlementSummary> {
        let now = Utc::now().timestamp();
        let subscription = self.subscriptions.get_subscription(subject_id).await?;
        let tier = subscription
            .as_ref()
            .map_or(Tier::Free, Subscription::effective_tier);

        let mut features = Vec::with_capacity(Feature::ALL.len());
        for feature in Feature::ALL {
            let window = quota_window(feature.period(), subscription.as_ref(), now);
            let used = self
                .ledger
                .get_count(&UsageKey::new(subject_id, feature, window.start))
                .await?;
            let limit = self.limits.limit(tier, feature);
            features.push(FeatureUsage {
                feature,
                limit: limit.as_raw(),
                used,
                remaining: match limit {
                    Limit::Unlimited => None,
                    Limit::Max(max) => Some(max.saturating_sub(used)),
                },
            });
        }

        Ok(EntitlementSummary {
            tier,
            status: subscription.map(|sub| sub.status),
            features,
        })
    }

    /// Delete counters from finished periods. Returns the number removed.
    pub async fn purge_expired_counters(&self) -> Result<u64> {
        self.ledger
            .purge_expired_counters(Utc::now().timestamp())
            .await
    }

    async fn invalidate_summary(&self, subject_id: &str) {
        if let Some(cache) = &self.cache {
            cache
                .invalidate_key(&summary_cache_key(subject_id))
                .await;
        }
    }
}

fn fail_closed(subject_id: &str, feature: Feature, error: &crate::error::TollgateError) -> UsageDecision {
    tracing::warn!(
        target: "tollgate::usage",
        subject_id = %subject_id,
        feature = %feature,
        error = %error,
        "Entitlement store unavailable, denying usage"
    );
    UsageDecision::denied(
        "Usage could not be verified right now. Please try again shortly.".to_string(),
        None,
    )
}

fn limit_message(tier: Tier, feature: Feature, max: u64) -> String {
    let period = match feature.period() {
        QuotaPeriod::Daily => "today",
        QuotaPeriod::BillingPeriod => "this billing period",
    };
    format!(
        "You've reached the {} plan limit of {} {} {}. Upgrade for more.",
        tier,
        max,
        feature.noun(),
        period
    )
}

/// The quota window containing `now`.
///
/// Daily features use the UTC calendar day. Billing-period features use the
/// subscription's current period while entitled and inside it, otherwise the
/// UTC calendar month.
pub fn quota_window(period: QuotaPeriod, subscription: Option<&Subscription>, now: i64) -> Period {
    match period {
        QuotaPeriod::Daily => utc_day(now),
        QuotaPeriod::BillingPeriod => subscription
            .filter(|sub| {
                sub.status.is_entitled()
                    && sub.current_period_start <= now
                    && now < sub.current_period_end
            })
            .map(|sub| Period {
                start: sub.current_period_start,
                end: sub.current_period_end,
            })
            .unwrap_or_else(|| calendar_month(now)),
    }
}

fn utc_day(now: i64) -> Period {
    let start = now.div_euclid(SECONDS_PER_DAY) * SECONDS_PER_DAY;
    Period {
        start,
        end: start + SECONDS_PER_DAY,
    }
}

fn calendar_month(now: i64) -> Period {
    let start = DateTime::<Utc>::from_timestamp(now, 0)
        .and_then(|dt| NaiveDate::from_ymd_opt(dt.year(), dt.month(), 1))
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc());
    let end = start.and_then(|s| s.checked_add_months(Months::new(1)));

    match (start, end) {
        (Some(start), Some(end)) => Period {
            start: start.timestamp(),
            end: end.timestamp(),
        },
        _ => utc_day(now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::memory::test::UnavailableStore;
    use crate::billing::memory::InMemoryStore;
    use crate::billing::storage::SubscriptionStore;
    use crate::cache::InMemoryCache;
    use crate::traits::Cache;

    fn gate(store: &InMemoryStore) -> FeatureGate {
        FeatureGate::new(
            SubscriptionStateStore::new(Arc::new(store.clone())),
            Arc::new(store.clone()),
        )
    }

    async fn subscribe(store: &InMemoryStore, tier: Tier, status: SubscriptionStatus) {
        let now = Utc::now().timestamp();
        store
            .compare_and_swap(
                None,
                &Subscription {
                    subject_id: "S".to_string(),
                    tier,
                    status,
                    provider_customer_id: Some("cus_1".to_string()),
                    provider_subscription_id: Some("sub_1".to_string()),
                    current_period_start: now - 10,
                    current_period_end: now + 1_000,
                    cancel_at_period_end: false,
                    last_event_at: 0,
                    version: 1,
                    updated_at: 0,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_free_tier_scenario() {
        let store = InMemoryStore::new();
        let gate = gate(&store);

        for expected in [2, 1, 0] {
            let decision = gate.check_and_record_usage("S", "comparisons_daily").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, Some(expected));
        }

        let denied = gate.check_and_record_usage("S", "comparisons_daily").await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.message.unwrap().contains("limit"));
        assert_eq!(denied.remaining, Some(0));
    }

    #[tokio::test]
    async fn test_boundary_with_limit_five() {
        let store = InMemoryStore::new();
        let limits = LimitTable::builder()
            .limit(Tier::Free, Feature::ExportsMonthly, 5)
            .build()
            .unwrap();
        let gate = gate(&store).with_limits(limits);

        for _ in 0..5 {
            assert!(gate.check_and_record_usage("S", "exports_monthly").await.unwrap().allowed);
        }
        assert!(!gate.check_and_record_usage("S", "exports_monthly").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_unlimited_tier_never_denies() {
        let store = InMemoryStore::new();
        subscribe(&store, Tier::Business, SubscriptionStatus::Active).await;
        let gate = gate(&store);

        for _ in 0..100 {
            let decision = gate.check_and_record_usage("S", "comparisons_daily").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, None);
        }
    }

    #[tokio::test]
    async fn test_canceled_subscription_gets_free_limits() {
        let store = InMemoryStore::new();
        subscribe(&store, Tier::Business, SubscriptionStatus::Canceled).await;
        let gate = gate(&store);

        let decision = gate.check_and_record_usage("S", "exports_monthly").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, Some(0));
        assert!(!gate.check_and_record_usage("S", "exports_monthly").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_unknown_feature_is_error() {
        let store = InMemoryStore::new();
        let err = gate(&store)
            .check_and_record_usage("S", "teleports")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_store_outage_denies() {
        let gate = FeatureGate::new(
            SubscriptionStateStore::new(Arc::new(UnavailableStore)),
            Arc::new(UnavailableStore),
        );
        let decision = gate.check_and_record_usage("S", "comparisons_daily").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, None);
    }

    #[tokio::test]
    async fn test_ledger_outage_denies_even_with_subscription() {
        let store = InMemoryStore::new();
        subscribe(&store, Tier::Pro, SubscriptionStatus::Active).await;
        let gate = FeatureGate::new(
            SubscriptionStateStore::new(Arc::new(store.clone())),
            Arc::new(UnavailableStore),
        );
        assert!(!gate.check_and_record_usage("S", "exports_monthly").await.unwrap().allowed);
    }

    #[test]
    fn test_daily_window_is_utc_day() {
        let window = quota_window(QuotaPeriod::Daily, None, 86_400 * 3 + 500);
        assert_eq!(window, Period { start: 86_400 * 3, end: 86_400 * 4 });
    }

    #[test]
    fn test_billing_window_uses_subscription_period() {
        let sub = Subscription {
            subject_id: "S".to_string(),
            tier: Tier::Pro,
            status: SubscriptionStatus::Active,
            provider_customer_id: None,
            provider_subscription_id: None,
            current_period_start: 1_000,
            current_period_end: 2_000,
            cancel_at_period_end: false,
            last_event_at: 0,
            version: 1,
            updated_at: 0,
        };
        assert_eq!(
            quota_window(QuotaPeriod::BillingPeriod, Some(&sub), 1_500),
            Period { start: 1_000, end: 2_000 }
        );
        // Outside the stored period: calendar month.
        let month = quota_window(QuotaPeriod::BillingPeriod, Some(&sub), 1_700_000_000);
        assert!(month.start <= 1_700_000_000 && 1_700_000_000 < month.end);
        assert_eq!(month.start, 1_698_796_800); // 2023-11-01T00:00:00Z
    }

    #[tokio::test]
    async fn test_summary_reflects_usage_and_is_invalidated() {
        let store = InMemoryStore::new();
        let backend = Arc::new(InMemoryCache::default());
        let gate = gate(&store).with_cache(ReadThroughCache::new(backend.clone()));

        let summary = gate.usage_summary("S").await.unwrap();
        assert_eq!(summary.tier, Tier::Free);
        assert!(summary.features.iter().all(|f| f.used == 0));
        assert!(backend.get_bytes("entitlements:S").await.unwrap().is_some());

        gate.check_and_record_usage("S", "comparisons_daily").await.unwrap();
        assert!(backend.get_bytes("entitlements:S").await.unwrap().is_none());

        let summary = gate.usage_summary("S").await.unwrap();
        let comparisons = summary
            .features
            .iter()
            .find(|f| f.feature == Feature::ComparisonsDaily)
            .unwrap();
        assert_eq!(comparisons.used, 1);
        assert_eq!(comparisons.limit, 3);
        assert_eq!(comparisons.remaining, Some(2));
    }

    #[tokio::test]
    async fn test_recorded_use_keeps_other_subjects_cached() {
        let store = InMemoryStore::new();
        let backend = Arc::new(InMemoryCache::default());
        let gate = gate(&store).with_cache(ReadThroughCache::new(backend.clone()));

        gate.usage_summary("S").await.unwrap();
        gate.usage_summary("S2").await.unwrap();
        gate.check_and_record_usage("S", "comparisons_daily").await.unwrap();

        assert!(backend.get_bytes("entitlements:S").await.unwrap().is_none());
        assert!(backend.get_bytes("entitlements:S2").await.unwrap().is_some());
    }
}
