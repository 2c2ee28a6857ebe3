//! Feature gate behavior across tiers, concurrency and store outages.

use async_trait::async_trait;
use std::sync::Arc;
use tollgate::billing::{
    Feature, FeatureGate, IncrementOutcome, InMemoryStore, LimitTable, Subscription,
    SubscriptionStateStore, SubscriptionStatus, SubscriptionStore, Tier, UsageKey,
    UsageLedgerStore,
};
use tollgate::cache::InMemoryCache;
use tollgate::{ReadThroughCache, Result, TollgateError};

fn gate(store: &InMemoryStore) -> FeatureGate {
    FeatureGate::new(
        SubscriptionStateStore::new(Arc::new(store.clone())),
        Arc::new(store.clone()),
    )
}

async fn subscribe(store: &InMemoryStore, subject: &str, tier: Tier, status: SubscriptionStatus) {
    let now = chrono::Utc::now().timestamp();
    let written = store
        .compare_and_swap(
            None,
            &Subscription {
                subject_id: subject.to_string(),
                tier,
                status,
                provider_customer_id: Some(format!("cus_{subject}")),
                provider_subscription_id: Some(format!("sub_{subject}")),
                current_period_start: now - 86_400,
                current_period_end: now + 29 * 86_400,
                cancel_at_period_end: false,
                last_event_at: now,
                version: 1,
                updated_at: now,
            },
        )
        .await
        .unwrap();
    assert!(written);
}

/// Fails every read and write.
struct OfflineStore;

fn offline<T>() -> Result<T> {
    Err(TollgateError::store_unavailable("connection refused"))
}

#[async_trait]
impl SubscriptionStore for OfflineStore {
    async fn get_subscription(&self, _subject_id: &str) -> Result<Option<Subscription>> {
        offline()
    }

    async fn find_by_provider_subscription_id(&self, _id: &str) -> Result<Option<Subscription>> {
        offline()
    }

    async fn find_by_provider_customer_id(&self, _id: &str) -> Result<Option<Subscription>> {
        offline()
    }

    async fn compare_and_swap(
        &self,
        _expected_version: Option<u64>,
        _subscription: &Subscription,
    ) -> Result<bool> {
        offline()
    }
}

#[async_trait]
impl UsageLedgerStore for OfflineStore {
    async fn try_increment(
        &self,
        _key: &UsageKey,
        _limit: u64,
        _period_end: i64,
    ) -> Result<IncrementOutcome> {
        offline()
    }

    async fn record_usage(&self, _key: &UsageKey, _period_end: i64) -> Result<u64> {
        offline()
    }

    async fn get_count(&self, _key: &UsageKey) -> Result<u64> {
        offline()
    }

    async fn purge_expired_counters(&self, _now: i64) -> Result<u64> {
        offline()
    }
}

#[tokio::test]
async fn test_free_tier_daily_limit() {
    let store = InMemoryStore::new();
    let gate = gate(&store);

    for expected_remaining in [2, 1, 0] {
        let decision = gate
            .check_and_record_usage("user_free", "comparisons_daily")
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, Some(expected_remaining));
    }

    let denied = gate
        .check_and_record_usage("user_free", "comparisons_daily")
        .await
        .unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.remaining, Some(0));
    assert_eq!(
        denied.message.as_deref(),
        Some("You've reached the free plan limit of 3 comparisons today. Upgrade for more.")
    );
}

#[tokio::test]
async fn test_subjects_have_independent_quotas() {
    let store = InMemoryStore::new();
    let gate = gate(&store);

    let first = gate.check_and_record_usage("a", "exports_monthly").await.unwrap();
    assert!(first.allowed);
    assert!(!gate.check_and_record_usage("a", "exports_monthly").await.unwrap().allowed);
    assert!(gate.check_and_record_usage("b", "exports_monthly").await.unwrap().allowed);
}

#[tokio::test]
async fn test_pro_subscription_raises_limit() {
    let store = InMemoryStore::new();
    subscribe(&store, "user_pro", Tier::Pro, SubscriptionStatus::Active).await;
    let gate = gate(&store);

    let decision = gate
        .check_and_record_usage("user_pro", "exports_monthly")
        .await
        .unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.remaining, Some(24));
}

#[tokio::test]
async fn test_past_due_keeps_paid_limits() {
    let store = InMemoryStore::new();
    subscribe(&store, "user_late", Tier::Pro, SubscriptionStatus::PastDue).await;
    let gate = gate(&store);

    let decision = gate
        .check_and_record_usage("user_late", "comparisons_daily")
        .await
        .unwrap();
    assert_eq!(decision.remaining, Some(49));
}

#[tokio::test]
async fn test_canceled_subscription_falls_back_to_free() {
    let store = InMemoryStore::new();
    subscribe(&store, "user_gone", Tier::Business, SubscriptionStatus::Canceled).await;
    let gate = gate(&store);

    let decision = gate
        .check_and_record_usage("user_gone", "comparisons_daily")
        .await
        .unwrap();
    assert_eq!(decision.remaining, Some(2));
}

#[tokio::test]
async fn test_unlimited_tier_always_allowed() {
    let store = InMemoryStore::new();
    subscribe(&store, "user_biz", Tier::Business, SubscriptionStatus::Active).await;
    let gate = gate(&store);

    for _ in 0..20 {
        let decision = gate
            .check_and_record_usage("user_biz", "exports_monthly")
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, None);
    }
}

#[tokio::test]
async fn test_unknown_feature_is_bad_request() {
    let store = InMemoryStore::new();
    let err = gate(&store)
        .check_and_record_usage("user", "teleports_daily")
        .await
        .unwrap_err();
    assert!(matches!(err, TollgateError::BadRequest(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_limit_never_exceeded_under_concurrency() {
    let store = InMemoryStore::new();
    let limits = LimitTable::builder()
        .limit(Tier::Free, Feature::SavedSearchesMonthly, 5)
        .build()
        .unwrap();
    let gate = gate(&store).with_limits(limits);

    let mut handles = Vec::new();
    for _ in 0..40 {
        let gate = gate.clone();
        handles.push(tokio::spawn(async move {
            gate.check_and_record_usage("user_race", "saved_searches_monthly")
                .await
                .unwrap()
                .allowed
        }));
    }

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 5);
}

#[tokio::test]
async fn test_store_outage_fails_closed() {
    let gate = FeatureGate::new(
        SubscriptionStateStore::new(Arc::new(OfflineStore)),
        Arc::new(OfflineStore),
    );

    let decision = gate
        .check_and_record_usage("user", "comparisons_daily")
        .await
        .unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.remaining, None);
    assert!(decision.message.is_some());
}

#[tokio::test]
async fn test_summary_reflects_recorded_usage() {
    let store = InMemoryStore::new();
    let cache = ReadThroughCache::new(Arc::new(InMemoryCache::default()));
    let gate = gate(&store).with_cache(cache);

    let before = gate.usage_summary("user_sum").await.unwrap();
    assert_eq!(before.tier, Tier::Free);
    assert!(before.features.iter().all(|f| f.used == 0));

    gate.check_and_record_usage("user_sum", "exports_monthly")
        .await
        .unwrap();

    // The recorded use invalidates the cached summary.
    let after = gate.usage_summary("user_sum").await.unwrap();
    let exports = after
        .features
        .iter()
        .find(|f| f.feature == Feature::ExportsMonthly)
        .unwrap();
    assert_eq!(exports.used, 1);
    assert_eq!(exports.limit, 1);
    assert_eq!(exports.remaining, Some(0));
}
