//! In-memory implementation of the billing storage traits.

use super::storage::{
    Coupon, CouponStore, EventOutcome, IncrementOutcome, Subscription, SubscriptionStore,
    UsageCounter, UsageKey, UsageLedgerStore, WebhookEventRecord, WebhookLedger,
};
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

/// Store backed by sharded concurrent maps.
///
/// Atomic per key: compare-and-swap and check-and-increment both run under
/// the map's entry lock. Wraps data in Arc for cheap cloning.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    subscriptions: DashMap<String, Subscription>,
    events: DashMap<String, WebhookEventRecord>,
    counters: DashMap<UsageKey, UsageCounter>,
    coupons: DashMap<String, Coupon>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a coupon in the catalog.
    pub fn insert_coupon(&self, coupon: Coupon) {
        self.inner.coupons.insert(coupon.code.clone(), coupon);
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    #[must_use]
    pub fn event_count(&self) -> usize {
        self.inner.events.len()
    }

    #[must_use]
    pub fn counter_count(&self) -> usize {
        self.inner.counters.len()
    }

    fn find_subscription(&self, predicate: impl Fn(&Subscription) -> bool) -> Option<Subscription> {
        self.inner
            .subscriptions
            .iter()
            .find(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryStore {
    async fn get_subscription(&self, subject_id: &str) -> Result<Option<Subscription>> {
        Ok(self
            .inner
            .subscriptions
            .get(subject_id)
            .map(|s| s.value().clone()))
    }

    async fn find_by_provider_subscription_id(
        &self,
        provider_subscription_id: &str,
    ) -> Result<Option<Subscription>> {
        Ok(self.find_subscription(|s| {
            s.provider_subscription_id.as_deref() == Some(provider_subscription_id)
        }))
    }

    async fn find_by_provider_customer_id(
        &self,
        provider_customer_id: &str,
    ) -> Result<Option<Subscription>> {
        Ok(self.find_subscription(|s| {
            s.provider_customer_id.as_deref() == Some(provider_customer_id)
        }))
    }

    async fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        subscription: &Subscription,
    ) -> Result<bool> {
        match self.inner.subscriptions.entry(subscription.subject_id.clone()) {
            Entry::Vacant(slot) => {
                if expected_version.is_some() {
                    return Ok(false);
                }
                slot.insert(subscription.clone());
                Ok(true)
            }
            Entry::Occupied(mut slot) => {
                if expected_version != Some(slot.get().version) {
                    return Ok(false);
                }
                slot.insert(subscription.clone());
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl WebhookLedger for InMemoryStore {
    async fn record_received(
        &self,
        provider_event_id: &str,
        event_type: &str,
        received_at: i64,
    ) -> Result<WebhookEventRecord> {
        let record = self
            .inner
            .events
            .entry(provider_event_id.to_string())
            .or_insert_with(|| WebhookEventRecord {
                provider_event_id: provider_event_id.to_string(),
                event_type: event_type.to_string(),
                received_at,
                processed_at: None,
                outcome: None,
            });
        Ok(record.value().clone())
    }

    async fn get_event(&self, provider_event_id: &str) -> Result<Option<WebhookEventRecord>> {
        Ok(self
            .inner
            .events
            .get(provider_event_id)
            .map(|r| r.value().clone()))
    }

    async fn record_outcome(
        &self,
        provider_event_id: &str,
        outcome: EventOutcome,
        at: i64,
    ) -> Result<()> {
        let mut record = self
            .inner
            .events
            .entry(provider_event_id.to_string())
            .or_insert_with(|| WebhookEventRecord {
                provider_event_id: provider_event_id.to_string(),
                event_type: String::new(),
                received_at: at,
                processed_at: None,
                outcome: None,
            });
        if record.is_processed() {
            return Ok(());
        }
        record.outcome = Some(outcome);
        if outcome.marks_processed() {
            record.processed_at = Some(at);
        }
        Ok(())
    }

    async fn cleanup_processed_events(&self, older_than: i64) -> Result<u64> {
        let mut removed = 0;
        self.inner.events.retain(|_, record| {
            let expired = record.processed_at.is_some_and(|at| at < older_than);
            if expired {
                removed += 1;
            }
            !expired
        });
        Ok(removed)
    }
}

#[async_trait]
impl UsageLedgerStore for InMemoryStore {
    async fn try_increment(
        &self,
        key: &UsageKey,
        limit: u64,
        period_end: i64,
    ) -> Result<IncrementOutcome> {
        let mut counter = self
            .inner
            .counters
            .entry(key.clone())
            .or_insert_with(|| UsageCounter {
                key: key.clone(),
                count: 0,
                period_end,
            });
        if counter.count < limit {
            counter.count += 1;
            Ok(IncrementOutcome::Allowed {
                count: counter.count,
            })
        } else {
            Ok(IncrementOutcome::Rejected {
                count: counter.count,
            })
        }
    }

    async fn record_usage(&self, key: &UsageKey, period_end: i64) -> Result<u64> {
        let mut counter = self
            .inner
            .counters
            .entry(key.clone())
            .or_insert_with(|| UsageCounter {
                key: key.clone(),
                count: 0,
                period_end,
            });
        counter.count += 1;
        Ok(counter.count)
    }

    async fn get_count(&self, key: &UsageKey) -> Result<u64> {
        Ok(self
            .inner
            .counters
            .get(key)
            .map(|c| c.count)
            .unwrap_or(0))
    }

    async fn purge_expired_counters(&self, now: i64) -> Result<u64> {
        let mut removed = 0;
        self.inner.counters.retain(|_, counter| {
            let expired = counter.period_end < now;
            if expired {
                removed += 1;
            }
            !expired
        });
        Ok(removed)
    }
}

#[async_trait]
impl CouponStore for InMemoryStore {
    async fn get_coupon(&self, code: &str) -> Result<Option<Coupon>> {
        Ok(self.inner.coupons.get(code).map(|c| c.value().clone()))
    }
}

/// Store doubles for tests.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use crate::error::TollgateError;

    /// Store whose every call fails with `StoreUnavailable`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct UnavailableStore;

    fn unavailable<T>() -> Result<T> {
        Err(TollgateError::store_unavailable("store offline"))
    }

    #[async_trait]
    impl SubscriptionStore for UnavailableStore {
        async fn get_subscription(&self, _subject_id: &str) -> Result<Option<Subscription>> {
            unavailable()
        }

        async fn find_by_provider_subscription_id(
            &self,
            _id: &str,
        ) -> Result<Option<Subscription>> {
            unavailable()
        }

        async fn find_by_provider_customer_id(&self, _id: &str) -> Result<Option<Subscription>> {
            unavailable()
        }

        async fn compare_and_swap(
            &self,
            _expected_version: Option<u64>,
            _subscription: &Subscription,
        ) -> Result<bool> {
            unavailable()
        }
    }

    #[async_trait]
    impl WebhookLedger for UnavailableStore {
        async fn record_received(
            &self,
            _id: &str,
            _event_type: &str,
            _received_at: i64,
        ) -> Result<WebhookEventRecord> {
            unavailable()
        }

        async fn get_event(&self, _id: &str) -> Result<Option<WebhookEventRecord>> {
            unavailable()
        }

        async fn record_outcome(&self, _id: &str, _outcome: EventOutcome, _at: i64) -> Result<()> {
            unavailable()
        }

        async fn cleanup_processed_events(&self, _older_than: i64) -> Result<u64> {
            unavailable()
        }
    }

    #[async_trait]
    impl UsageLedgerStore for UnavailableStore {
        async fn try_increment(
            &self,
            _key: &UsageKey,
            _limit: u64,
            _period_end: i64,
        ) -> Result<IncrementOutcome> {
            unavailable()
        }

        async fn record_usage(&self, _key: &UsageKey, _period_end: i64) -> Result<u64> {
            unavailable()
        }

        async fn get_count(&self, _key: &UsageKey) -> Result<u64> {
            unavailable()
        }

        async fn purge_expired_counters(&self, _now: i64) -> Result<u64> {
            unavailable()
        }
    }

    #[async_trait]
    impl CouponStore for UnavailableStore {
        async fn get_coupon(&self, _code: &str) -> Result<Option<Coupon>> {
            unavailable()
        }
    }
}
