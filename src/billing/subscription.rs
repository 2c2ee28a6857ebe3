//! Subscription State Store.
//!
//! The read side serves entitlement checks. The write side applies
//! reconciler transitions with optimistic compare-and-swap.

use super::error::BillingError;
use super::reconcile::{next_state, Decision, Target, Transition};
use super::storage::{Subscription, SubscriptionStore};
use super::tiers::Tier;
use crate::error::Result;
use std::sync::Arc;

/// Attempts before a write that keeps losing races gives up.
const MAX_CAS_ATTEMPTS: u32 = 3;

/// Result of applying one event's transition.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum UpsertOutcome {
    /// A new row state was written.
    Applied(Subscription),
    /// The stored row already reflects the event.
    Unchanged { subject_id: String },
    /// The transition's precondition was not met.
    Skipped { reason: String },
    /// The event is older than the newest applied event.
    Stale { subject_id: String },
}

/// Canonical subscription state, shared by the reconciler and the feature gate.
#[derive(Clone)]
pub struct SubscriptionStateStore {
    store: Arc<dyn SubscriptionStore>,
}

impl SubscriptionStateStore {
    #[must_use]
    pub fn new(store: Arc<dyn SubscriptionStore>) -> Self {
        Self { store }
    }

    /// The subject's row, including a canceled one.
    pub async fn get_subscription(&self, subject_id: &str) -> Result<Option<Subscription>> {
        self.store.get_subscription(subject_id).await
    }

    /// The subject's subscription unless it is canceled.
    pub async fn get_active_subscription(&self, subject_id: &str) -> Result<Option<Subscription>> {
        Ok(self
            .store
            .get_subscription(subject_id)
            .await?
            .filter(|sub| !sub.is_canceled()))
    }

    /// Tier that applies to feature limits. Store errors propagate.
    pub async fn tier_of(&self, subject_id: &str) -> Result<Tier> {
        Ok(self
            .store
            .get_subscription(subject_id)
            .await?
            .map_or(Tier::Free, |sub| sub.effective_tier()))
    }

    /// Find the subject an event addresses.
    pub async fn resolve_subject(&self, target: &Target) -> Result<Option<String>> {
        match target {
            Target::Subject(subject_id) => Ok(Some(subject_id.clone())),
            Target::Provider {
                subscription_id,
                customer_id,
                subject_hint,
            } => {
                if let Some(id) = subscription_id {
                    if let Some(sub) = self.store.find_by_provider_subscription_id(id).await? {
                        return Ok(Some(sub.subject_id));
                    }
                }
                if let Some(id) = customer_id {
                    if let Some(sub) = self.store.find_by_provider_customer_id(id).await? {
                        return Ok(Some(sub.subject_id));
                    }
                }
                Ok(subject_hint.clone())
            }
        }
    }

    /// Apply `transition` from an event created at `event_at`.
    ///
    /// Reads the row, computes the next state and writes it with
    /// compare-and-swap, retrying when a concurrent writer wins.
    pub async fn upsert_from_event(
        &self,
        transition: &Transition,
        event_at: i64,
    ) -> Result<UpsertOutcome> {
        let Some(subject_id) = self.resolve_subject(&transition.target).await? else {
            return Ok(UpsertOutcome::Skipped {
                reason: "no subscription matches the event".to_string(),
            });
        };

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.store.get_subscription(&subject_id).await?;
            let now = chrono::Utc::now().timestamp();

            let (next, skipped) =
                match next_state(&subject_id, current.as_ref(), transition, event_at, now) {
                    Decision::Write(next) => (next, None),
                    Decision::Observe { next, reason } => (next, Some(reason)),
                    Decision::Unchanged => return Ok(UpsertOutcome::Unchanged { subject_id }),
                    Decision::Skip(reason) => return Ok(UpsertOutcome::Skipped { reason }),
                    Decision::Stale => return Ok(UpsertOutcome::Stale { subject_id }),
                };

            let expected_version = current.as_ref().map(|sub| sub.version);
            if self.store.compare_and_swap(expected_version, &next).await? {
                return Ok(match skipped {
                    None => UpsertOutcome::Applied(next),
                    Some(reason) => UpsertOutcome::Skipped { reason },
                });
            }

            tracing::debug!(
                target: "tollgate::webhook",
                subject_id = %subject_id,
                attempt,
                "Subscription write lost a concurrent update, retrying"
            );
        }

        Err(BillingError::ConcurrentModification { subject_id }.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::memory::InMemoryStore;
    use crate::billing::reconcile::{Change, Period};
    use crate::billing::storage::SubscriptionStatus;
    use async_trait::async_trait;

    fn activate(subject: &str, subscription_id: &str, tier: Tier) -> Transition {
        Transition {
            target: Target::Subject(subject.to_string()),
            change: Change::Activate {
                tier,
                trialing: false,
                period: Period { start: 0, end: 100 },
                customer_id: Some(format!("cus_{subject}")),
                subscription_id: Some(subscription_id.to_string()),
            },
        }
    }

    fn invoice(subscription_id: &str, change: Change) -> Transition {
        Transition {
            target: Target::Provider {
                subscription_id: Some(subscription_id.to_string()),
                customer_id: None,
                subject_hint: None,
            },
            change,
        }
    }

    fn state_store() -> (InMemoryStore, SubscriptionStateStore) {
        let store = InMemoryStore::new();
        let state = SubscriptionStateStore::new(Arc::new(store.clone()));
        (store, state)
    }

    #[tokio::test]
    async fn test_tier_of_defaults_to_free() {
        let (_, state) = state_store();
        assert_eq!(state.tier_of("nobody").await.unwrap(), Tier::Free);
    }

    #[tokio::test]
    async fn test_upsert_then_read_back() {
        let (_, state) = state_store();

        let outcome = state
            .upsert_from_event(&activate("S", "sub_1", Tier::Pro), 10)
            .await
            .unwrap();
        assert!(matches!(outcome, UpsertOutcome::Applied(_)));

        let sub = state.get_active_subscription("S").await.unwrap().unwrap();
        assert_eq!(sub.tier, Tier::Pro);
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(state.tier_of("S").await.unwrap(), Tier::Pro);
    }

    #[tokio::test]
    async fn test_provider_target_resolves_by_subscription_id() {
        let (_, state) = state_store();
        let _ = state
            .upsert_from_event(&activate("S", "sub_1", Tier::Pro), 10)
            .await
            .unwrap();

        let outcome = state
            .upsert_from_event(&invoice("sub_1", Change::PaymentFailed), 20)
            .await
            .unwrap();
        let UpsertOutcome::Applied(sub) = outcome else {
            panic!("expected applied, got {outcome:?}");
        };
        assert_eq!(sub.subject_id, "S");
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
        // past_due keeps the paid tier.
        assert_eq!(state.tier_of("S").await.unwrap(), Tier::Pro);
    }

    #[tokio::test]
    async fn test_unknown_provider_subscription_skipped() {
        let (store, state) = state_store();
        let outcome = state
            .upsert_from_event(&invoice("sub_missing", Change::PaymentFailed), 20)
            .await
            .unwrap();
        assert!(matches!(outcome, UpsertOutcome::Skipped { .. }));
        assert_eq!(store.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_canceled_subscription_not_active() {
        let (_, state) = state_store();
        let _ = state
            .upsert_from_event(&activate("S", "sub_1", Tier::Business), 10)
            .await
            .unwrap();
        let _ = state
            .upsert_from_event(&invoice("sub_1", Change::Cancel), 20)
            .await
            .unwrap();

        assert!(state.get_active_subscription("S").await.unwrap().is_none());
        assert!(state.get_subscription("S").await.unwrap().is_some());
        assert_eq!(state.tier_of("S").await.unwrap(), Tier::Free);
    }

    #[tokio::test]
    async fn test_stale_event_reported() {
        let (_, state) = state_store();
        let _ = state
            .upsert_from_event(&activate("S", "sub_1", Tier::Pro), 50)
            .await
            .unwrap();
        let outcome = state
            .upsert_from_event(&invoice("sub_1", Change::PaymentFailed), 40)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            UpsertOutcome::Stale {
                subject_id: "S".to_string()
            }
        );
    }

    /// Reads succeed but every write loses the race.
    struct ContendedStore(InMemoryStore);

    #[async_trait]
    impl SubscriptionStore for ContendedStore {
        async fn get_subscription(&self, subject_id: &str) -> Result<Option<Subscription>> {
            self.0.get_subscription(subject_id).await
        }

        async fn find_by_provider_subscription_id(
            &self,
            id: &str,
        ) -> Result<Option<Subscription>> {
            self.0.find_by_provider_subscription_id(id).await
        }

        async fn find_by_provider_customer_id(&self, id: &str) -> Result<Option<Subscription>> {
            self.0.find_by_provider_customer_id(id).await
        }

        async fn compare_and_swap(
            &self,
            _expected_version: Option<u64>,
            _subscription: &Subscription,
        ) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_gives_up_after_repeated_conflicts() {
        let state = SubscriptionStateStore::new(Arc::new(ContendedStore(InMemoryStore::new())));
        let err = state
            .upsert_from_event(&activate("S", "sub_1", Tier::Pro), 10)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Concurrent modification"));
    }
}
