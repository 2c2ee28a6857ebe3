//! Storage traits for subscription, webhook and usage data.
//!
//! Implement these traits to persist entitlement state to your database.
//! `InMemoryStore` implements all of them for single-process deployments and tests.

use super::error::CouponRejection;
use super::tiers::{Feature, Tier};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Subscription status as reported by the payment provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    /// Payment failed; access is kept while the provider retries the charge.
    PastDue,
    Canceled,
    /// Awaiting the first payment.
    Incomplete,
    Unpaid,
}

impl SubscriptionStatus {
    /// Parse a provider status string.
    ///
    /// Statuses this crate does not model (`incomplete_expired`, `paused`, ...)
    /// resolve to `Incomplete`, which grants no paid entitlement.
    #[must_use]
    pub fn from_provider(status: &str) -> Self {
        match status {
            "trialing" => Self::Trialing,
            "active" => Self::Active,
            "past_due" => Self::PastDue,
            "canceled" => Self::Canceled,
            "unpaid" => Self::Unpaid,
            _ => Self::Incomplete,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trialing => "trialing",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Incomplete => "incomplete",
            Self::Unpaid => "unpaid",
        }
    }

    /// Whether the subscription's tier applies to feature limits.
    #[must_use]
    pub fn is_entitled(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing | Self::PastDue)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local record of a subject's subscription.
///
/// One row per subject. A canceled row is retained and reused when the
/// subject checks out again.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    pub subject_id: String,
    pub tier: Tier,
    pub status: SubscriptionStatus,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
    /// Unix seconds.
    pub current_period_start: i64,
    /// Unix seconds.
    pub current_period_end: i64,
    pub cancel_at_period_end: bool,
    /// `created` of the newest event applied to this row.
    pub last_event_at: i64,
    /// Bumped on every write; used for compare-and-swap.
    pub version: u64,
    pub updated_at: i64,
}

impl Subscription {
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.status == SubscriptionStatus::Canceled
    }

    /// Tier used for limit resolution.
    #[must_use]
    pub fn effective_tier(&self) -> Tier {
        if self.status.is_entitled() {
            self.tier
        } else {
            Tier::Free
        }
    }
}

/// Result of processing a webhook event, as recorded in the dedup ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Applied,
    Ignored,
    Skipped,
    Stale,
    Failed,
}

impl EventOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Ignored => "ignored",
            Self::Skipped => "skipped",
            Self::Stale => "stale",
            Self::Failed => "failed",
        }
    }

    /// Failed events stay unprocessed so a re-delivery applies them.
    #[must_use]
    pub fn marks_processed(&self) -> bool {
        !matches!(self, Self::Failed)
    }
}

/// Dedup ledger row for a provider event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookEventRecord {
    pub provider_event_id: String,
    pub event_type: String,
    pub received_at: i64,
    pub processed_at: Option<i64>,
    pub outcome: Option<EventOutcome>,
}

impl WebhookEventRecord {
    #[must_use]
    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }
}

/// Identity of one usage counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsageKey {
    pub subject_id: String,
    pub feature: Feature,
    /// Unix seconds at which the quota period starts.
    pub period_start: i64,
}

impl UsageKey {
    pub fn new(subject_id: impl Into<String>, feature: Feature, period_start: i64) -> Self {
        Self {
            subject_id: subject_id.into(),
            feature,
            period_start,
        }
    }
}

/// A usage counter row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageCounter {
    pub key: UsageKey,
    pub count: u64,
    pub period_end: i64,
}

/// Result of an atomic check-and-increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementOutcome {
    /// Counter was below the limit and now holds `count`.
    Allowed { count: u64 },
    /// Counter was already at the limit and is unchanged.
    Rejected { count: u64 },
}

/// Checkout coupon. Read-only to this crate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Coupon {
    pub code: String,
    pub provider_coupon_id: String,
    pub active: bool,
    /// Unix seconds after which the coupon is expired.
    pub valid_until: Option<i64>,
}

impl Coupon {
    /// Why this coupon cannot be redeemed at `now`, if it cannot.
    #[must_use]
    pub fn rejection(&self, now: i64) -> Option<CouponRejection> {
        if !self.active {
            return Some(CouponRejection::Inactive);
        }
        match self.valid_until {
            Some(until) if now > until => Some(CouponRejection::Expired),
            _ => None,
        }
    }
}

/// Canonical store of subscription rows.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_subscription(&self, subject_id: &str) -> Result<Option<Subscription>>;

    async fn find_by_provider_subscription_id(
        &self,
        provider_subscription_id: &str,
    ) -> Result<Option<Subscription>>;

    async fn find_by_provider_customer_id(
        &self,
        provider_customer_id: &str,
    ) -> Result<Option<Subscription>>;

    /// Write `subscription` only if the stored row still has `expected_version`.
    ///
    /// `None` means the row must not exist yet. Returns `Ok(false)` on a
    /// version mismatch. The whole row is written at once.
    async fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        subscription: &Subscription,
    ) -> Result<bool>;
}

/// Dedup ledger for provider events.
#[async_trait]
pub trait WebhookLedger: Send + Sync {
    /// Insert a received record unless one exists; returns the stored record.
    async fn record_received(
        &self,
        provider_event_id: &str,
        event_type: &str,
        received_at: i64,
    ) -> Result<WebhookEventRecord>;

    async fn get_event(&self, provider_event_id: &str) -> Result<Option<WebhookEventRecord>>;

    /// Store the outcome. Processed records are immutable, so this is a
    /// no-op for an event that already has `processed_at`.
    async fn record_outcome(
        &self,
        provider_event_id: &str,
        outcome: EventOutcome,
        at: i64,
    ) -> Result<()>;

    /// Delete processed records older than `older_than`. Returns the number removed.
    async fn cleanup_processed_events(&self, older_than: i64) -> Result<u64>;
}

/// Usage counters keyed by (subject, feature, period start).
#[async_trait]
pub trait UsageLedgerStore: Send + Sync {
    /// Create the counter if missing, then increment it only while `count < limit`.
    ///
    /// Must be a single atomic step per key.
    async fn try_increment(
        &self,
        key: &UsageKey,
        limit: u64,
        period_end: i64,
    ) -> Result<IncrementOutcome>;

    /// Unconditional increment for unlimited features. Returns the new count.
    async fn record_usage(&self, key: &UsageKey, period_end: i64) -> Result<u64>;

    async fn get_count(&self, key: &UsageKey) -> Result<u64>;

    /// Delete counters whose period ended before `now`.
    async fn purge_expired_counters(&self, now: i64) -> Result<u64>;
}

#[async_trait]
pub trait CouponStore: Send + Sync {
    async fn get_coupon(&self, code: &str) -> Result<Option<Coupon>>;
}
