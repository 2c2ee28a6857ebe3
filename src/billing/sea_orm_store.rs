//! SeaORM-backed entitlement storage.
//!
//! Persists subscriptions, webhook ledger rows, usage counters and coupons.
//! Create the tables with [`super::migration::Migrator`].
//!
//! # Example
//!
//! ```rust,ignore
//! use tollgate::billing::SeaOrmStore;
//!
//! let store = SeaOrmStore::new(db.clone());
//! let context = AppContext::builder().with_store(store).build();
//! ```

use async_trait::async_trait;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set, TryInsertResult,
    sea_query::{Expr, OnConflict},
};

use super::storage::{
    Coupon, CouponStore, EventOutcome, IncrementOutcome, Subscription, SubscriptionStatus,
    SubscriptionStore, UsageKey, UsageLedgerStore, WebhookEventRecord, WebhookLedger,
};
use crate::error::{Result, TollgateError};

mod entity {
    pub mod subscription {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "tollgate_subscriptions")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub subject_id: String,
            pub tier: String,
            pub status: String,
            pub provider_customer_id: Option<String>,
            pub provider_subscription_id: Option<String>,
            pub current_period_start: i64,
            pub current_period_end: i64,
            pub cancel_at_period_end: bool,
            pub last_event_at: i64,
            /// Optimistic lock for compare_and_swap.
            pub version: i64,
            pub updated_at: i64,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod webhook_event {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "tollgate_webhook_events")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub provider_event_id: String,
            pub event_type: String,
            pub received_at: i64,
            pub processed_at: Option<i64>,
            pub outcome: Option<String>,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod usage_counter {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "tollgate_usage_counters")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub subject_id: String,
            #[sea_orm(primary_key, auto_increment = false)]
            pub feature: String,
            #[sea_orm(primary_key, auto_increment = false)]
            pub period_start: i64,
            pub count: i64,
            pub period_end: i64,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }

    pub mod coupon {
        use sea_orm::entity::prelude::*;

        #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
        #[sea_orm(table_name = "tollgate_coupons")]
        pub struct Model {
            #[sea_orm(primary_key, auto_increment = false)]
            pub code: String,
            pub provider_coupon_id: String,
            pub active: bool,
            pub valid_until: Option<i64>,
        }

        #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
        pub enum Relation {}

        impl ActiveModelBehavior for ActiveModel {}
    }
}

use entity::{coupon, subscription, usage_counter, webhook_event};

/// Convert i64 to u64 safely (negative values become 0).
#[inline]
fn i64_to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Convert u64 to i64 safely (values > i64::MAX become i64::MAX).
#[inline]
fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn model_to_subscription(model: subscription::Model) -> Result<Subscription> {
    let tier = model
        .tier
        .parse()
        .map_err(|e| TollgateError::internal(format!("Corrupt subscription row: {}", e)))?;
    Ok(Subscription {
        subject_id: model.subject_id,
        tier,
        status: SubscriptionStatus::from_provider(&model.status),
        provider_customer_id: model.provider_customer_id,
        provider_subscription_id: model.provider_subscription_id,
        current_period_start: model.current_period_start,
        current_period_end: model.current_period_end,
        cancel_at_period_end: model.cancel_at_period_end,
        last_event_at: model.last_event_at,
        version: i64_to_u64(model.version),
        updated_at: model.updated_at,
    })
}

fn subscription_to_active_model(sub: &Subscription) -> subscription::ActiveModel {
    subscription::ActiveModel {
        subject_id: Set(sub.subject_id.clone()),
        tier: Set(sub.tier.as_str().to_string()),
        status: Set(sub.status.as_str().to_string()),
        provider_customer_id: Set(sub.provider_customer_id.clone()),
        provider_subscription_id: Set(sub.provider_subscription_id.clone()),
        current_period_start: Set(sub.current_period_start),
        current_period_end: Set(sub.current_period_end),
        cancel_at_period_end: Set(sub.cancel_at_period_end),
        last_event_at: Set(sub.last_event_at),
        version: Set(u64_to_i64(sub.version)),
        updated_at: Set(sub.updated_at),
    }
}

/// Conditional UPDATE that only matches the expected version.
fn build_subscription_update(
    sub: &Subscription,
    expected_version: u64,
) -> sea_orm::UpdateMany<subscription::Entity> {
    subscription::Entity::update_many()
        .col_expr(subscription::Column::Tier, Expr::value(sub.tier.as_str()))
        .col_expr(subscription::Column::Status, Expr::value(sub.status.as_str()))
        .col_expr(
            subscription::Column::ProviderCustomerId,
            Expr::value(sub.provider_customer_id.clone()),
        )
        .col_expr(
            subscription::Column::ProviderSubscriptionId,
            Expr::value(sub.provider_subscription_id.clone()),
        )
        .col_expr(
            subscription::Column::CurrentPeriodStart,
            Expr::value(sub.current_period_start),
        )
        .col_expr(
            subscription::Column::CurrentPeriodEnd,
            Expr::value(sub.current_period_end),
        )
        .col_expr(
            subscription::Column::CancelAtPeriodEnd,
            Expr::value(sub.cancel_at_period_end),
        )
        .col_expr(subscription::Column::LastEventAt, Expr::value(sub.last_event_at))
        .col_expr(subscription::Column::Version, Expr::value(u64_to_i64(sub.version)))
        .col_expr(subscription::Column::UpdatedAt, Expr::value(sub.updated_at))
        .filter(subscription::Column::SubjectId.eq(sub.subject_id.as_str()))
        .filter(subscription::Column::Version.eq(u64_to_i64(expected_version)))
}

fn outcome_from_str(value: &str) -> Option<EventOutcome> {
    match value {
        "applied" => Some(EventOutcome::Applied),
        "ignored" => Some(EventOutcome::Ignored),
        "skipped" => Some(EventOutcome::Skipped),
        "stale" => Some(EventOutcome::Stale),
        "failed" => Some(EventOutcome::Failed),
        _ => None,
    }
}

fn model_to_event(model: webhook_event::Model) -> WebhookEventRecord {
    WebhookEventRecord {
        provider_event_id: model.provider_event_id,
        event_type: model.event_type,
        received_at: model.received_at,
        processed_at: model.processed_at,
        outcome: model.outcome.as_deref().and_then(outcome_from_str),
    }
}

fn counter_filter(key: &UsageKey) -> sea_orm::Condition {
    sea_orm::Condition::all()
        .add(usage_counter::Column::SubjectId.eq(key.subject_id.as_str()))
        .add(usage_counter::Column::Feature.eq(key.feature.key()))
        .add(usage_counter::Column::PeriodStart.eq(key.period_start))
}

/// SeaORM-backed store implementing every entitlement storage trait.
#[derive(Clone, Debug)]
pub struct SeaOrmStore {
    db: DatabaseConnection,
}

impl SeaOrmStore {
    #[must_use]
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    #[must_use]
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Add or replace a coupon in the catalog.
    pub async fn upsert_coupon(&self, coupon: &Coupon) -> Result<()> {
        let model = coupon::ActiveModel {
            code: Set(coupon.code.clone()),
            provider_coupon_id: Set(coupon.provider_coupon_id.clone()),
            active: Set(coupon.active),
            valid_until: Set(coupon.valid_until),
        };
        coupon::Entity::insert(model)
            .on_conflict(
                OnConflict::column(coupon::Column::Code)
                    .update_columns([
                        coupon::Column::ProviderCouponId,
                        coupon::Column::Active,
                        coupon::Column::ValidUntil,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Insert a zero counter if none exists for the key.
    async fn ensure_counter(&self, key: &UsageKey, period_end: i64) -> Result<()> {
        let model = usage_counter::ActiveModel {
            subject_id: Set(key.subject_id.clone()),
            feature: Set(key.feature.key().to_string()),
            period_start: Set(key.period_start),
            count: Set(0),
            period_end: Set(period_end),
        };
        usage_counter::Entity::insert(model)
            .on_conflict(
                OnConflict::columns([
                    usage_counter::Column::SubjectId,
                    usage_counter::Column::Feature,
                    usage_counter::Column::PeriodStart,
                ])
                .do_nothing()
                .to_owned(),
            )
            .do_nothing()
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn find_one(
        &self,
        column: subscription::Column,
        value: &str,
    ) -> Result<Option<Subscription>> {
        subscription::Entity::find()
            .filter(column.eq(value))
            .one(&self.db)
            .await?
            .map(model_to_subscription)
            .transpose()
    }
}

#[async_trait]
impl SubscriptionStore for SeaOrmStore {
    async fn get_subscription(&self, subject_id: &str) -> Result<Option<Subscription>> {
        subscription::Entity::find_by_id(subject_id)
            .one(&self.db)
            .await?
            .map(model_to_subscription)
            .transpose()
    }

    async fn find_by_provider_subscription_id(
        &self,
        provider_subscription_id: &str,
    ) -> Result<Option<Subscription>> {
        self.find_one(
            subscription::Column::ProviderSubscriptionId,
            provider_subscription_id,
        )
        .await
    }

    async fn find_by_provider_customer_id(
        &self,
        provider_customer_id: &str,
    ) -> Result<Option<Subscription>> {
        self.find_one(subscription::Column::ProviderCustomerId, provider_customer_id)
            .await
    }

    async fn compare_and_swap(
        &self,
        expected_version: Option<u64>,
        sub: &Subscription,
    ) -> Result<bool> {
        tracing::debug!(
            subject_id = %sub.subject_id,
            expected_version = ?expected_version,
            new_version = sub.version,
            "compare and swap subscription"
        );

        match expected_version {
            Some(version) => {
                let result = build_subscription_update(sub, version)
                    .exec(&self.db)
                    .await?;
                Ok(result.rows_affected > 0)
            }
            None => {
                let result = subscription::Entity::insert(subscription_to_active_model(sub))
                    .on_conflict(
                        OnConflict::column(subscription::Column::SubjectId)
                            .do_nothing()
                            .to_owned(),
                    )
                    .do_nothing()
                    .exec(&self.db)
                    .await?;
                Ok(matches!(result, TryInsertResult::Inserted(_)))
            }
        }
    }
}

#[async_trait]
impl WebhookLedger for SeaOrmStore {
    async fn record_received(
        &self,
        provider_event_id: &str,
        event_type: &str,
        received_at: i64,
    ) -> Result<WebhookEventRecord> {
        let model = webhook_event::ActiveModel {
            provider_event_id: Set(provider_event_id.to_string()),
            event_type: Set(event_type.to_string()),
            received_at: Set(received_at),
            processed_at: Set(None),
            outcome: Set(None),
        };
        webhook_event::Entity::insert(model)
            .on_conflict(
                OnConflict::column(webhook_event::Column::ProviderEventId)
                    .do_nothing()
                    .to_owned(),
            )
            .do_nothing()
            .exec(&self.db)
            .await?;

        webhook_event::Entity::find_by_id(provider_event_id)
            .one(&self.db)
            .await?
            .map(model_to_event)
            .ok_or_else(|| {
                TollgateError::store_unavailable("webhook event vanished after insert")
            })
    }

    async fn get_event(&self, provider_event_id: &str) -> Result<Option<WebhookEventRecord>> {
        Ok(webhook_event::Entity::find_by_id(provider_event_id)
            .one(&self.db)
            .await?
            .map(model_to_event))
    }

    async fn record_outcome(
        &self,
        provider_event_id: &str,
        outcome: EventOutcome,
        at: i64,
    ) -> Result<()> {
        let processed_at = outcome.marks_processed().then_some(at);
        webhook_event::Entity::update_many()
            .col_expr(webhook_event::Column::Outcome, Expr::value(outcome.as_str()))
            .col_expr(webhook_event::Column::ProcessedAt, Expr::value(processed_at))
            .filter(webhook_event::Column::ProviderEventId.eq(provider_event_id))
            .filter(webhook_event::Column::ProcessedAt.is_null())
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn cleanup_processed_events(&self, older_than: i64) -> Result<u64> {
        let result = webhook_event::Entity::delete_many()
            .filter(webhook_event::Column::ProcessedAt.is_not_null())
            .filter(webhook_event::Column::ProcessedAt.lt(older_than))
            .exec(&self.db)
            .await?;

        tracing::info!(
            target: "tollgate::webhook",
            deleted = result.rows_affected,
            "cleaned up processed webhook events"
        );
        Ok(result.rows_affected)
    }
}

#[async_trait]
impl UsageLedgerStore for SeaOrmStore {
    async fn try_increment(
        &self,
        key: &UsageKey,
        limit: u64,
        period_end: i64,
    ) -> Result<IncrementOutcome> {
        self.ensure_counter(key, period_end).await?;

        // The limit check and the increment are one statement.
        let result = usage_counter::Entity::update_many()
            .col_expr(
                usage_counter::Column::Count,
                Expr::col(usage_counter::Column::Count).add(1),
            )
            .filter(counter_filter(key))
            .filter(usage_counter::Column::Count.lt(u64_to_i64(limit)))
            .exec(&self.db)
            .await?;

        let count = self.get_count(key).await?;
        if result.rows_affected > 0 {
            Ok(IncrementOutcome::Allowed {
                count: count.min(limit),
            })
        } else {
            Ok(IncrementOutcome::Rejected { count })
        }
    }

    async fn record_usage(&self, key: &UsageKey, period_end: i64) -> Result<u64> {
        self.ensure_counter(key, period_end).await?;
        usage_counter::Entity::update_many()
            .col_expr(
                usage_counter::Column::Count,
                Expr::col(usage_counter::Column::Count).add(1),
            )
            .filter(counter_filter(key))
            .exec(&self.db)
            .await?;
        self.get_count(key).await
    }

    async fn get_count(&self, key: &UsageKey) -> Result<u64> {
        Ok(usage_counter::Entity::find()
            .filter(counter_filter(key))
            .one(&self.db)
            .await?
            .map(|c| i64_to_u64(c.count))
            .unwrap_or(0))
    }

    async fn purge_expired_counters(&self, now: i64) -> Result<u64> {
        let result = usage_counter::Entity::delete_many()
            .filter(usage_counter::Column::PeriodEnd.lt(now))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}

#[async_trait]
impl CouponStore for SeaOrmStore {
    async fn get_coupon(&self, code: &str) -> Result<Option<Coupon>> {
        Ok(coupon::Entity::find_by_id(code)
            .one(&self.db)
            .await?
            .map(|c| Coupon {
                code: c.code,
                provider_coupon_id: c.provider_coupon_id,
                active: c.active,
                valid_until: c.valid_until,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::migration::run_migrations;
    use crate::billing::tiers::{Feature, Tier};
    use sea_orm::{ConnectOptions, Database};

    async fn store() -> SeaOrmStore {
        // One connection, so every query sees the same in-memory database.
        let mut options = ConnectOptions::new("sqlite::memory:");
        options.max_connections(1).sqlx_logging(false);
        let db = Database::connect(options).await.unwrap();
        run_migrations(&db).await.unwrap();
        SeaOrmStore::new(db)
    }

    fn subscription(version: u64) -> Subscription {
        Subscription {
            subject_id: "user_1".to_string(),
            tier: Tier::Pro,
            status: SubscriptionStatus::Active,
            provider_customer_id: Some("cus_1".to_string()),
            provider_subscription_id: Some("sub_1".to_string()),
            current_period_start: 1_700_000_000,
            current_period_end: 1_702_592_000,
            cancel_at_period_end: false,
            last_event_at: 1_700_000_000,
            version,
            updated_at: 1_700_000_000,
        }
    }

    fn model() -> subscription::Model {
        subscription::Model {
            subject_id: "S".to_string(),
            tier: "pro".to_string(),
            status: "past_due".to_string(),
            provider_customer_id: Some("cus_1".to_string()),
            provider_subscription_id: Some("sub_1".to_string()),
            current_period_start: 1_700_000_000,
            current_period_end: 1_702_592_000,
            cancel_at_period_end: true,
            last_event_at: 1_700_000_100,
            version: 4,
            updated_at: 1_700_000_200,
        }
    }

    #[test]
    fn test_model_to_subscription() {
        let sub = model_to_subscription(model()).unwrap();
        assert_eq!(sub.tier, Tier::Pro);
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
        assert_eq!(sub.version, 4);
        assert_eq!(sub.last_event_at, 1_700_000_100);
        assert!(sub.cancel_at_period_end);
    }

    #[test]
    fn test_corrupt_tier_is_error() {
        let mut row = model();
        row.tier = "platinum".to_string();
        assert!(model_to_subscription(row).is_err());
    }

    #[test]
    fn test_subscription_to_active_model() {
        let sub = model_to_subscription(model()).unwrap();
        let active = subscription_to_active_model(&sub);
        assert_eq!(active.version, Set(4));
        assert_eq!(active.tier, Set("pro".to_string()));
    }

    #[test]
    fn test_outcome_strings_round_trip() {
        for outcome in [
            EventOutcome::Applied,
            EventOutcome::Ignored,
            EventOutcome::Skipped,
            EventOutcome::Stale,
            EventOutcome::Failed,
        ] {
            assert_eq!(outcome_from_str(outcome.as_str()), Some(outcome));
        }
        assert_eq!(outcome_from_str("bogus"), None);
    }

    #[test]
    fn test_safe_integer_conversions() {
        assert_eq!(i64_to_u64(-1), 0);
        assert_eq!(i64_to_u64(i64::MAX), i64::MAX as u64);
        assert_eq!(u64_to_i64(u64::MAX), i64::MAX);
        assert_eq!(u64_to_i64(7), 7);
    }

    #[tokio::test]
    async fn test_compare_and_swap_checks_version() {
        let store = store().await;

        assert!(store.compare_and_swap(None, &subscription(1)).await.unwrap());
        assert!(!store.compare_and_swap(None, &subscription(1)).await.unwrap());

        let mut canceled = subscription(2);
        canceled.status = SubscriptionStatus::Canceled;
        assert!(!store.compare_and_swap(Some(7), &canceled).await.unwrap());
        assert_eq!(
            store.get_subscription("user_1").await.unwrap().unwrap().status,
            SubscriptionStatus::Active
        );

        assert!(store.compare_and_swap(Some(1), &canceled).await.unwrap());
        let row = store.get_subscription("user_1").await.unwrap().unwrap();
        assert_eq!(row.status, SubscriptionStatus::Canceled);
        assert_eq!(row.version, 2);

        let by_provider = store
            .find_by_provider_subscription_id("sub_1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_provider.subject_id, "user_1");
    }

    #[tokio::test]
    async fn test_try_increment_stops_at_limit() {
        let store = store().await;
        let key = UsageKey::new("user_1", Feature::ComparisonsDaily, 1_700_000_000);

        for expected in 1..=3 {
            assert_eq!(
                store.try_increment(&key, 3, 1_700_086_400).await.unwrap(),
                IncrementOutcome::Allowed { count: expected }
            );
        }
        assert_eq!(
            store.try_increment(&key, 3, 1_700_086_400).await.unwrap(),
            IncrementOutcome::Rejected { count: 3 }
        );
        assert_eq!(store.get_count(&key).await.unwrap(), 3);

        let other = UsageKey::new("user_2", Feature::ComparisonsDaily, 1_700_000_000);
        assert_eq!(store.get_count(&other).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_never_overshoot() {
        let store = store().await;
        let key = UsageKey::new("user_1", Feature::ExportsMonthly, 1_700_000_000);

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store.try_increment(&key, 5, 1_702_592_000).await.unwrap()
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), IncrementOutcome::Allowed { .. }) {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
        assert_eq!(store.get_count(&key).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_record_received_keeps_first_row() {
        let store = store().await;

        let first = store
            .record_received("evt_1", "invoice.paid", 1_700_000_000)
            .await
            .unwrap();
        let second = store
            .record_received("evt_1", "invoice.payment_failed", 1_700_000_500)
            .await
            .unwrap();

        assert_eq!(second, first);
        assert_eq!(second.event_type, "invoice.paid");
        assert_eq!(second.received_at, 1_700_000_000);
    }

    #[tokio::test]
    async fn test_processed_outcome_is_immutable() {
        let store = store().await;
        store
            .record_received("evt_1", "invoice.paid", 1_700_000_000)
            .await
            .unwrap();

        store
            .record_outcome("evt_1", EventOutcome::Failed, 1_700_000_010)
            .await
            .unwrap();
        assert!(!store.get_event("evt_1").await.unwrap().unwrap().is_processed());

        store
            .record_outcome("evt_1", EventOutcome::Applied, 1_700_000_020)
            .await
            .unwrap();
        store
            .record_outcome("evt_1", EventOutcome::Failed, 1_700_000_030)
            .await
            .unwrap();

        let event = store.get_event("evt_1").await.unwrap().unwrap();
        assert_eq!(event.outcome, Some(EventOutcome::Applied));
        assert_eq!(event.processed_at, Some(1_700_000_020));
    }

    #[tokio::test]
    async fn test_cleanup_and_purge_remove_finished_rows() {
        let store = store().await;
        store.record_received("evt_old", "invoice.paid", 100).await.unwrap();
        store.record_outcome("evt_old", EventOutcome::Applied, 100).await.unwrap();
        store.record_received("evt_open", "invoice.paid", 100).await.unwrap();

        assert_eq!(store.cleanup_processed_events(200).await.unwrap(), 1);
        assert!(store.get_event("evt_old").await.unwrap().is_none());
        assert!(store.get_event("evt_open").await.unwrap().is_some());

        let expired = UsageKey::new("user_1", Feature::ComparisonsDaily, 0);
        let current = UsageKey::new("user_1", Feature::ComparisonsDaily, 86_400);
        store.record_usage(&expired, 86_400).await.unwrap();
        store.record_usage(&current, 172_800).await.unwrap();

        assert_eq!(store.purge_expired_counters(100_000).await.unwrap(), 1);
        assert_eq!(store.get_count(&expired).await.unwrap(), 0);
        assert_eq!(store.get_count(&current).await.unwrap(), 1);
    }
}
