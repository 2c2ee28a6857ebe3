//! Schema migration for [`super::SeaOrmStore`].
//!
//! Creates:
//! - tollgate_subscriptions: one row per subject, with ordering marker and version
//! - tollgate_webhook_events: dedup ledger keyed by provider event ID
//! - tollgate_usage_counters: one counter per (subject, feature, period start)
//! - tollgate_coupons: coupon catalog
//!
//! Run it standalone with [`run_migrations`] or add [`Migration`] to your own migrator.

use crate::error::{Result, TollgateError};
use sea_orm_migration::{prelude::*, schema::*};

/// Migrator containing only the tollgate tables.
pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(Migration)]
    }
}

/// Apply pending tollgate migrations.
pub async fn run_migrations(db: &sea_orm::DatabaseConnection) -> Result<()> {
    Migrator::up(db, None)
        .await
        .map_err(|e| TollgateError::internal(format!("Migration failed: {}", e)))?;

    tracing::info!("tollgate migrations completed");
    Ok(())
}

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> std::result::Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(TollgateSubscriptions::Table)
                    .if_not_exists()
                    .col(string(TollgateSubscriptions::SubjectId).primary_key())
                    .col(string(TollgateSubscriptions::Tier).not_null())
                    .col(string(TollgateSubscriptions::Status).not_null())
                    .col(string_null(TollgateSubscriptions::ProviderCustomerId))
                    .col(string_null(TollgateSubscriptions::ProviderSubscriptionId))
                    .col(big_integer(TollgateSubscriptions::CurrentPeriodStart).not_null())
                    .col(big_integer(TollgateSubscriptions::CurrentPeriodEnd).not_null())
                    .col(
                        boolean(TollgateSubscriptions::CancelAtPeriodEnd)
                            .not_null()
                            .default(false),
                    )
                    .col(
                        big_integer(TollgateSubscriptions::LastEventAt)
                            .not_null()
                            .default(0),
                    )
                    .col(big_integer(TollgateSubscriptions::Version).not_null().default(1))
                    .col(big_integer(TollgateSubscriptions::UpdatedAt).not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_tollgate_subscriptions_provider_subscription_id")
                    .table(TollgateSubscriptions::Table)
                    .col(TollgateSubscriptions::ProviderSubscriptionId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_tollgate_subscriptions_provider_customer_id")
                    .table(TollgateSubscriptions::Table)
                    .col(TollgateSubscriptions::ProviderCustomerId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(TollgateWebhookEvents::Table)
                    .if_not_exists()
                    .col(string(TollgateWebhookEvents::ProviderEventId).primary_key())
                    .col(string(TollgateWebhookEvents::EventType).not_null())
                    .col(big_integer(TollgateWebhookEvents::ReceivedAt).not_null())
                    .col(big_integer_null(TollgateWebhookEvents::ProcessedAt))
                    .col(string_null(TollgateWebhookEvents::Outcome))
                    .to_owned(),
            )
            .await?;

        // Cleanup scans by processed_at.
        manager
            .create_index(
                Index::create()
                    .name("idx_tollgate_webhook_events_processed_at")
                    .table(TollgateWebhookEvents::Table)
                    .col(TollgateWebhookEvents::ProcessedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(TollgateUsageCounters::Table)
                    .if_not_exists()
                    .col(string(TollgateUsageCounters::SubjectId).not_null())
                    .col(string(TollgateUsageCounters::Feature).not_null())
                    .col(big_integer(TollgateUsageCounters::PeriodStart).not_null())
                    .col(big_integer(TollgateUsageCounters::Count).not_null().default(0))
                    .col(big_integer(TollgateUsageCounters::PeriodEnd).not_null())
                    .primary_key(
                        Index::create()
                            .col(TollgateUsageCounters::SubjectId)
                            .col(TollgateUsageCounters::Feature)
                            .col(TollgateUsageCounters::PeriodStart),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_tollgate_usage_counters_period_end")
                    .table(TollgateUsageCounters::Table)
                    .col(TollgateUsageCounters::PeriodEnd)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(TollgateCoupons::Table)
                    .if_not_exists()
                    .col(string(TollgateCoupons::Code).primary_key())
                    .col(string(TollgateCoupons::ProviderCouponId).not_null())
                    .col(boolean(TollgateCoupons::Active).not_null().default(true))
                    .col(big_integer_null(TollgateCoupons::ValidUntil))
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> std::result::Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(TollgateCoupons::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(TollgateUsageCounters::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(TollgateWebhookEvents::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(TollgateSubscriptions::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum TollgateSubscriptions {
    Table,
    SubjectId,
    Tier,
    Status,
    ProviderCustomerId,
    ProviderSubscriptionId,
    CurrentPeriodStart,
    CurrentPeriodEnd,
    CancelAtPeriodEnd,
    LastEventAt,
    Version,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum TollgateWebhookEvents {
    Table,
    ProviderEventId,
    EventType,
    ReceivedAt,
    ProcessedAt,
    Outcome,
}

#[derive(DeriveIden)]
enum TollgateUsageCounters {
    Table,
    SubjectId,
    Feature,
    PeriodStart,
    Count,
    PeriodEnd,
}

#[derive(DeriveIden)]
enum TollgateCoupons {
    Table,
    Code,
    ProviderCouponId,
    Active,
    ValidUntil,
}
