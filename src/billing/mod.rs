//! Subscription entitlements and usage quotas.
//!
//! Reconciles payment-provider webhooks into a local subscription store, opens
//! hosted checkout and portal sessions, and gates feature usage against
//! per-tier limits.
//!
//! # Features
//!
//! - `billing-live` - Live provider client (`LiveStripeClient`)
//! - `billing-seaorm` - Relational stores (`SeaOrmStore`) and migration
//!
//! # Example
//!
//! ```rust,ignore
//! use tollgate::billing::{FeatureGate, InMemoryStore, SubscriptionStateStore};
//! use std::sync::Arc;
//!
//! let store = InMemoryStore::new();
//! let gate = FeatureGate::new(
//!     SubscriptionStateStore::new(Arc::new(store.clone())),
//!     Arc::new(store),
//! );
//!
//! let decision = gate.check_and_record_usage("user_42", "comparisons_daily").await?;
//! if !decision.allowed {
//!     // show the upgrade prompt
//! }
//! ```

pub mod checkout;
pub mod client;
pub mod config;
pub mod error;
#[cfg(feature = "billing-live")]
pub mod live_client;
pub mod memory;
#[cfg(feature = "billing-seaorm")]
pub mod migration;
pub mod operator;
pub mod portal;
pub mod reconcile;
#[cfg(feature = "billing-seaorm")]
pub mod sea_orm_store;
pub mod storage;
pub mod subscription;
pub mod tiers;
pub mod usage;
pub mod webhook;

// Tier and limit exports
pub use tiers::{
    BillingInterval, Feature, Limit, LimitTable, LimitTableBuilder, PriceTable, QuotaPeriod, Tier,
};

// Storage exports
pub use memory::InMemoryStore;
pub use storage::{
    Coupon, CouponStore, EventOutcome, IncrementOutcome, Subscription, SubscriptionStatus,
    SubscriptionStore, UsageCounter, UsageKey, UsageLedgerStore, WebhookEventRecord,
    WebhookLedger,
};

// State store exports
pub use subscription::{SubscriptionStateStore, UpsertOutcome};

// Reconciler exports
pub use operator::{OperatorChannel, TracingOperatorChannel};
pub use reconcile::{Change, Decision, Period, ProviderEvent, Target, Transition};
pub use webhook::{
    SIGNATURE_HEADER, WebhookAck, WebhookAckPolicy, WebhookOutcome, WebhookReconciler,
    sign_payload, verify_signature,
};

// Session factory exports
pub use checkout::{CheckoutConfig, CheckoutManager, CheckoutRequest};
pub use client::{
    CheckoutProvider, CheckoutSession, CreateCheckoutSessionRequest, PaymentProvider,
    PortalProvider, PortalSession,
};
pub use portal::{PortalManager, PortalRequest};

// Feature gate exports
pub use usage::{EntitlementSummary, FeatureGate, FeatureUsage, UsageDecision, quota_window};

// Config and error exports
pub use config::{BillingConfig, PriceIds};
pub use error::{BillingError, CouponRejection};

#[cfg(feature = "billing-live")]
pub use live_client::{LiveStripeClient, LiveStripeClientConfig};

#[cfg(feature = "billing-seaorm")]
pub use migration::{Migrator, run_migrations};
#[cfg(feature = "billing-seaorm")]
pub use sea_orm_store::SeaOrmStore;
