//! Payment provider webhook ingestion.
//!
//! Verifies the signature over the raw body, deduplicates by event ID and
//! applies the event's transition to the Subscription State Store.

use super::error::BillingError;
use super::operator::{OperatorChannel, TracingOperatorChannel};
use super::reconcile::{transition_for, ProviderEvent};
use super::storage::{EventOutcome, WebhookLedger};
use super::subscription::{SubscriptionStateStore, UpsertOutcome};
use super::tiers::PriceTable;
use super::usage::summary_cache_key;
use crate::cache::ReadThroughCache;
use crate::error::{Result, TollgateError};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::str::FromStr;
use std::sync::Arc;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the provider signature.
pub const SIGNATURE_HEADER: &str = "provider-signature";

/// Default maximum signature age.
pub const DEFAULT_TOLERANCE_SECONDS: i64 = 300;

/// Allowed clock skew for signatures timestamped in the future.
const MAX_FUTURE_SKEW_SECONDS: i64 = 60;

/// How processing failures after signature verification are answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookAckPolicy {
    /// Acknowledge every verified event; failures go to the operator channel.
    #[default]
    AlwaysAcknowledge,
    /// Answer 500 when the store is unavailable so the provider re-delivers.
    RetryTransient,
}

impl FromStr for WebhookAckPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" | "always_acknowledge" => Ok(Self::AlwaysAcknowledge),
            "retry_transient" => Ok(Self::RetryTransient),
            other => Err(format!("unknown webhook ack policy '{}'", other)),
        }
    }
}

/// Outcome of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied,
    /// Event type not handled.
    Ignored,
    /// Precondition not met (no subscription, already active, ...).
    Skipped,
    /// Older than the newest applied event.
    Stale,
    /// Duplicate delivery of a processed event.
    AlreadyProcessed,
    /// Processing failed and was reported to the operator channel.
    Failed,
}

impl WebhookOutcome {
    fn ledger_outcome(self) -> EventOutcome {
        match self {
            Self::Applied | Self::AlreadyProcessed => EventOutcome::Applied,
            Self::Ignored => EventOutcome::Ignored,
            Self::Skipped => EventOutcome::Skipped,
            Self::Stale => EventOutcome::Stale,
            Self::Failed => EventOutcome::Failed,
        }
    }
}

/// Acknowledgment returned to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: WebhookOutcome,
}

impl WebhookAck {
    fn new(outcome: WebhookOutcome) -> Self {
        Self {
            received: true,
            outcome,
        }
    }
}

/// Webhook Ingestion & Reconciler.
///
/// The webhook secret is stored using [`SecretString`] to prevent accidental
/// exposure in logs or debug output.
pub struct WebhookReconciler {
    secret: Option<SecretString>,
    tolerance_seconds: i64,
    subscriptions: SubscriptionStateStore,
    ledger: Arc<dyn WebhookLedger>,
    prices: PriceTable,
    operator: Arc<dyn OperatorChannel>,
    cache: Option<ReadThroughCache>,
    ack_policy: WebhookAckPolicy,
}

impl WebhookReconciler {
    #[must_use]
    pub fn new(subscriptions: SubscriptionStateStore, ledger: Arc<dyn WebhookLedger>) -> Self {
        Self {
            secret: None,
            tolerance_seconds: DEFAULT_TOLERANCE_SECONDS,
            subscriptions,
            ledger,
            prices: PriceTable::new(),
            operator: Arc::new(TracingOperatorChannel),
            cache: None,
            ack_policy: WebhookAckPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_secret(mut self, secret: Option<SecretString>) -> Self {
        self.secret = secret;
        self
    }

    #[must_use]
    pub fn with_tolerance(mut self, seconds: i64) -> Self {
        self.tolerance_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_prices(mut self, prices: PriceTable) -> Self {
        self.prices = prices;
        self
    }

    #[must_use]
    pub fn with_operator(mut self, operator: Arc<dyn OperatorChannel>) -> Self {
        self.operator = operator;
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: ReadThroughCache) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn with_ack_policy(mut self, policy: WebhookAckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    pub fn subscriptions(&self) -> &SubscriptionStateStore {
        &self.subscriptions
    }

    /// Delete processed ledger rows older than `older_than` (unix seconds).
    ///
    /// Failed rows are kept so they can still be replayed.
    pub async fn cleanup_processed_events(&self, older_than: i64) -> Result<u64> {
        self.ledger.cleanup_processed_events(older_than).await
    }

    /// Verify, parse and process one raw delivery.
    ///
    /// Errors are signature problems (400), an unparseable envelope (400),
    /// or a store failure under [`WebhookAckPolicy::RetryTransient`] (500).
    pub async fn ingest(&self, payload: &[u8], signature: Option<&str>) -> Result<WebhookAck> {
        let secret = self.secret.as_ref().ok_or_else(|| {
            tracing::warn!(target: "tollgate::webhook", "Webhook received but no secret is configured");
            BillingError::WebhookSecretMissing
        })?;
        let header = signature.ok_or_else(|| BillingError::InvalidWebhookSignature {
            reason: format!("missing {} header", SIGNATURE_HEADER),
        })?;

        let now = chrono::Utc::now().timestamp();
        if let Err(e) = verify_signature(secret, payload, header, now, self.tolerance_seconds) {
            tracing::warn!(target: "tollgate::webhook", error = %e, "Webhook signature rejected");
            return Err(e.into());
        }

        // Log detailed error internally but return generic message to prevent information leakage
        let event: ProviderEvent = serde_json::from_slice(payload).map_err(|e| {
            tracing::warn!(
                target: "tollgate::webhook",
                error = %e,
                "Failed to parse webhook payload"
            );
            BillingError::InvalidWebhookPayload {
                message: "malformed event envelope".to_string(),
            }
        })?;

        self.process(&event).await
    }

    /// Process a verified event.
    pub async fn process(&self, event: &ProviderEvent) -> Result<WebhookAck> {
        let now = chrono::Utc::now().timestamp();

        let record = match self
            .ledger
            .record_received(&event.id, &event.event_type, now)
            .await
        {
            Ok(record) => record,
            Err(e) => return self.fail(event, e).await,
        };
        if record.is_processed() {
            tracing::debug!(
                target: "tollgate::webhook",
                event_id = %event.id,
                "Duplicate delivery of processed event"
            );
            return Ok(WebhookAck::new(WebhookOutcome::AlreadyProcessed));
        }

        let (outcome, subject_id) = match self.apply(event).await {
            Ok(result) => result,
            Err(e) => return self.fail(event, e).await,
        };

        if let Err(e) = self
            .ledger
            .record_outcome(&event.id, outcome.ledger_outcome(), now)
            .await
        {
            // The transition is idempotent, so a re-delivery is harmless.
            return self.fail(event, e).await;
        }

        if let (Some(cache), Some(subject_id)) = (&self.cache, subject_id) {
            cache
                .invalidate_key(&summary_cache_key(&subject_id))
                .await;
        }

        Ok(WebhookAck::new(outcome))
    }

    async fn apply(&self, event: &ProviderEvent) -> Result<(WebhookOutcome, Option<String>)> {
        let Some(transition) = transition_for(event, &self.prices)? else {
            tracing::debug!(
                target: "tollgate::webhook",
                event_id = %event.id,
                event_type = %event.event_type,
                "Ignoring unhandled event type"
            );
            return Ok((WebhookOutcome::Ignored, None));
        };

        let result = match self
            .subscriptions
            .upsert_from_event(&transition, event.created)
            .await?
        {
            UpsertOutcome::Applied(subscription) => {
                tracing::info!(
                    target: "tollgate::webhook",
                    event_id = %event.id,
                    event_type = %event.event_type,
                    subject_id = %subscription.subject_id,
                    status = %subscription.status,
                    tier = %subscription.tier,
                    "Subscription updated"
                );
                (WebhookOutcome::Applied, Some(subscription.subject_id))
            }
            UpsertOutcome::Unchanged { .. } => (WebhookOutcome::Applied, None),
            UpsertOutcome::Skipped { reason } => {
                tracing::debug!(
                    target: "tollgate::webhook",
                    event_id = %event.id,
                    event_type = %event.event_type,
                    reason = %reason,
                    "Event skipped"
                );
                (WebhookOutcome::Skipped, None)
            }
            UpsertOutcome::Stale { subject_id } => {
                tracing::info!(
                    target: "tollgate::webhook",
                    event_id = %event.id,
                    event_type = %event.event_type,
                    subject_id = %subject_id,
                    "Out-of-order event ignored"
                );
                (WebhookOutcome::Stale, None)
            }
        };
        Ok(result)
    }

    async fn fail(&self, event: &ProviderEvent, error: TollgateError) -> Result<WebhookAck> {
        self.operator
            .webhook_failed(&event.id, &event.event_type, &error.to_string())
            .await;

        let now = chrono::Utc::now().timestamp();
        if let Err(e) = self
            .ledger
            .record_outcome(&event.id, EventOutcome::Failed, now)
            .await
        {
            tracing::warn!(
                target: "tollgate::webhook",
                event_id = %event.id,
                error = %e,
                "Could not record failed outcome"
            );
        }

        match (self.ack_policy, &error) {
            (WebhookAckPolicy::RetryTransient, TollgateError::StoreUnavailable(_)) => Err(error),
            _ => Ok(WebhookAck::new(WebhookOutcome::Failed)),
        }
    }
}

/// Verify a `t=<unix>,v1=<hex>` signature header against the raw payload.
///
/// Any one matching `v1` entry is accepted.
pub fn verify_signature(
    secret: &SecretString,
    payload: &[u8],
    header: &str,
    now: i64,
    tolerance_seconds: i64,
) -> std::result::Result<(), BillingError> {
    let parts = parse_signature_header(header)?;

    let age = now - parts.timestamp;
    if age > tolerance_seconds || age < -MAX_FUTURE_SKEW_SECONDS {
        return Err(BillingError::WebhookTimestampOutOfTolerance { age_seconds: age });
    }

    let expected = compute_signature(secret.expose_secret(), parts.timestamp, payload)?;
    let matched = parts
        .signatures
        .iter()
        .filter_map(|sig| hex::decode(sig).ok())
        .any(|provided| bool::from(expected.as_slice().ct_eq(provided.as_slice())));

    if matched {
        Ok(())
    } else {
        Err(BillingError::InvalidWebhookSignature {
            reason: "no matching v1 signature".to_string(),
        })
    }
}

/// Build a signature header for `payload`, as the provider would.
pub fn sign_payload(
    secret: &str,
    payload: &[u8],
    timestamp: i64,
) -> std::result::Result<String, BillingError> {
    let mac = compute_signature(secret, timestamp, payload)?;
    Ok(format!("t={},v1={}", timestamp, hex::encode(mac)))
}

struct SignatureParts {
    timestamp: i64,
    signatures: Vec<String>,
}

fn parse_signature_header(header: &str) -> std::result::Result<SignatureParts, BillingError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            return Err(BillingError::InvalidWebhookSignature {
                reason: "invalid signature header format".to_string(),
            });
        };
        match key.trim() {
            "t" => timestamp = value.trim().parse::<i64>().ok(),
            "v1" => signatures.push(value.trim().to_string()),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| BillingError::InvalidWebhookSignature {
        reason: "missing timestamp".to_string(),
    })?;
    if signatures.is_empty() {
        return Err(BillingError::InvalidWebhookSignature {
            reason: "missing v1 signature".to_string(),
        });
    }
    Ok(SignatureParts {
        timestamp,
        signatures,
    })
}

/// HMAC-SHA256 over `"{timestamp}.{payload}"`, using the raw payload bytes.
fn compute_signature(
    secret: &str,
    timestamp: i64,
    payload: &[u8],
) -> std::result::Result<Vec<u8>, BillingError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| BillingError::Internal {
            message: "HMAC key rejected".to_string(),
        })?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::memory::test::UnavailableStore;
    use crate::billing::memory::InMemoryStore;
    use crate::billing::operator::test::RecordingOperatorChannel;
    use crate::billing::storage::{Subscription, SubscriptionStatus, SubscriptionStore};
    use crate::billing::tiers::Tier;
    use crate::cache::InMemoryCache;
    use crate::traits::Cache;
    use serde_json::json;

    const SECRET: &str = "whsec_test_secret";

    fn reconciler(store: &InMemoryStore) -> WebhookReconciler {
        WebhookReconciler::new(
            SubscriptionStateStore::new(Arc::new(store.clone())),
            Arc::new(store.clone()),
        )
        .with_secret(Some(SecretString::from(SECRET)))
    }

    fn checkout_event(id: &str, created: i64) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": id,
            "type": "checkout.session.completed",
            "created": created,
            "data": {"object": {
                "client_reference_id": "S",
                "customer": "cus_1",
                "subscription": "sub_1",
                "metadata": {"tier": "pro"}
            }}
        }))
        .unwrap()
    }

    async fn stored(store: &InMemoryStore) -> Subscription {
        store.get_subscription("S").await.unwrap().unwrap()
    }

    fn signed(payload: &[u8]) -> String {
        sign_payload(SECRET, payload, chrono::Utc::now().timestamp()).unwrap()
    }

    #[test]
    fn test_signature_roundtrip() {
        let secret = SecretString::from(SECRET);
        let header = sign_payload(SECRET, b"{}", 1_000).unwrap();
        assert!(verify_signature(&secret, b"{}", &header, 1_010, 300).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let secret = SecretString::from(SECRET);
        let header = sign_payload(SECRET, b"{\"a\":1}", 1_000).unwrap();
        assert!(matches!(
            verify_signature(&secret, b"{\"a\":2}", &header, 1_000, 300),
            Err(BillingError::InvalidWebhookSignature { .. })
        ));
    }

    #[test]
    fn test_timestamp_tolerance() {
        let secret = SecretString::from(SECRET);
        let header = sign_payload(SECRET, b"{}", 1_000).unwrap();
        assert!(matches!(
            verify_signature(&secret, b"{}", &header, 1_301, 300),
            Err(BillingError::WebhookTimestampOutOfTolerance { age_seconds: 301 })
        ));
        assert!(matches!(
            verify_signature(&secret, b"{}", &header, 900, 300),
            Err(BillingError::WebhookTimestampOutOfTolerance { .. })
        ));
    }

    #[test]
    fn test_any_v1_entry_may_match() {
        let secret = SecretString::from(SECRET);
        let valid = sign_payload(SECRET, b"{}", 1_000).unwrap();
        let v1 = valid.split_once("v1=").unwrap().1;
        let header = format!("t=1000,v1=deadbeef,v1={}", v1);
        assert!(verify_signature(&secret, b"{}", &header, 1_000, 300).is_ok());
    }

    #[test]
    fn test_malformed_header_rejected() {
        let secret = SecretString::from(SECRET);
        assert!(verify_signature(&secret, b"{}", "garbage", 0, 300).is_err());
        assert!(verify_signature(&secret, b"{}", "t=1,v0=abc", 1, 300).is_err());
        assert!(verify_signature(&secret, b"{}", "v1=abc", 1, 300).is_err());
    }

    #[tokio::test]
    async fn test_missing_secret_is_signature_error() {
        let store = InMemoryStore::new();
        let reconciler = reconciler(&store).with_secret(None);
        let payload = checkout_event("evt_1", 10);

        let err = reconciler
            .ingest(&payload, Some(&signed(&payload)))
            .await
            .unwrap_err();
        assert!(matches!(err, TollgateError::SignatureInvalid(_)));
        assert_eq!(store.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_header_rejected() {
        let store = InMemoryStore::new();
        let payload = checkout_event("evt_1", 10);
        let err = reconciler(&store).ingest(&payload, None).await.unwrap_err();
        assert!(matches!(err, TollgateError::SignatureInvalid(_)));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_applied_once() {
        let store = InMemoryStore::new();
        let reconciler = reconciler(&store);
        let payload = checkout_event("evt_1", 10);

        let first = reconciler
            .ingest(&payload, Some(&signed(&payload)))
            .await
            .unwrap();
        assert_eq!(first.outcome, WebhookOutcome::Applied);
        let after_first = stored(&store).await;

        let second = reconciler
            .ingest(&payload, Some(&signed(&payload)))
            .await
            .unwrap();
        assert_eq!(second.outcome, WebhookOutcome::AlreadyProcessed);

        let after_second = stored(&store).await;
        assert_eq!(after_first, after_second);
        assert_eq!(store.subscription_count(), 1);
        assert_eq!(after_second.tier, Tier::Pro);
        assert_eq!(after_second.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_unknown_event_type_acknowledged() {
        let store = InMemoryStore::new();
        let payload = serde_json::to_vec(&json!({
            "id": "evt_x",
            "type": "charge.refunded",
            "created": 1,
            "data": {"object": {}}
        }))
        .unwrap();

        let ack = reconciler(&store)
            .ingest(&payload, Some(&signed(&payload)))
            .await
            .unwrap();
        assert_eq!(ack.outcome, WebhookOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_unparseable_envelope_is_bad_request() {
        let store = InMemoryStore::new();
        let payload = b"{\"not\":\"an event\"}".to_vec();
        let err = reconciler(&store)
            .ingest(&payload, Some(&signed(&payload)))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_invalid_payload_fails_to_operator() {
        let store = InMemoryStore::new();
        let operator = Arc::new(RecordingOperatorChannel::new());
        let reconciler = reconciler(&store).with_operator(operator.clone());
        let payload = serde_json::to_vec(&json!({
            "id": "evt_bad",
            "type": "checkout.session.completed",
            "created": 1,
            "data": {"object": {"metadata": {"tier": "pro"}}}
        }))
        .unwrap();

        let ack = reconciler
            .ingest(&payload, Some(&signed(&payload)))
            .await
            .unwrap();
        assert_eq!(ack.outcome, WebhookOutcome::Failed);

        let alerts = operator.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].event_id, "evt_bad");

        let record = store.get_event("evt_bad").await.unwrap().unwrap();
        assert!(!record.is_processed());
        assert_eq!(record.outcome, Some(EventOutcome::Failed));
    }

    fn unavailable_reconciler(policy: WebhookAckPolicy) -> WebhookReconciler {
        WebhookReconciler::new(
            SubscriptionStateStore::new(Arc::new(UnavailableStore)),
            Arc::new(UnavailableStore),
        )
        .with_secret(Some(SecretString::from(SECRET)))
        .with_operator(Arc::new(RecordingOperatorChannel::new()))
        .with_ack_policy(policy)
    }

    #[tokio::test]
    async fn test_store_outage_acknowledged_by_default() {
        let payload = checkout_event("evt_1", 10);
        let ack = unavailable_reconciler(WebhookAckPolicy::AlwaysAcknowledge)
            .ingest(&payload, Some(&signed(&payload)))
            .await
            .unwrap();
        assert_eq!(ack.outcome, WebhookOutcome::Failed);
    }

    #[tokio::test]
    async fn test_store_outage_retried_under_retry_transient() {
        let payload = checkout_event("evt_1", 10);
        let err = unavailable_reconciler(WebhookAckPolicy::RetryTransient)
            .ingest(&payload, Some(&signed(&payload)))
            .await
            .unwrap_err();
        assert!(matches!(err, TollgateError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_applied_event_invalidates_entitlements_cache() {
        let store = InMemoryStore::new();
        let backend = Arc::new(InMemoryCache::default());
        backend
            .set_bytes("entitlements:S", b"{}".to_vec(), None)
            .await
            .unwrap();
        backend
            .set_bytes("entitlements:S2", b"{}".to_vec(), None)
            .await
            .unwrap();
        let reconciler = reconciler(&store).with_cache(ReadThroughCache::new(backend.clone()));

        let payload = checkout_event("evt_1", 10);
        reconciler
            .ingest(&payload, Some(&signed(&payload)))
            .await
            .unwrap();

        assert!(backend.get_bytes("entitlements:S").await.unwrap().is_none());
        assert!(backend.get_bytes("entitlements:S2").await.unwrap().is_some());
    }

    #[test]
    fn test_ack_policy_from_str() {
        assert_eq!(
            "retry_transient".parse::<WebhookAckPolicy>().unwrap(),
            WebhookAckPolicy::RetryTransient
        );
        assert_eq!(
            "always".parse::<WebhookAckPolicy>().unwrap(),
            WebhookAckPolicy::AlwaysAcknowledge
        );
        assert!("sometimes".parse::<WebhookAckPolicy>().is_err());
    }
}
