//! Payment provider client traits.
//!
//! The provider is opaque: it turns requests into hosted-session URLs.
//! `LiveStripeClient` (feature `billing-live`) is the production implementation.

use super::tiers::{BillingInterval, Tier};
use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;

/// Everything the provider needs to open a subscription checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCheckoutSessionRequest {
    pub subject_id: String,
    pub email: String,
    /// Existing provider customer to reuse, if the subject has one.
    pub customer_id: Option<String>,
    pub price_id: String,
    pub tier: Tier,
    pub interval: BillingInterval,
    pub success_url: String,
    pub cancel_url: String,
    pub trial_period_days: Option<u32>,
    pub provider_coupon_id: Option<String>,
    pub allow_promotion_codes: bool,
}

impl CreateCheckoutSessionRequest {
    /// Metadata echoed back on `checkout.session.completed`.
    #[must_use]
    pub fn metadata(&self) -> HashMap<String, String> {
        let mut metadata = HashMap::new();
        metadata.insert("subject_id".to_string(), self.subject_id.clone());
        metadata.insert("tier".to_string(), self.tier.as_str().to_string());
        metadata.insert("interval".to_string(), self.interval.as_str().to_string());
        if let Some(days) = self.trial_period_days {
            metadata.insert("trial_days".to_string(), days.to_string());
        }
        metadata
    }
}

/// Hosted checkout session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSession {
    pub session_id: String,
    pub url: String,
}

/// Hosted billing portal session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortalSession {
    pub url: String,
}

#[async_trait]
pub trait CheckoutProvider: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSession>;
}

#[async_trait]
pub trait PortalProvider: Send + Sync {
    async fn create_portal_session(&self, customer_id: &str, return_url: &str)
        -> Result<PortalSession>;
}

/// A client that opens both kinds of session.
pub trait PaymentProvider: CheckoutProvider + PortalProvider {}

impl<T> PaymentProvider for T where T: CheckoutProvider + PortalProvider {}

/// Mock provider client for testing.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use crate::billing::error::BillingError;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Returns predictable session URLs and records every checkout request.
    #[derive(Default)]
    pub struct MockPaymentProvider {
        session_counter: AtomicU64,
        checkout_requests: Mutex<Vec<CreateCheckoutSessionRequest>>,
        portal_requests: Mutex<Vec<(String, String)>>,
        fail_with: Option<String>,
    }

    impl MockPaymentProvider {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// A provider whose every call fails with `message`.
        #[must_use]
        pub fn failing(message: impl Into<String>) -> Self {
            Self {
                fail_with: Some(message.into()),
                ..Self::default()
            }
        }

        pub fn checkout_requests(&self) -> Vec<CreateCheckoutSessionRequest> {
            self.checkout_requests.lock().unwrap().clone()
        }

        pub fn portal_requests(&self) -> Vec<(String, String)> {
            self.portal_requests.lock().unwrap().clone()
        }

        fn check_failure(&self, operation: &str) -> Result<()> {
            match &self.fail_with {
                Some(message) => Err(BillingError::ProviderApiError {
                    operation: operation.to_string(),
                    message: message.clone(),
                    http_status: Some(502),
                }
                .into()),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl CheckoutProvider for MockPaymentProvider {
        async fn create_checkout_session(
            &self,
            request: CreateCheckoutSessionRequest,
        ) -> Result<CheckoutSession> {
            self.check_failure("create_checkout_session")?;
            self.checkout_requests.lock().unwrap().push(request);
            let id = format!(
                "cs_mock_{}",
                self.session_counter.fetch_add(1, Ordering::SeqCst)
            );
            Ok(CheckoutSession {
                url: format!("https://checkout.example.com/pay/{}", id),
                session_id: id,
            })
        }
    }

    #[async_trait]
    impl PortalProvider for MockPaymentProvider {
        async fn create_portal_session(
            &self,
            customer_id: &str,
            return_url: &str,
        ) -> Result<PortalSession> {
            self.check_failure("create_portal_session")?;
            self.portal_requests
                .lock()
                .unwrap()
                .push((customer_id.to_string(), return_url.to_string()));
            Ok(PortalSession {
                url: format!("https://billing.example.com/session/{}", customer_id),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_metadata_round_trips_to_webhook_fields() {
        let request = CreateCheckoutSessionRequest {
            subject_id: "S".to_string(),
            email: "s@example.com".to_string(),
            customer_id: None,
            price_id: "price_pro_m".to_string(),
            tier: Tier::Pro,
            interval: BillingInterval::Year,
            success_url: "https://app.example.com/ok".to_string(),
            cancel_url: "https://app.example.com/cancel".to_string(),
            trial_period_days: Some(7),
            provider_coupon_id: None,
            allow_promotion_codes: false,
        };
        let metadata = request.metadata();
        assert_eq!(metadata["subject_id"], "S");
        assert_eq!(metadata["tier"], "pro");
        assert_eq!(metadata["interval"], "year");
        assert_eq!(metadata["trial_days"], "7");
    }

    #[test]
    fn test_checkout_session_serializes_camel_case() {
        let session = CheckoutSession {
            session_id: "cs_1".to_string(),
            url: "https://x".to_string(),
        };
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["sessionId"], "cs_1");
    }
}
