//! Billing portal session creation.

use super::checkout::CheckoutConfig;
use super::client::{PortalProvider, PortalSession};
use super::error::BillingError;
use super::subscription::SubscriptionStateStore;
use crate::error::Result;
use serde::Deserialize;
use std::sync::Arc;
use validator::Validate;

/// Portal request body.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PortalRequest {
    #[validate(length(min = 1, max = 255, message = "subjectId is required"))]
    pub subject_id: String,
    /// Overrides the configured return URL.
    pub return_url: Option<String>,
}

/// Checkout/Portal Session Factory, portal half.
///
/// Lets a subscribed subject manage payment methods, plan and cancellation
/// on the provider's hosted page.
pub struct PortalManager {
    subscriptions: SubscriptionStateStore,
    client: Option<Arc<dyn PortalProvider>>,
    return_url: String,
    redirects: CheckoutConfig,
}

impl PortalManager {
    /// `redirects` supplies the redirect-domain allowlist.
    #[must_use]
    pub fn new(
        subscriptions: SubscriptionStateStore,
        return_url: impl Into<String>,
        redirects: CheckoutConfig,
    ) -> Self {
        Self {
            subscriptions,
            client: None,
            return_url: return_url.into(),
            redirects,
        }
    }

    #[must_use]
    pub fn with_client(mut self, client: Arc<dyn PortalProvider>) -> Self {
        self.client = Some(client);
        self
    }

    /// Create a portal session for the subject's active subscription.
    pub async fn create_portal_session(&self, request: PortalRequest) -> Result<PortalSession> {
        request.validate()?;

        let return_url = request
            .return_url
            .unwrap_or_else(|| self.return_url.clone());
        self.redirects.validate_redirect_url(&return_url)?;

        let no_subscription = || BillingError::NoActiveSubscription {
            subject_id: request.subject_id.clone(),
        };
        let customer_id = self
            .subscriptions
            .get_active_subscription(&request.subject_id)
            .await?
            .ok_or_else(no_subscription)?
            .provider_customer_id
            .ok_or_else(no_subscription)?;

        let client = self
            .client
            .as_ref()
            .ok_or_else(|| BillingError::ProviderNotConfigured {
                what: "payment client".to_string(),
            })?;

        client.create_portal_session(&customer_id, &return_url).await
    }
}
