//! Live payment provider client.
//!
//! Stripe-compatible client built on `async-stripe` with retry logic, secure
//! API key handling and error mapping to [`BillingError`].

use crate::error::{Result, TollgateError};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

use super::client::{
    CheckoutProvider, CheckoutSession, CreateCheckoutSessionRequest, PortalProvider,
    PortalSession,
};
use super::error::BillingError;

/// Configuration for the live client.
#[derive(Debug, Clone)]
pub struct LiveStripeClientConfig {
    /// Maximum number of retry attempts for transient failures.
    pub max_retries: u32,
    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Request timeout in seconds.
    pub timeout_seconds: u64,
}

impl Default for LiveStripeClientConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            timeout_seconds: 30,
        }
    }
}

impl LiveStripeClientConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    #[must_use]
    pub fn base_delay_ms(mut self, ms: u64) -> Self {
        self.base_delay_ms = ms;
        self
    }

    #[must_use]
    pub fn max_delay_ms(mut self, ms: u64) -> Self {
        self.max_delay_ms = ms;
        self
    }

    #[must_use]
    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

/// Validate a provider secret key format.
///
/// Accepts secret (`sk_`) and restricted (`rk_`) keys in test or live mode.
fn validate_api_key(key: &str) -> std::result::Result<(), BillingError> {
    const MIN_KEY_LENGTH: usize = 20;

    let invalid = |reason: String| BillingError::ProviderNotConfigured {
        what: format!("API key ({})", reason),
    };

    if key.is_empty() {
        return Err(invalid("empty".to_string()));
    }
    if key.len() < MIN_KEY_LENGTH {
        return Err(invalid(format!(
            "shorter than {} characters",
            MIN_KEY_LENGTH
        )));
    }
    let valid_prefixes = ["sk_test_", "sk_live_", "rk_test_", "rk_live_"];
    if !valid_prefixes.iter().any(|prefix| key.starts_with(prefix)) {
        return Err(invalid(
            "must start with sk_test_, sk_live_, rk_test_ or rk_live_".to_string(),
        ));
    }

    Ok(())
}

#[inline]
fn parse_customer_id(id: &str) -> Result<stripe::CustomerId> {
    id.parse()
        .map_err(|_| TollgateError::bad_request(format!("Invalid customer ID: {}", id)))
}

/// Live client for production use.
///
/// Mutating calls carry an idempotency key so retries never open two sessions.
#[derive(Clone)]
pub struct LiveStripeClient {
    client: stripe::Client,
    config: LiveStripeClientConfig,
    api_key: SecretString,
}

impl LiveStripeClient {
    /// Create a new live client.
    ///
    /// # Errors
    ///
    /// Returns `ProviderNotConfigured` if the API key format is invalid.
    pub fn new(
        api_key: SecretString,
        config: LiveStripeClientConfig,
    ) -> std::result::Result<Self, BillingError> {
        validate_api_key(api_key.expose_secret())?;

        let client = stripe::Client::new(api_key.expose_secret()).with_app_info(
            "tollgate".to_string(),
            Some(env!("CARGO_PKG_VERSION").to_string()),
            None,
        );

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    pub fn with_default_config(api_key: SecretString) -> std::result::Result<Self, BillingError> {
        Self::new(api_key, LiveStripeClientConfig::default())
    }

    #[must_use]
    pub fn is_test_mode(&self) -> bool {
        let key = self.api_key.expose_secret();
        key.starts_with("sk_test_") || key.starts_with("rk_test_")
    }

    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds)
    }

    #[inline]
    fn generate_idempotency_key(operation: &str) -> String {
        format!("{}_{}", operation, uuid::Uuid::new_v4())
    }

    #[inline]
    fn idempotent_client(&self, operation: &str) -> stripe::Client {
        let key = Self::generate_idempotency_key(operation);
        self.client
            .clone()
            .with_strategy(stripe::RequestStrategy::Idempotent(key))
    }
}

impl std::fmt::Debug for LiveStripeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveStripeClient")
            .field("config", &self.config)
            .field("is_test_mode", &self.is_test_mode())
            .finish_non_exhaustive()
    }
}

/// Execute a provider call with a timeout, retrying 429, 5xx and timeouts.
async fn with_retry<T, F, Fut>(
    config: &LiveStripeClientConfig,
    operation: &str,
    operation_fn: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, stripe::StripeError>>,
{
    let timeout_duration = Duration::from_secs(config.timeout_seconds);
    let mut attempts = 0;

    loop {
        match tokio::time::timeout(timeout_duration, operation_fn()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => {
                if !is_retryable_error(&e) || attempts >= config.max_retries {
                    return Err(map_stripe_error(e, operation));
                }
                log_retry(operation, attempts, &e, config);
                sleep_with_backoff(attempts, config).await;
                attempts += 1;
            }
            Err(_elapsed) => {
                if attempts >= config.max_retries {
                    return Err(BillingError::ProviderApiError {
                        operation: operation.to_string(),
                        message: format!(
                            "Request timed out after {} seconds",
                            config.timeout_seconds
                        ),
                        http_status: Some(408),
                    }
                    .into());
                }

                tracing::warn!(
                    target: "tollgate::provider",
                    operation = operation,
                    attempt = attempts + 1,
                    timeout_seconds = config.timeout_seconds,
                    "Provider request timed out, retrying"
                );
                sleep_with_backoff(attempts, config).await;
                attempts += 1;
            }
        }
    }
}

fn log_retry(
    operation: &str,
    attempts: u32,
    error: &stripe::StripeError,
    config: &LiveStripeClientConfig,
) {
    let delay = calculate_backoff_delay(attempts, config.base_delay_ms, config.max_delay_ms);
    tracing::warn!(
        target: "tollgate::provider",
        operation = operation,
        attempt = attempts + 1,
        delay_ms = delay.as_millis() as u64,
        error = %error,
        "Retrying provider call after transient error"
    );
}

async fn sleep_with_backoff(attempts: u32, config: &LiveStripeClientConfig) {
    let delay = calculate_backoff_delay(attempts, config.base_delay_ms, config.max_delay_ms);
    tokio::time::sleep(delay).await;
}

fn is_retryable_error(error: &stripe::StripeError) -> bool {
    match error {
        stripe::StripeError::Stripe(request_error) => {
            let status = request_error.http_status;
            status == 429 || (500..600).contains(&status)
        }
        stripe::StripeError::Timeout => true,
        _ => false,
    }
}

/// Exponential backoff with up to 25% jitter, capped at `max_ms`.
fn calculate_backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let delay_ms = base_ms.saturating_mul(2_u64.saturating_pow(attempt));
    let delay_ms = delay_ms.min(max_ms);

    let jitter = if delay_ms > 0 {
        fastrand::u64(0..=delay_ms / 4)
    } else {
        0
    };
    Duration::from_millis(delay_ms.saturating_add(jitter))
}

fn map_stripe_error(error: stripe::StripeError, operation: &str) -> TollgateError {
    let billing = match error {
        stripe::StripeError::Stripe(request_error) => BillingError::ProviderApiError {
            operation: operation.to_string(),
            message: request_error
                .message
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string()),
            http_status: Some(request_error.http_status),
        },
        stripe::StripeError::Timeout => BillingError::ProviderApiError {
            operation: operation.to_string(),
            message: "Request timed out".to_string(),
            http_status: Some(408),
        },
        stripe::StripeError::ClientError(msg) => BillingError::ProviderApiError {
            operation: operation.to_string(),
            message: format!("HTTP client error: {msg}"),
            http_status: None,
        },
        stripe::StripeError::QueryStringSerialize(e) => BillingError::Internal {
            message: format!("Failed to serialize request: {e}"),
        },
        stripe::StripeError::JSONSerialize(e) => BillingError::Internal {
            message: format!("Failed to serialize JSON: {e}"),
        },
        stripe::StripeError::UnsupportedVersion => BillingError::Internal {
            message: "Unsupported provider API version".to_string(),
        },
    };
    billing.into()
}

#[async_trait]
impl CheckoutProvider for LiveStripeClient {
    async fn create_checkout_session(
        &self,
        request: CreateCheckoutSessionRequest,
    ) -> Result<CheckoutSession> {
        let client = self.idempotent_client("create_checkout_session");
        let metadata = request.metadata();

        let mut params = stripe::CreateCheckoutSession::new();
        params.mode = Some(stripe::CheckoutSessionMode::Subscription);
        params.client_reference_id = Some(&request.subject_id);
        match &request.customer_id {
            Some(id) => params.customer = Some(parse_customer_id(id)?),
            None => params.customer_email = Some(&request.email),
        }
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.line_items = Some(vec![stripe::CreateCheckoutSessionLineItems {
            price: Some(request.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.subscription_data = Some(stripe::CreateCheckoutSessionSubscriptionData {
            trial_period_days: request.trial_period_days,
            metadata: Some(metadata.clone()),
            ..Default::default()
        });
        params.metadata = Some(metadata);

        // The provider rejects explicit discounts combined with promotion codes.
        match &request.provider_coupon_id {
            Some(coupon) => {
                params.discounts = Some(vec![stripe::CreateCheckoutSessionDiscounts {
                    coupon: Some(coupon.clone()),
                    ..Default::default()
                }]);
            }
            None => params.allow_promotion_codes = Some(request.allow_promotion_codes),
        }

        let session = with_retry(&self.config, "create_checkout_session", || {
            let client = client.clone();
            let params = params.clone();
            async move { stripe::CheckoutSession::create(&client, params).await }
        })
        .await?;

        Ok(CheckoutSession {
            session_id: session.id.to_string(),
            url: session.url.ok_or_else(|| BillingError::ProviderApiError {
                operation: "create_checkout_session".to_string(),
                message: "Checkout session URL missing".to_string(),
                http_status: None,
            })?,
        })
    }
}

#[async_trait]
impl PortalProvider for LiveStripeClient {
    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<PortalSession> {
        let customer_id = parse_customer_id(customer_id)?;

        let mut params = stripe::CreateBillingPortalSession::new(customer_id);
        params.return_url = Some(return_url);

        let session = with_retry(&self.config, "create_portal_session", || {
            let client = self.client.clone();
            let params = params.clone();
            async move { stripe::BillingPortalSession::create(&client, params).await }
        })
        .await?;

        Ok(PortalSession { url: session.url })
    }
}
