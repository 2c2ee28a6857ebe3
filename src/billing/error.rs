//! Billing-specific error types.
//!
//! Carry more context than `TollgateError` and convert into it for HTTP responses.

use std::fmt;

/// Why a coupon code was refused at checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CouponRejection {
    Unknown,
    Inactive,
    Expired,
}

impl CouponRejection {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "does not exist",
            Self::Inactive => "is no longer active",
            Self::Expired => "has expired",
        }
    }
}

/// Billing-specific errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    // Validation errors
    /// Tier is not one of the purchasable tiers.
    InvalidTier { tier: String },
    /// Billing interval is not `month` or `year`.
    InvalidInterval { interval: String },
    /// Feature key is not in the limit table.
    UnknownFeature { feature: String },
    /// Coupon missing, inactive or past its validity date.
    InvalidCoupon {
        code: String,
        reason: CouponRejection,
    },
    InvalidRedirectUrl { url: String, reason: String },
    RedirectDomainNotAllowed { domain: String },

    // Subscription errors
    NoActiveSubscription { subject_id: String },
    /// Optimistic write lost repeatedly to concurrent writers.
    ConcurrentModification { subject_id: String },

    // Configuration errors
    /// A provider integration (client, price, secret) is missing.
    ProviderNotConfigured { what: String },
    /// Limit table entry outside the allowed range.
    InvalidLimit { value: i64 },

    // Webhook errors
    WebhookSecretMissing,
    InvalidWebhookSignature { reason: String },
    WebhookTimestampOutOfTolerance { age_seconds: i64 },
    InvalidWebhookPayload { message: String },

    // Provider API errors
    ProviderApiError {
        operation: String,
        message: String,
        http_status: Option<u16>,
    },

    Internal { message: String },
}

impl fmt::Display for BillingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTier { tier } => {
                write!(f, "Invalid tier '{}': expected 'pro' or 'business'", tier)
            }
            Self::InvalidInterval { interval } => {
                write!(f, "Invalid interval '{}': expected 'month' or 'year'", interval)
            }
            Self::UnknownFeature { feature } => write!(f, "Unknown feature '{}'", feature),
            Self::InvalidCoupon { code, reason } => {
                write!(f, "Coupon '{}' {}", code, reason.as_str())
            }
            Self::InvalidRedirectUrl { url, reason } => {
                write!(f, "Invalid redirect URL '{}': {}", url, reason)
            }
            Self::RedirectDomainNotAllowed { domain } => {
                write!(f, "Redirect domain '{}' is not allowed", domain)
            }
            Self::NoActiveSubscription { subject_id } => {
                write!(f, "No active subscription for '{}'", subject_id)
            }
            Self::ConcurrentModification { subject_id } => {
                write!(f, "Concurrent modification detected for '{}'", subject_id)
            }
            Self::ProviderNotConfigured { what } => {
                write!(f, "Payment provider not configured: {}", what)
            }
            Self::InvalidLimit { value } => {
                write!(f, "Invalid limit {}: use -1 for unlimited or a non-negative count", value)
            }
            Self::WebhookSecretMissing => write!(f, "Webhook secret is not configured"),
            Self::InvalidWebhookSignature { reason } => {
                write!(f, "Invalid webhook signature: {}", reason)
            }
            Self::WebhookTimestampOutOfTolerance { age_seconds } => {
                write!(f, "Webhook timestamp outside tolerance ({} seconds)", age_seconds)
            }
            Self::InvalidWebhookPayload { message } => {
                write!(f, "Invalid webhook payload: {}", message)
            }
            Self::ProviderApiError {
                operation,
                message,
                http_status,
            } => {
                write!(f, "Provider error during '{}': {}", operation, message)?;
                if let Some(status) = http_status {
                    write!(f, " [HTTP {}]", status)?;
                }
                Ok(())
            }
            Self::Internal { message } => write!(f, "Internal billing error: {}", message),
        }
    }
}

impl std::error::Error for BillingError {}

impl From<BillingError> for crate::error::TollgateError {
    fn from(err: BillingError) -> Self {
        use crate::error::TollgateError;

        match &err {
            BillingError::NoActiveSubscription { .. }
            | BillingError::InvalidCoupon {
                reason: CouponRejection::Unknown,
                ..
            } => TollgateError::NotFound(err.to_string()),

            BillingError::InvalidTier { .. }
            | BillingError::InvalidInterval { .. }
            | BillingError::UnknownFeature { .. }
            | BillingError::InvalidCoupon { .. }
            | BillingError::InvalidRedirectUrl { .. }
            | BillingError::RedirectDomainNotAllowed { .. }
            | BillingError::InvalidWebhookPayload { .. } => {
                TollgateError::BadRequest(err.to_string())
            }

            BillingError::WebhookSecretMissing
            | BillingError::InvalidWebhookSignature { .. }
            | BillingError::WebhookTimestampOutOfTolerance { .. } => {
                TollgateError::SignatureInvalid(err.to_string())
            }

            BillingError::ProviderNotConfigured { .. } => {
                TollgateError::ServiceUnavailable(err.to_string())
            }

            BillingError::ProviderApiError { message, .. } => {
                TollgateError::ProviderFailure(message.clone())
            }

            BillingError::ConcurrentModification { .. }
            | BillingError::InvalidLimit { .. }
            | BillingError::Internal { .. } => TollgateError::Internal(err.to_string()),
        }
    }
}

impl BillingError {
    /// Caused by the request itself; retrying unchanged will fail again.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidTier { .. }
                | Self::InvalidInterval { .. }
                | Self::UnknownFeature { .. }
                | Self::InvalidCoupon { .. }
                | Self::InvalidRedirectUrl { .. }
                | Self::RedirectDomainNotAllowed { .. }
                | Self::NoActiveSubscription { .. }
                | Self::WebhookSecretMissing
                | Self::InvalidWebhookSignature { .. }
                | Self::WebhookTimestampOutOfTolerance { .. }
                | Self::InvalidWebhookPayload { .. }
        )
    }

    #[must_use]
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConcurrentModification { .. } => true,
            Self::ProviderApiError { http_status, .. } => {
                matches!(http_status, Some(408) | Some(429) | Some(500..=599))
            }
            _ => false,
        }
    }
}
