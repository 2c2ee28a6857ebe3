use super::checkout::CheckoutConfig;
use super::error::BillingError;
use super::tiers::{BillingInterval, PriceTable, Tier};
use super::webhook::{DEFAULT_TOLERANCE_SECONDS, WebhookAckPolicy};
use crate::utils::{get_env_with_prefix, parse_env_with_prefix};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Provider credentials, prices and redirect settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BillingConfig {
    /// Provider API key. Never serialized.
    #[serde(skip)]
    pub secret_key: Option<SecretString>,

    /// Webhook signing secret. Never serialized.
    #[serde(skip)]
    pub webhook_secret: Option<SecretString>,

    #[serde(default = "default_tolerance_seconds")]
    pub webhook_tolerance_seconds: i64,

    #[serde(default)]
    pub webhook_ack_policy: WebhookAckPolicy,

    #[serde(default)]
    pub prices: PriceIds,

    #[serde(default = "default_success_url")]
    pub success_url: String,

    #[serde(default = "default_cancel_url")]
    pub cancel_url: String,

    #[serde(default = "default_portal_return_url")]
    pub portal_return_url: String,

    /// Empty means any https host.
    #[serde(default)]
    pub allowed_redirect_domains: Vec<String>,

    #[serde(default)]
    pub allow_promotion_codes: bool,
}

/// Provider price IDs per purchasable (tier, interval).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PriceIds {
    pub pro_monthly: Option<String>,
    pub pro_yearly: Option<String>,
    pub business_monthly: Option<String>,
    pub business_yearly: Option<String>,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            secret_key: None,
            webhook_secret: None,
            webhook_tolerance_seconds: default_tolerance_seconds(),
            webhook_ack_policy: WebhookAckPolicy::default(),
            prices: PriceIds::default(),
            success_url: default_success_url(),
            cancel_url: default_cancel_url(),
            portal_return_url: default_portal_return_url(),
            allowed_redirect_domains: Vec::new(),
            allow_promotion_codes: false,
        }
    }
}

impl BillingConfig {
    /// Load billing configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.secret_key = get_env_with_prefix("PAYMENTS_SECRET_KEY").map(SecretString::from);
        config.webhook_secret =
            get_env_with_prefix("PAYMENTS_WEBHOOK_SECRET").map(SecretString::from);

        if let Some(seconds) = parse_env_with_prefix("WEBHOOK_TOLERANCE_SECONDS") {
            config.webhook_tolerance_seconds = seconds;
        }

        if let Some(policy) = get_env_with_prefix("WEBHOOK_ACK_POLICY") {
            match policy.parse() {
                Ok(policy) => config.webhook_ack_policy = policy,
                Err(e) => tracing::warn!(
                    target: "tollgate::webhook",
                    error = %e,
                    "Ignoring WEBHOOK_ACK_POLICY"
                ),
            }
        }

        config.prices = PriceIds {
            pro_monthly: get_env_with_prefix("PRICE_PRO_MONTHLY"),
            pro_yearly: get_env_with_prefix("PRICE_PRO_YEARLY"),
            business_monthly: get_env_with_prefix("PRICE_BUSINESS_MONTHLY"),
            business_yearly: get_env_with_prefix("PRICE_BUSINESS_YEARLY"),
        };

        if let Some(url) = get_env_with_prefix("CHECKOUT_SUCCESS_URL") {
            config.success_url = url;
        }
        if let Some(url) = get_env_with_prefix("CHECKOUT_CANCEL_URL") {
            config.cancel_url = url;
        }
        if let Some(url) = get_env_with_prefix("PORTAL_RETURN_URL") {
            config.portal_return_url = url;
        }

        if let Some(domains) = get_env_with_prefix("CHECKOUT_ALLOWED_REDIRECT_DOMAINS") {
            config.allowed_redirect_domains = domains
                .split(',')
                .map(|d| d.trim().to_lowercase())
                .filter(|d| !d.is_empty())
                .collect();
        }

        if let Some(allow) = parse_env_with_prefix("CHECKOUT_ALLOW_PROMOTION_CODES") {
            config.allow_promotion_codes = allow;
        }

        config
    }

    pub fn price_table(&self) -> PriceTable {
        let entries = [
            (Tier::Pro, BillingInterval::Month, &self.prices.pro_monthly),
            (Tier::Pro, BillingInterval::Year, &self.prices.pro_yearly),
            (Tier::Business, BillingInterval::Month, &self.prices.business_monthly),
            (Tier::Business, BillingInterval::Year, &self.prices.business_yearly),
        ];
        entries
            .into_iter()
            .fold(PriceTable::new(), |table, (tier, interval, id)| match id {
                Some(id) if !id.is_empty() => table.with_price(tier, interval, id.clone()),
                _ => table,
            })
    }

    pub fn checkout_config(&self) -> CheckoutConfig {
        CheckoutConfig::new(&self.success_url, &self.cancel_url)
            .allowed_redirect_domains(self.allowed_redirect_domains.iter().cloned())
            .allow_promotion_codes(self.allow_promotion_codes)
    }

    /// Check the configured default redirect URLs and tolerance.
    ///
    /// Missing secrets are not an error here; the affected endpoints answer 503.
    pub fn validate(&self) -> Result<(), BillingError> {
        if self.webhook_tolerance_seconds <= 0 {
            return Err(BillingError::Internal {
                message: "webhook tolerance must be greater than 0".to_string(),
            });
        }
        let checkout = self.checkout_config();
        checkout.validate_redirect_url(&self.success_url)?;
        checkout.validate_redirect_url(&self.cancel_url)?;
        checkout.validate_redirect_url(&self.portal_return_url)?;
        Ok(())
    }
}

fn default_tolerance_seconds() -> i64 {
    DEFAULT_TOLERANCE_SECONDS
}

fn default_success_url() -> String {
    "http://localhost:3000/billing/success".to_string()
}

fn default_cancel_url() -> String {
    "http://localhost:3000/billing/cancel".to_string()
}

fn default_portal_return_url() -> String {
    "http://localhost:3000/settings/billing".to_string()
}
