//! Tiers, gated features and the tier → feature → limit table.

use super::error::BillingError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Subscription level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Pro,
    Business,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Free, Tier::Pro, Tier::Business];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Business => "business",
        }
    }

    /// Tiers that can be bought through checkout.
    pub fn is_purchasable(&self) -> bool {
        matches!(self, Self::Pro | Self::Business)
    }
}

impl FromStr for Tier {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            "business" => Ok(Self::Business),
            _ => Err(BillingError::InvalidTier { tier: s.to_string() }),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Billing interval of a paid plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Month,
    Year,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Month => "month",
            Self::Year => "year",
        }
    }

    pub fn months(&self) -> u32 {
        match self {
            Self::Month => 1,
            Self::Year => 12,
        }
    }
}

impl FromStr for BillingInterval {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "month" => Ok(Self::Month),
            "year" => Ok(Self::Year),
            _ => Err(BillingError::InvalidInterval {
                interval: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Window over which a usage counter accumulates before resetting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaPeriod {
    /// Calendar day in UTC.
    Daily,
    /// The subscription's current billing period, or the calendar month without one.
    BillingPeriod,
}

/// A quota-gated action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    ComparisonsDaily,
    ExportsMonthly,
    SavedSearchesMonthly,
}

impl Feature {
    pub const ALL: [Feature; 3] = [
        Feature::ComparisonsDaily,
        Feature::ExportsMonthly,
        Feature::SavedSearchesMonthly,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Self::ComparisonsDaily => "comparisons_daily",
            Self::ExportsMonthly => "exports_monthly",
            Self::SavedSearchesMonthly => "saved_searches_monthly",
        }
    }

    pub fn period(&self) -> QuotaPeriod {
        match self {
            Self::ComparisonsDaily => QuotaPeriod::Daily,
            Self::ExportsMonthly | Self::SavedSearchesMonthly => QuotaPeriod::BillingPeriod,
        }
    }

    /// Plural noun used in user-facing messages.
    pub fn noun(&self) -> &'static str {
        match self {
            Self::ComparisonsDaily => "comparisons",
            Self::ExportsMonthly => "exports",
            Self::SavedSearchesMonthly => "saved searches",
        }
    }
}

impl FromStr for Feature {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|f| f.key() == s.trim())
            .ok_or_else(|| BillingError::UnknownFeature {
                feature: s.to_string(),
            })
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Resolved limit for one (tier, feature) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Unlimited,
    Max(u64),
}

impl Limit {
    /// `-1` is unlimited, any other negative value is rejected.
    pub fn from_raw(value: i64) -> Result<Self, BillingError> {
        match value {
            -1 => Ok(Self::Unlimited),
            v if v >= 0 => Ok(Self::Max(v as u64)),
            v => Err(BillingError::InvalidLimit { value: v }),
        }
    }

    pub fn as_raw(&self) -> i64 {
        match self {
            Self::Unlimited => -1,
            Self::Max(n) => i64::try_from(*n).unwrap_or(i64::MAX),
        }
    }
}

/// Explicit tier → feature → limit map.
///
/// Pairs absent from the table resolve to `Limit::Max(0)`, so a feature
/// that was never granted to a tier is denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitTable {
    limits: HashMap<(Tier, Feature), Limit>,
}

impl LimitTable {
    pub fn builder() -> LimitTableBuilder {
        LimitTableBuilder::new()
    }

    pub fn limit(&self, tier: Tier, feature: Feature) -> Limit {
        self.limits
            .get(&(tier, feature))
            .copied()
            .unwrap_or(Limit::Max(0))
    }
}

impl Default for LimitTable {
    fn default() -> Self {
        let mut limits = HashMap::new();
        let rows = [
            (Feature::ComparisonsDaily, [3, 50, -1]),
            (Feature::ExportsMonthly, [1, 25, -1]),
            (Feature::SavedSearchesMonthly, [5, 100, -1]),
        ];
        for (feature, per_tier) in rows {
            for (tier, raw) in Tier::ALL.into_iter().zip(per_tier) {
                let limit = if raw < 0 {
                    Limit::Unlimited
                } else {
                    Limit::Max(raw as u64)
                };
                limits.insert((tier, feature), limit);
            }
        }
        Self { limits }
    }
}

/// Builder for LimitTable, starting from the defaults.
#[must_use = "builder does nothing until you call build()"]
pub struct LimitTableBuilder {
    limits: HashMap<(Tier, Feature), i64>,
}

impl LimitTableBuilder {
    pub fn new() -> Self {
        let defaults = LimitTable::default();
        Self {
            limits: defaults
                .limits
                .into_iter()
                .map(|(k, v)| (k, v.as_raw()))
                .collect(),
        }
    }

    /// Start from an empty table, where every pair is denied until set.
    pub fn empty() -> Self {
        Self {
            limits: HashMap::new(),
        }
    }

    pub fn limit(mut self, tier: Tier, feature: Feature, value: i64) -> Self {
        self.limits.insert((tier, feature), value);
        self
    }

    pub fn build(self) -> Result<LimitTable, BillingError> {
        let limits = self
            .limits
            .into_iter()
            .map(|(k, raw)| Limit::from_raw(raw).map(|l| (k, l)))
            .collect::<Result<_, _>>()?;
        Ok(LimitTable { limits })
    }
}

impl Default for LimitTableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Provider price identifiers for each purchasable (tier, interval).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriceTable {
    prices: HashMap<(Tier, BillingInterval), String>,
}

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_price(
        mut self,
        tier: Tier,
        interval: BillingInterval,
        price_id: impl Into<String>,
    ) -> Self {
        self.prices.insert((tier, interval), price_id.into());
        self
    }

    pub fn price_for(&self, tier: Tier, interval: BillingInterval) -> Option<&str> {
        self.prices.get(&(tier, interval)).map(String::as_str)
    }

    /// Reverse lookup, used when a subscription event names a price but not a tier.
    pub fn tier_for_price(&self, price_id: &str) -> Option<Tier> {
        self.prices
            .iter()
            .find(|(_, id)| id.as_str() == price_id)
            .map(|((tier, _), _)| *tier)
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tier_and_interval() {
        assert_eq!("Pro".parse::<Tier>().unwrap(), Tier::Pro);
        assert_eq!("business".parse::<Tier>().unwrap(), Tier::Business);
        assert!("enterprise".parse::<Tier>().is_err());

        assert_eq!("year".parse::<BillingInterval>().unwrap(), BillingInterval::Year);
        assert!(matches!(
            "week".parse::<BillingInterval>(),
            Err(BillingError::InvalidInterval { .. })
        ));
    }

    #[test]
    fn test_only_paid_tiers_purchasable() {
        assert!(!Tier::Free.is_purchasable());
        assert!(Tier::Pro.is_purchasable());
        assert!(Tier::Business.is_purchasable());
    }

    #[test]
    fn test_feature_keys_roundtrip_through_from_str() {
        for feature in Feature::ALL {
            assert_eq!(feature.key().parse::<Feature>().unwrap(), feature);
        }
        assert!(matches!(
            "teleports_daily".parse::<Feature>(),
            Err(BillingError::UnknownFeature { .. })
        ));
    }

    #[test]
    fn test_default_limits() {
        let table = LimitTable::default();
        assert_eq!(table.limit(Tier::Free, Feature::ComparisonsDaily), Limit::Max(3));
        assert_eq!(table.limit(Tier::Pro, Feature::ExportsMonthly), Limit::Max(25));
        assert_eq!(
            table.limit(Tier::Business, Feature::ComparisonsDaily),
            Limit::Unlimited
        );
    }

    #[test]
    fn test_missing_pair_denies() {
        let table = LimitTableBuilder::empty()
            .limit(Tier::Free, Feature::ComparisonsDaily, 3)
            .build()
            .unwrap();
        assert_eq!(table.limit(Tier::Free, Feature::ComparisonsDaily), Limit::Max(3));
        assert_eq!(table.limit(Tier::Pro, Feature::ExportsMonthly), Limit::Max(0));
    }

    #[test]
    fn test_builder_rejects_bad_negative() {
        let err = LimitTable::builder()
            .limit(Tier::Pro, Feature::ExportsMonthly, -5)
            .build()
            .unwrap_err();
        assert_eq!(err, BillingError::InvalidLimit { value: -5 });
    }

    #[test]
    fn test_price_table_reverse_lookup() {
        let prices = PriceTable::new()
            .with_price(Tier::Pro, BillingInterval::Month, "price_pro_m")
            .with_price(Tier::Business, BillingInterval::Year, "price_biz_y");

        assert_eq!(prices.price_for(Tier::Pro, BillingInterval::Month), Some("price_pro_m"));
        assert_eq!(prices.price_for(Tier::Pro, BillingInterval::Year), None);
        assert_eq!(prices.tier_for_price("price_biz_y"), Some(Tier::Business));
        assert_eq!(prices.tier_for_price("price_unknown"), None);
    }
}
