//! Price id → (tier, billing cycle) resolution.
//!
//! The catalog is built once from configuration and validated eagerly. A
//! price id that is not in the catalog resolves to the free tier, unless the
//! explicitly enabled test-mode fallback recognises it.

use std::collections::HashMap;

use serde::Serialize;

use numera_shared::{env_flag, env_or, BillingCycle, ConfigError, SubscriptionTier};

/// Result of resolving a price id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedPrice {
    pub tier: SubscriptionTier,
    pub billing_cycle: BillingCycle,
}

impl ResolvedPrice {
    pub const FREE: ResolvedPrice = ResolvedPrice {
        tier: SubscriptionTier::Free,
        billing_cycle: BillingCycle::Monthly,
    };

    pub fn new(tier: SubscriptionTier, billing_cycle: BillingCycle) -> Self {
        Self {
            tier,
            billing_cycle,
        }
    }
}

/// Configured Stripe price ids, one per paid tier and cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceIds {
    pub premium_monthly: String,
    pub premium_yearly: String,
    pub unlimited_monthly: String,
    pub unlimited_yearly: String,
}

impl PriceIds {
    const ENV_KEYS: [(&'static str, SubscriptionTier, BillingCycle); 4] = [
        (
            "STRIPE_PREMIUM_MONTHLY_PRICE_ID",
            SubscriptionTier::Premium,
            BillingCycle::Monthly,
        ),
        (
            "STRIPE_PREMIUM_YEARLY_PRICE_ID",
            SubscriptionTier::Premium,
            BillingCycle::Yearly,
        ),
        (
            "STRIPE_UNLIMITED_MONTHLY_PRICE_ID",
            SubscriptionTier::Unlimited,
            BillingCycle::Monthly,
        ),
        (
            "STRIPE_UNLIMITED_YEARLY_PRICE_ID",
            SubscriptionTier::Unlimited,
            BillingCycle::Yearly,
        ),
    ];

    /// Load all four price ids, reporting every missing key at once
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut values = Vec::with_capacity(Self::ENV_KEYS.len());
        let mut missing = Vec::new();

        for (key, _, _) in Self::ENV_KEYS {
            match lookup(key).map(|v| v.trim().to_string()) {
                Some(value) if !value.is_empty() => values.push(value),
                _ => missing.push(key.to_string()),
            }
        }

        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let [premium_monthly, premium_yearly, unlimited_monthly, unlimited_yearly]: [String; 4] =
            values
                .try_into()
                .map_err(|_| ConfigError::Missing(vec!["price ids".to_string()]))?;

        Ok(Self {
            premium_monthly,
            premium_yearly,
            unlimited_monthly,
            unlimited_yearly,
        })
    }

    fn entries(&self) -> [(&'static str, &str, ResolvedPrice); 4] {
        let ids = [
            self.premium_monthly.as_str(),
            self.premium_yearly.as_str(),
            self.unlimited_monthly.as_str(),
            self.unlimited_yearly.as_str(),
        ];
        let mut out = [("", "", ResolvedPrice::FREE); 4];
        for (slot, ((key, tier, cycle), id)) in out
            .iter_mut()
            .zip(Self::ENV_KEYS.into_iter().zip(ids))
        {
            *slot = (key, id, ResolvedPrice::new(tier, cycle));
        }
        out
    }
}

/// Validated lookup table from price id to tier and cycle
#[derive(Debug, Clone)]
pub struct PriceCatalog {
    ids: PriceIds,
    by_id: HashMap<String, ResolvedPrice>,
}

impl PriceCatalog {
    /// Build the catalog, rejecting empty or duplicated price ids
    pub fn new(ids: PriceIds) -> Result<Self, ConfigError> {
        let mut by_id = HashMap::new();
        let mut keys_by_id: HashMap<&str, Vec<String>> = HashMap::new();
        let mut missing = Vec::new();

        let entries = ids.entries();
        for (key, id, resolved) in entries.iter() {
            if id.trim().is_empty() {
                missing.push(key.to_string());
                continue;
            }
            keys_by_id.entry(*id).or_default().push(key.to_string());
            by_id.insert(id.to_string(), *resolved);
        }

        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        if let Some((value, keys)) = keys_by_id.into_iter().find(|(_, keys)| keys.len() > 1) {
            return Err(ConfigError::Duplicate {
                value: value.to_string(),
                keys,
            });
        }

        Ok(Self { ids, by_id })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new(PriceIds::from_env()?)
    }

    pub fn lookup(&self, price_id: &str) -> Option<ResolvedPrice> {
        self.by_id.get(price_id).copied()
    }

    pub fn price_ids(&self) -> &PriceIds {
        &self.ids
    }
}

/// Heuristic resolution for sandbox price ids that were never registered in
/// the catalog. Off unless `STRIPE_TEST_PRICE_FALLBACK=true`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestPriceFallback {
    enabled: bool,
    prefix: String,
}

impl Default for TestPriceFallback {
    fn default() -> Self {
        Self::disabled()
    }
}

impl TestPriceFallback {
    pub const DEFAULT_PREFIX: &'static str = "price_test_";

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            prefix: Self::DEFAULT_PREFIX.to_string(),
        }
    }

    pub fn enabled(prefix: impl Into<String>) -> Self {
        Self {
            enabled: true,
            prefix: prefix.into(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            enabled: env_flag("STRIPE_TEST_PRICE_FALLBACK", false)?,
            prefix: env_or("STRIPE_TEST_PRICE_PREFIX", Self::DEFAULT_PREFIX),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// "premium" is checked before "unlimited"
    fn resolve(&self, price_id: &str) -> Option<ResolvedPrice> {
        if !self.enabled || !price_id.starts_with(&self.prefix) {
            return None;
        }

        let tier = if price_id.contains("premium") {
            SubscriptionTier::Premium
        } else if price_id.contains("unlimited") {
            SubscriptionTier::Unlimited
        } else {
            return None;
        };

        Some(ResolvedPrice::new(tier, BillingCycle::Monthly))
    }
}

/// Maps provider price ids to internal tiers. Pure and infallible.
#[derive(Debug, Clone)]
pub struct TierResolver {
    catalog: PriceCatalog,
    fallback: TestPriceFallback,
}

impl TierResolver {
    pub fn new(catalog: PriceCatalog, fallback: TestPriceFallback) -> Self {
        Self { catalog, fallback }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(
            PriceCatalog::from_env()?,
            TestPriceFallback::from_env()?,
        ))
    }

    pub fn resolve(&self, price_id: &str) -> ResolvedPrice {
        if let Some(resolved) = self.catalog.lookup(price_id) {
            return resolved;
        }

        if let Some(resolved) = self.fallback.resolve(price_id) {
            tracing::warn!(
                price_id = %price_id,
                tier = %resolved.tier,
                "Resolved unregistered price id via test-mode fallback"
            );
            return resolved;
        }

        tracing::debug!(price_id = %price_id, "Unknown price id, resolving to free");
        ResolvedPrice::FREE
    }

    pub fn catalog(&self) -> &PriceCatalog {
        &self.catalog
    }
}
