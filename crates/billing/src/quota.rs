//! Static per-tier quota table.
//!
//! Limits are monthly allowances. `Unlimited` is serialized as `-1` so
//! clients can keep using the legacy sentinel.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use numera_shared::{ConfigError, Feature, SubscriptionTier};

/// Monthly allowance for one feature on one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allowance {
    Limited(u32),
    Unlimited,
}

impl Allowance {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Allowance::Unlimited)
    }

    /// Whether one more use is permitted after `used` uses this month
    pub fn permits(&self, used: u64) -> bool {
        match self {
            Allowance::Unlimited => true,
            Allowance::Limited(limit) => used < u64::from(*limit),
        }
    }

    /// Uses left this month, `None` when unlimited
    pub fn remaining(&self, used: u64) -> Option<u64> {
        match self {
            Allowance::Unlimited => None,
            Allowance::Limited(limit) => Some(u64::from(*limit).saturating_sub(used)),
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            Allowance::Unlimited => -1,
            Allowance::Limited(limit) => i64::from(*limit),
        }
    }

    /// Any negative value is the unlimited sentinel
    pub fn from_i64(value: i64) -> Option<Self> {
        if value < 0 {
            Some(Allowance::Unlimited)
        } else {
            u32::try_from(value).ok().map(Allowance::Limited)
        }
    }
}

impl Serialize for Allowance {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.as_i64())
    }
}

impl<'de> Deserialize<'de> for Allowance {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = i64::deserialize(deserializer)?;
        Allowance::from_i64(value)
            .ok_or_else(|| serde::de::Error::custom(format!("allowance out of range: {value}")))
    }
}

/// One value per metered feature, serialized with the feature wire names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerFeature<T> {
    pub numerology: T,
    pub love_match: T,
    pub trust_assessment: T,
}

impl<T: Copy> PerFeature<T> {
    pub fn uniform(value: T) -> Self {
        Self {
            numerology: value,
            love_match: value,
            trust_assessment: value,
        }
    }

    pub fn get(&self, feature: Feature) -> T {
        match feature {
            Feature::Numerology => self.numerology,
            Feature::LoveMatch => self.love_match,
            Feature::TrustAssessment => self.trust_assessment,
        }
    }

    pub fn set(&mut self, feature: Feature, value: T) {
        match feature {
            Feature::Numerology => self.numerology = value,
            Feature::LoveMatch => self.love_match = value,
            Feature::TrustAssessment => self.trust_assessment = value,
        }
    }
}

/// Limits for every tier and feature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaTable {
    free: PerFeature<Allowance>,
    premium: PerFeature<Allowance>,
    unlimited: PerFeature<Allowance>,
}

impl Default for QuotaTable {
    fn default() -> Self {
        Self {
            free: PerFeature::uniform(Allowance::Limited(3)),
            premium: PerFeature {
                numerology: Allowance::Limited(25),
                love_match: Allowance::Limited(10),
                trust_assessment: Allowance::Limited(15),
            },
            unlimited: PerFeature::uniform(Allowance::Unlimited),
        }
    }
}

impl QuotaTable {
    /// Defaults overridden by `QUOTA_<TIER>_<FEATURE>` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each key.
    ///
    /// A value of `-1` (or any negative number) means unlimited.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut table = Self::default();

        for tier in SubscriptionTier::ALL {
            for feature in Feature::ALL {
                let key = format!(
                    "QUOTA_{}_{}",
                    tier.as_str().to_ascii_uppercase(),
                    feature.env_key()
                );
                let Some(raw) = lookup(&key) else {
                    continue;
                };
                let value: i64 = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                    key: key.clone(),
                    reason: format!("must be an integer, got '{raw}'"),
                })?;
                let allowance = Allowance::from_i64(value).ok_or_else(|| ConfigError::Invalid {
                    key: key.clone(),
                    reason: "out of range".to_string(),
                })?;
                table.set(tier, feature, allowance);
            }
        }

        Ok(table)
    }

    pub fn limits_for(&self, tier: SubscriptionTier) -> &PerFeature<Allowance> {
        match tier {
            SubscriptionTier::Free => &self.free,
            SubscriptionTier::Premium => &self.premium,
            SubscriptionTier::Unlimited => &self.unlimited,
        }
    }

    pub fn allowance(&self, tier: SubscriptionTier, feature: Feature) -> Allowance {
        self.limits_for(tier).get(feature)
    }

    pub fn set(&mut self, tier: SubscriptionTier, feature: Feature, allowance: Allowance) {
        let limits = match tier {
            SubscriptionTier::Free => &mut self.free,
            SubscriptionTier::Premium => &mut self.premium,
            SubscriptionTier::Unlimited => &mut self.unlimited,
        };
        limits.set(feature, allowance);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_limits() {
        let table = QuotaTable::default();
        for feature in Feature::ALL {
            assert_eq!(
                table.allowance(SubscriptionTier::Free, feature),
                Allowance::Limited(3)
            );
            assert!(table
                .allowance(SubscriptionTier::Unlimited, feature)
                .is_unlimited());
        }
        assert_eq!(
            table.allowance(SubscriptionTier::Premium, Feature::Numerology),
            Allowance::Limited(25)
        );
        assert_eq!(
            table.allowance(SubscriptionTier::Premium, Feature::LoveMatch),
            Allowance::Limited(10)
        );
        assert_eq!(
            table.allowance(SubscriptionTier::Premium, Feature::TrustAssessment),
            Allowance::Limited(15)
        );
    }

    #[test]
    fn test_permits_boundary() {
        let allowance = Allowance::Limited(3);
        assert!(allowance.permits(0));
        assert!(allowance.permits(2));
        assert!(!allowance.permits(3), "3 of 3 used leaves nothing");
        assert!(!allowance.permits(7));
        assert_eq!(allowance.remaining(7), Some(0));
        assert!(Allowance::Unlimited.permits(u64::MAX));
        assert_eq!(Allowance::Unlimited.remaining(10_000), None);
    }

    #[test]
    fn test_allowance_serializes_sentinel() {
        let limits = QuotaTable::default();
        let json = serde_json::to_value(limits.limits_for(SubscriptionTier::Unlimited)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"numerology": -1, "loveMatch": -1, "trustAssessment": -1})
        );
        let back: Allowance = serde_json::from_value(serde_json::json!(-1)).unwrap();
        assert!(back.is_unlimited());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("QUOTA_FREE_LOVE_MATCH", "5"),
            ("QUOTA_PREMIUM_NUMEROLOGY", "-1"),
        ]
        .into_iter()
        .collect();

        let table = QuotaTable::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(
            table.allowance(SubscriptionTier::Free, Feature::LoveMatch),
            Allowance::Limited(5)
        );
        assert_eq!(
            table.allowance(SubscriptionTier::Free, Feature::Numerology),
            Allowance::Limited(3)
        );
        assert!(table
            .allowance(SubscriptionTier::Premium, Feature::Numerology)
            .is_unlimited());
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let result = QuotaTable::from_lookup(|key| {
            (key == "QUOTA_FREE_NUMEROLOGY").then(|| "lots".to_string())
        });
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { ref key, .. }) if key == "QUOTA_FREE_NUMEROLOGY"
        ));

        let result = QuotaTable::from_lookup(|key| {
            (key == "QUOTA_PREMIUM_LOVE_MATCH").then(|| "99999999999".to_string())
        });
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { ref key, ref reason })
                if key == "QUOTA_PREMIUM_LOVE_MATCH" && reason == "out of range"
        ));
    }
}
