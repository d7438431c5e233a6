//! Domain vocabulary for subscriptions and metered features.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a stored or user-supplied string is not a known value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: '{value}'")]
pub struct ParseDomainError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseDomainError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Subscription tier. Ordered by entitlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Premium,
    Unlimited,
}

impl SubscriptionTier {
    pub const ALL: [SubscriptionTier; 3] = [
        SubscriptionTier::Free,
        SubscriptionTier::Premium,
        SubscriptionTier::Unlimited,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Premium => "premium",
            SubscriptionTier::Unlimited => "unlimited",
        }
    }

    /// Human readable plan name used in user-facing messages
    pub fn display_name(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "Free",
            SubscriptionTier::Premium => "Premium",
            SubscriptionTier::Unlimited => "Unlimited",
        }
    }

    pub fn is_paid(&self) -> bool {
        !matches!(self, SubscriptionTier::Free)
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionTier {
    type Err = ParseDomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(SubscriptionTier::Free),
            "premium" => Ok(SubscriptionTier::Premium),
            "unlimited" => Ok(SubscriptionTier::Unlimited),
            _ => Err(ParseDomainError::new("subscription tier", s)),
        }
    }
}

/// Lifecycle status of a stored subscription record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Canceled,
    PastDue,
    Incomplete,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Incomplete => "incomplete",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ParseDomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "canceled" | "cancelled" => Ok(SubscriptionStatus::Canceled),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            _ => Err(ParseDomainError::new("subscription status", s)),
        }
    }
}

/// Billing cycle of a paid subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
        }
    }

    /// Length of one cycle in calendar months
    pub fn months(&self) -> u32 {
        match self {
            BillingCycle::Monthly => 1,
            BillingCycle::Yearly => 12,
        }
    }
}

impl fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingCycle {
    type Err = ParseDomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monthly" => Ok(BillingCycle::Monthly),
            "yearly" => Ok(BillingCycle::Yearly),
            _ => Err(ParseDomainError::new("billing cycle", s)),
        }
    }
}

/// A metered feature. Each use is recorded as one row in the feature's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Feature {
    Numerology,
    LoveMatch,
    TrustAssessment,
}

impl Feature {
    pub const ALL: [Feature; 3] = [
        Feature::Numerology,
        Feature::LoveMatch,
        Feature::TrustAssessment,
    ];

    /// Wire name, as used in JSON bodies and URL paths
    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::Numerology => "numerology",
            Feature::LoveMatch => "loveMatch",
            Feature::TrustAssessment => "trustAssessment",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Feature::Numerology => "Numerology",
            Feature::LoveMatch => "Love Match",
            Feature::TrustAssessment => "Trust Assessment",
        }
    }

    /// Table holding one row per usage event
    pub fn table_name(&self) -> &'static str {
        match self {
            Feature::Numerology => "numerology_readings",
            Feature::LoveMatch => "love_matches",
            Feature::TrustAssessment => "trust_assessments",
        }
    }

    /// Suffix used by `QUOTA_<TIER>_<FEATURE>` overrides
    pub fn env_key(&self) -> &'static str {
        match self {
            Feature::Numerology => "NUMEROLOGY",
            Feature::LoveMatch => "LOVE_MATCH",
            Feature::TrustAssessment => "TRUST_ASSESSMENT",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = ParseDomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "numerology" => Ok(Feature::Numerology),
            "loveMatch" | "love_match" | "love-match" => Ok(Feature::LoveMatch),
            "trustAssessment" | "trust_assessment" | "trust-assessment" => {
                Ok(Feature::TrustAssessment)
            }
            _ => Err(ParseDomainError::new("feature", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_round_trips_through_str() {
        for tier in SubscriptionTier::ALL {
            assert_eq!(tier.as_str().parse::<SubscriptionTier>().unwrap(), tier);
        }
        assert_eq!(
            " Premium ".parse::<SubscriptionTier>().unwrap(),
            SubscriptionTier::Premium
        );
        assert!("gold".parse::<SubscriptionTier>().is_err());
    }

    #[test]
    fn test_tier_ordering() {
        assert!(SubscriptionTier::Free < SubscriptionTier::Premium);
        assert!(SubscriptionTier::Premium < SubscriptionTier::Unlimited);
        assert!(!SubscriptionTier::Free.is_paid());
        assert!(SubscriptionTier::Unlimited.is_paid());
    }

    #[test]
    fn test_feature_accepts_path_spellings() {
        assert_eq!("love-match".parse::<Feature>().unwrap(), Feature::LoveMatch);
        assert_eq!("loveMatch".parse::<Feature>().unwrap(), Feature::LoveMatch);
        assert_eq!(
            "trust_assessment".parse::<Feature>().unwrap(),
            Feature::TrustAssessment
        );
        let err = "tarot".parse::<Feature>().unwrap_err();
        assert_eq!(err.to_string(), "unknown feature: 'tarot'");
    }

    #[test]
    fn test_feature_serializes_camel_case() {
        let json = serde_json::to_string(&Feature::TrustAssessment).unwrap();
        assert_eq!(json, "\"trustAssessment\"");
    }

    #[test]
    fn test_cycle_months() {
        assert_eq!(BillingCycle::Monthly.months(), 1);
        assert_eq!(BillingCycle::Yearly.months(), 12);
    }
}
