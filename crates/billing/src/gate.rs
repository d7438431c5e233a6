//! Feature gate.
//!
//! `can_use` is a count-then-compare check with no lock between the count and
//! the caller's later `record`. Two concurrent calls near the limit can both
//! pass, so the limit is advisory: it can be overrun by up to the number of
//! concurrent callers minus one.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use numera_shared::{Feature, SubscriptionTier};

use crate::error::BillingResult;
use crate::quota::{Allowance, QuotaTable};
use crate::status::SubscriptionStatusService;
use crate::usage::UsageCounter;

/// Answer to "may this user use this feature now?"
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureAccess {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub tier: SubscriptionTier,
    pub feature: Feature,
    pub used: u64,
    pub limit: Allowance,
}

impl FeatureAccess {
    /// Remaining uses this month, `None` when unlimited
    pub fn remaining(&self) -> Option<u64> {
        self.limit.remaining(self.used)
    }
}

/// User-facing message for a denied request
pub fn limit_reached_message(
    feature: Feature,
    tier: SubscriptionTier,
    used: u64,
    limit: u32,
) -> String {
    let shown = used.min(u64::from(limit));
    format!(
        "Usage limit reached for {} on the {} plan ({}/{}). Upgrade to get more access.",
        feature.display_name(),
        tier.display_name(),
        shown,
        limit
    )
}

#[derive(Clone)]
pub struct FeatureGate {
    status: SubscriptionStatusService,
    usage: UsageCounter,
    quotas: Arc<QuotaTable>,
}

impl FeatureGate {
    pub fn new(status: SubscriptionStatusService, usage: UsageCounter, quotas: Arc<QuotaTable>) -> Self {
        Self {
            status,
            usage,
            quotas,
        }
    }

    pub async fn can_use(&self, user_id: &str, feature: Feature) -> BillingResult<FeatureAccess> {
        self.can_use_at(user_id, feature, OffsetDateTime::now_utc())
            .await
    }

    /// Gate check with an explicit clock.
    ///
    /// The tier comes from the status read path, so an expired record is
    /// downgraded here as well.
    pub async fn can_use_at(
        &self,
        user_id: &str,
        feature: Feature,
        now: OffsetDateTime,
    ) -> BillingResult<FeatureAccess> {
        let tier = self.status.effective_tier(user_id, now).await?.tier;
        let limit = self.quotas.allowance(tier, feature);

        if limit.is_unlimited() {
            return Ok(FeatureAccess {
                allowed: true,
                reason: None,
                tier,
                feature,
                used: 0,
                limit,
            });
        }

        let used = self.usage.count(user_id, feature, now).await?;
        let allowed = limit.permits(used);

        let reason = match limit {
            Allowance::Limited(max) if !allowed => {
                tracing::info!(
                    user_id = %user_id,
                    feature = %feature,
                    tier = %tier,
                    used,
                    limit = max,
                    "Feature usage limit reached"
                );
                Some(limit_reached_message(feature, tier, used, max))
            }
            _ => None,
        };

        Ok(FeatureAccess {
            allowed,
            reason,
            tier,
            feature,
            used,
            limit,
        })
    }
}
