//! Subscription status read path and expiry detection.
//!
//! `ends_at` is the authoritative expiry boundary. An active record past its
//! end is treated as free for the current read even before anything has been
//! persisted. The read then issues the downgrade as a separate command, so
//! the pure decision ([`compute_effective_tier`]) and the side effect
//! ([`SubscriptionStatusService::reconcile_if_expired`]) can be tested
//! independently.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use numera_shared::{BillingCycle, SubscriptionStatus, SubscriptionTier};

use crate::error::BillingResult;
use crate::quota::{Allowance, PerFeature, QuotaTable};
use crate::reconciler::Reconciler;
use crate::store::{LedgerStore, NewProfile, SubscriptionRecord, UserProfile};
use crate::usage::UsageCounter;

/// Tier and status a caller should act on right now
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveTier {
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    /// The active record has run past `ends_at`
    pub expired: bool,
}

impl EffectiveTier {
    pub const FREE: EffectiveTier = EffectiveTier {
        tier: SubscriptionTier::Free,
        status: SubscriptionStatus::Active,
        expired: false,
    };
}

/// Pure expiry decision over the user's active record
pub fn compute_effective_tier(
    record: Option<&SubscriptionRecord>,
    now: OffsetDateTime,
) -> EffectiveTier {
    match record {
        None => EffectiveTier::FREE,
        Some(r) if r.is_expired_at(now) => EffectiveTier {
            tier: SubscriptionTier::Free,
            status: SubscriptionStatus::Canceled,
            expired: true,
        },
        Some(r) => EffectiveTier {
            tier: r.tier,
            status: r.status,
            expired: false,
        },
    }
}

/// Whole days left until `ends_at`, rounded up. Negative once expired.
pub fn days_remaining(ends_at: OffsetDateTime, now: OffsetDateTime) -> i64 {
    let secs = (ends_at - now).whole_seconds();
    let days = secs.div_euclid(86_400);
    if secs.rem_euclid(86_400) > 0 {
        days + 1
    } else {
        days
    }
}

/// Subscription part of the status view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSummary {
    pub id: Option<Uuid>,
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub billing_cycle: BillingCycle,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub is_expired: bool,
    pub days_remaining: Option<i64>,
    pub is_premium: bool,
    pub is_unlimited: bool,
}

/// Everything a client needs to render the account page
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatusView {
    pub subscription: SubscriptionSummary,
    pub usage: PerFeature<u64>,
    pub limits: PerFeature<Allowance>,
    pub profile: UserProfile,
}

/// Status reads, with expiry enforcement as a side effect
#[derive(Clone)]
pub struct SubscriptionStatusService {
    store: Arc<dyn LedgerStore>,
    usage: UsageCounter,
    reconciler: Reconciler,
    quotas: Arc<QuotaTable>,
}

impl SubscriptionStatusService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        reconciler: Reconciler,
        quotas: Arc<QuotaTable>,
    ) -> Self {
        Self {
            usage: UsageCounter::new(store.clone()),
            store,
            reconciler,
            quotas,
        }
    }

    /// Persist the downgrade for an expired record.
    ///
    /// Returns whether a downgrade was attempted. Failures are logged and
    /// swallowed: the caller has already computed free for this read and the
    /// sweep or the next read will retry.
    pub async fn reconcile_if_expired(&self, record: &SubscriptionRecord, now: OffsetDateTime) -> bool {
        if !record.is_expired_at(now) {
            return false;
        }

        tracing::info!(
            user_id = %record.user_id,
            subscription_id = %record.id,
            ends_at = ?record.ends_at,
            "Active subscription has expired, downgrading"
        );

        if let Err(e) = self.reconciler.downgrade_expired(&record.user_id, now).await {
            tracing::error!(
                user_id = %record.user_id,
                error = %e,
                "Failed to persist expiry downgrade"
            );
        }
        true
    }

    /// Current tier for gating decisions
    pub async fn effective_tier(
        &self,
        user_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<EffectiveTier> {
        let record = self.store.active_subscription(user_id).await?;
        let effective = compute_effective_tier(record.as_ref(), now);

        if let Some(record) = record.as_ref() {
            self.reconcile_if_expired(record, now).await;
        }
        Ok(effective)
    }

    pub async fn status(
        &self,
        user_id: &str,
        email: Option<&str>,
    ) -> BillingResult<SubscriptionStatusView> {
        self.status_at(user_id, email, OffsetDateTime::now_utc())
            .await
    }

    /// Full status view. Creates a placeholder profile on first sight.
    pub async fn status_at(
        &self,
        user_id: &str,
        email: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<SubscriptionStatusView> {
        let profile = match self.store.get_profile(user_id).await? {
            Some(profile) => profile,
            None => {
                tracing::info!(user_id = %user_id, "Creating profile on first status read");
                self.store
                    .create_profile(NewProfile::placeholder(user_id, email))
                    .await?
            }
        };

        let record = self.store.active_subscription(user_id).await?;
        let usage = self.usage.current_month(user_id, now).await?;
        let mut effective = compute_effective_tier(record.as_ref(), now);

        if let Some(record) = record.as_ref() {
            self.reconcile_if_expired(record, now).await;
        } else if profile.wants_premium {
            // intent without an active record: a lapsed or unfinished purchase
            effective.status = SubscriptionStatus::Canceled;
        }

        let subscription = SubscriptionSummary {
            id: record.as_ref().map(|r| r.id),
            tier: effective.tier,
            status: effective.status,
            billing_cycle: record
                .as_ref()
                .map(|r| r.billing_cycle)
                .unwrap_or(BillingCycle::Monthly),
            current_period_start: record.as_ref().and_then(|r| r.starts_at),
            current_period_end: record.as_ref().and_then(|r| r.ends_at),
            is_expired: effective.expired,
            days_remaining: record
                .as_ref()
                .and_then(|r| r.ends_at)
                .map(|end| days_remaining(end, now)),
            is_premium: effective.tier.is_paid(),
            is_unlimited: effective.tier == SubscriptionTier::Unlimited,
        };

        Ok(SubscriptionStatusView {
            subscription,
            usage,
            limits: *self.quotas.limits_for(effective.tier),
            profile,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use time::Duration;

    fn record(tier: SubscriptionTier, ends_at: Option<OffsetDateTime>) -> SubscriptionRecord {
        let created = datetime!(2025-01-01 00:00 UTC);
        SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            tier,
            status: SubscriptionStatus::Active,
            billing_cycle: BillingCycle::Monthly,
            starts_at: Some(created),
            ends_at,
            external_subscription_id: None,
            external_customer_id: None,
            created_at: created,
            updated_at: created,
        }
    }

    #[test]
    fn test_effective_tier_without_record_is_free() {
        assert_eq!(
            compute_effective_tier(None, OffsetDateTime::now_utc()),
            EffectiveTier::FREE
        );
    }

    #[test]
    fn test_effective_tier_forces_free_after_expiry() {
        let now = datetime!(2025-06-15 12:00 UTC);
        let expired = record(SubscriptionTier::Unlimited, Some(now - Duration::seconds(1)));
        let effective = compute_effective_tier(Some(&expired), now);
        assert_eq!(effective.tier, SubscriptionTier::Free);
        assert_eq!(effective.status, SubscriptionStatus::Canceled);
        assert!(effective.expired);

        let current = record(SubscriptionTier::Unlimited, Some(now + Duration::days(3)));
        assert_eq!(
            compute_effective_tier(Some(&current), now).tier,
            SubscriptionTier::Unlimited
        );
    }

    #[test]
    fn test_open_ended_record_never_expires() {
        let now = datetime!(2030-01-01 00:00 UTC);
        let open = record(SubscriptionTier::Premium, None);
        assert!(!compute_effective_tier(Some(&open), now).expired);
    }

    #[test]
    fn test_days_remaining_rounds_up() {
        let now = datetime!(2025-06-15 12:00 UTC);
        assert_eq!(days_remaining(now + Duration::hours(1), now), 1);
        assert_eq!(days_remaining(now + Duration::days(7), now), 7);
        assert_eq!(days_remaining(now + Duration::hours(169), now), 8);
        assert_eq!(days_remaining(now - Duration::hours(1), now), 0);
        assert_eq!(days_remaining(now - Duration::hours(25), now), -1);
    }
}
