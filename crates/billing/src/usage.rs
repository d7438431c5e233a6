//! Calendar-month usage counting.
//!
//! Usage is never decremented. Events from earlier months simply fall out of
//! the counting window; only an explicit reset deletes them.

use std::sync::Arc;

use time::{Date, OffsetDateTime, UtcOffset};

use numera_shared::Feature;

use crate::error::{BillingError, BillingResult};
use crate::quota::PerFeature;
use crate::store::LedgerStore;

/// Midnight UTC on the first day of `now`'s month
pub fn month_start(now: OffsetDateTime) -> OffsetDateTime {
    let utc = now.to_offset(UtcOffset::UTC);
    Date::from_calendar_date(utc.year(), utc.month(), 1)
        .unwrap_or(utc.date())
        .midnight()
        .assume_utc()
}

/// Counts and records feature usage per user
#[derive(Clone)]
pub struct UsageCounter {
    store: Arc<dyn LedgerStore>,
}

impl UsageCounter {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Uses of `feature` since the start of `now`'s month
    pub async fn count(
        &self,
        user_id: &str,
        feature: Feature,
        now: OffsetDateTime,
    ) -> BillingResult<u64> {
        self.store
            .count_usage(user_id, feature, month_start(now))
            .await
    }

    /// Current-month counts for every feature
    pub async fn current_month(
        &self,
        user_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<PerFeature<u64>> {
        let mut counts = PerFeature::uniform(0);
        for feature in Feature::ALL {
            counts.set(feature, self.count(user_id, feature, now).await?);
        }
        Ok(counts)
    }

    /// Record one use of `feature`. The payload is stored opaquely.
    pub async fn record(
        &self,
        user_id: &str,
        feature: Feature,
        payload: serde_json::Value,
    ) -> BillingResult<()> {
        self.store
            .record_usage(user_id, feature, payload, OffsetDateTime::now_utc())
            .await?;

        tracing::debug!(user_id = %user_id, feature = %feature, "Recorded usage event");
        Ok(())
    }

    /// Delete this month's events for all three features.
    ///
    /// Every stream is attempted even if an earlier one fails; the first
    /// failure is returned afterwards.
    pub async fn reset_current_month(
        &self,
        user_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<PerFeature<u64>> {
        let since = month_start(now);
        let mut deleted = PerFeature::uniform(0);
        let mut first_error: Option<BillingError> = None;

        for feature in Feature::ALL {
            match self.store.delete_usage_since(user_id, feature, since).await {
                Ok(count) => deleted.set(feature, count),
                Err(e) => {
                    tracing::error!(
                        user_id = %user_id,
                        feature = %feature,
                        error = %e,
                        "Failed to reset usage stream"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        tracing::info!(
            user_id = %user_id,
            numerology = deleted.numerology,
            love_match = deleted.love_match,
            trust_assessment = deleted.trust_assessment,
            "Reset current month usage"
        );
        Ok(deleted)
    }
}
