//! Subscription record store
//!
//! Wraps the ledger store with the write sequencing that keeps at most one
//! active record per user: prior active rows are canceled before a new one
//! is inserted, never mutated in place. History rows are kept.

use std::sync::Arc;

use serde::Serialize;
use time::{Date, OffsetDateTime};

use numera_shared::BillingCycle;

use crate::error::BillingResult;
use crate::store::{LedgerStore, NewSubscription, SubscriptionRecord};

/// Add calendar months, clamping the day to the target month's length
/// (Jan 31 + 1 month = Feb 28/29).
pub fn add_months(at: OffsetDateTime, months: u32) -> OffsetDateTime {
    let total = at.year() * 12 + i32::from(u8::from(at.month())) - 1 + months as i32;
    let year = total.div_euclid(12);
    let month = time::Month::January.nth_next(total.rem_euclid(12) as u8);
    let day = at.day().min(time::util::days_in_year_month(year, month));

    match Date::from_calendar_date(year, month, day) {
        Ok(date) => at.replace_date(date),
        Err(_) => at,
    }
}

/// Start and end of one paid period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BillingPeriod {
    pub starts_at: OffsetDateTime,
    pub ends_at: OffsetDateTime,
}

impl BillingPeriod {
    /// One full cycle beginning at `start`
    pub fn starting_at(start: OffsetDateTime, cycle: BillingCycle) -> Self {
        Self {
            starts_at: start,
            ends_at: add_months(start, cycle.months()),
        }
    }
}

/// Record-level operations on a user's subscription rows
#[derive(Clone)]
pub struct SubscriptionStore {
    store: Arc<dyn LedgerStore>,
}

impl SubscriptionStore {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// The user's current active record, most recent first
    pub async fn current(&self, user_id: &str) -> BillingResult<Option<SubscriptionRecord>> {
        self.store.active_subscription(user_id).await
    }

    /// Supersede every active record with a new one.
    ///
    /// Returns the inserted record and how many rows were canceled. If the
    /// insert fails after the cancel succeeded the user is briefly without
    /// an active row; redelivery rebuilds it.
    pub async fn replace_active(
        &self,
        new: NewSubscription,
    ) -> BillingResult<(SubscriptionRecord, u64)> {
        let user_id = new.user_id.clone();
        let superseded = self.store.cancel_active_subscriptions(&user_id).await?;
        let record = self.store.insert_subscription(new).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %record.id,
            tier = %record.tier,
            billing_cycle = %record.billing_cycle,
            superseded,
            "Activated subscription record"
        );

        Ok((record, superseded))
    }

    /// Cancel all active records for a user
    pub async fn cancel_active(&self, user_id: &str) -> BillingResult<u64> {
        let canceled = self.store.cancel_active_subscriptions(user_id).await?;
        if canceled > 0 {
            tracing::info!(user_id = %user_id, canceled, "Canceled active subscription records");
        }
        Ok(canceled)
    }

    /// Cancel active records whose period ended before `now`
    pub async fn cancel_expired(&self, user_id: &str, now: OffsetDateTime) -> BillingResult<u64> {
        self.store.cancel_expired_subscriptions(user_id, now).await
    }
}
