//! Persistence boundary for the ledger.
//!
//! The core only talks to [`LedgerStore`]. [`PgLedgerStore`] is the
//! production implementation; [`InMemoryLedgerStore`] backs tests and local
//! development.
//!
//! Cross-row invariants (at most one active subscription per user) are kept
//! by the callers' sequencing, not by the store.

mod memory;
mod postgres;

pub use memory::InMemoryLedgerStore;
pub use postgres::PgLedgerStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use numera_shared::{BillingCycle, Feature, SubscriptionStatus, SubscriptionTier};

use crate::error::BillingResult;

/// One profile per authenticated user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: Uuid,
    pub user_id: String,
    pub email: String,
    pub display_name: Option<String>,
    /// Purchase intent. Not authoritative for entitlement.
    pub wants_premium: bool,
    pub terms_agreed: bool,
    pub onboarding_done: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Fields for a lazily created profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProfile {
    pub user_id: String,
    pub email: String,
    pub display_name: Option<String>,
}

impl NewProfile {
    /// Placeholder profile for a user seen for the first time
    pub fn placeholder(user_id: &str, email: Option<&str>) -> Self {
        let email = email
            .filter(|e| !e.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("user-{user_id}@example.com"));
        let short: String = user_id.chars().take(8).collect();

        Self {
            user_id: user_id.to_string(),
            email,
            display_name: Some(format!("User {short}")),
        }
    }
}

/// One billing relationship. Superseded rows are kept as history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: String,
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub billing_cycle: BillingCycle,
    #[serde(with = "time::serde::rfc3339::option")]
    pub starts_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ends_at: Option<OffsetDateTime>,
    pub external_subscription_id: Option<String>,
    pub external_customer_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// Active but past its end. Entitlement is already gone even if no
    /// downgrade has been persisted yet.
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.status == SubscriptionStatus::Active && self.ends_at.is_some_and(|end| end < now)
    }
}

/// Fields for a new active subscription row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSubscription {
    pub user_id: String,
    pub tier: SubscriptionTier,
    pub billing_cycle: BillingCycle,
    pub starts_at: Option<OffsetDateTime>,
    pub ends_at: Option<OffsetDateTime>,
    pub external_subscription_id: Option<String>,
    pub external_customer_id: Option<String>,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_profile(&self, user_id: &str) -> BillingResult<Option<UserProfile>>;

    /// Insert a profile, returning the existing one if another request won the race
    async fn create_profile(&self, profile: NewProfile) -> BillingResult<UserProfile>;

    /// Returns false when the user has no profile
    async fn set_wants_premium(&self, user_id: &str, wants_premium: bool) -> BillingResult<bool>;

    /// Most recently created active record
    async fn active_subscription(&self, user_id: &str)
        -> BillingResult<Option<SubscriptionRecord>>;

    /// All active records for a user, newest first
    async fn active_subscriptions(&self, user_id: &str) -> BillingResult<Vec<SubscriptionRecord>>;

    /// Mark every active record canceled, returning how many changed
    async fn cancel_active_subscriptions(&self, user_id: &str) -> BillingResult<u64>;

    /// Cancel active records with `ends_at < now`
    async fn cancel_expired_subscriptions(
        &self,
        user_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<u64>;

    async fn insert_subscription(&self, sub: NewSubscription) -> BillingResult<SubscriptionRecord>;

    /// Paid active records with `ends_at < now`, across all users
    async fn expired_active_subscriptions(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<SubscriptionRecord>>;

    /// Paid active records with `from < ends_at < until`
    async fn subscriptions_expiring_between(
        &self,
        from: OffsetDateTime,
        until: OffsetDateTime,
    ) -> BillingResult<Vec<SubscriptionRecord>>;

    /// Users holding more than one active record, with the count
    async fn users_with_multiple_active(&self) -> BillingResult<Vec<(String, u64)>>;

    /// Usage events with `created_at >= since`
    async fn count_usage(
        &self,
        user_id: &str,
        feature: Feature,
        since: OffsetDateTime,
    ) -> BillingResult<u64>;

    async fn record_usage(
        &self,
        user_id: &str,
        feature: Feature,
        payload: serde_json::Value,
        at: OffsetDateTime,
    ) -> BillingResult<()>;

    /// Delete usage events with `created_at >= since`
    async fn delete_usage_since(
        &self,
        user_id: &str,
        feature: Feature,
        since: OffsetDateTime,
    ) -> BillingResult<u64>;

    /// Remove the profile, every subscription row and every usage event
    async fn delete_user(&self, user_id: &str) -> BillingResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn record(status: SubscriptionStatus, ends_at: Option<OffsetDateTime>) -> SubscriptionRecord {
        let now = datetime!(2025-03-10 12:00 UTC);
        SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id: "user_1".to_string(),
            tier: SubscriptionTier::Premium,
            status,
            billing_cycle: BillingCycle::Monthly,
            starts_at: Some(now),
            ends_at,
            external_subscription_id: None,
            external_customer_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_placeholder_profile() {
        let profile = NewProfile::placeholder("user_2abcdefghijk", None);
        assert_eq!(profile.email, "user-user_2abcdefghijk@example.com");
        assert_eq!(profile.display_name.as_deref(), Some("User user_2ab"));

        let profile = NewProfile::placeholder("u1", Some("ada@example.org"));
        assert_eq!(profile.email, "ada@example.org");
        assert_eq!(profile.display_name.as_deref(), Some("User u1"));
    }

    #[test]
    fn test_is_expired_at() {
        let now = datetime!(2025-04-01 00:00 UTC);
        let yesterday = datetime!(2025-03-31 00:00 UTC);
        let tomorrow = datetime!(2025-04-02 00:00 UTC);

        assert!(record(SubscriptionStatus::Active, Some(yesterday)).is_expired_at(now));
        assert!(!record(SubscriptionStatus::Active, Some(tomorrow)).is_expired_at(now));
        assert!(!record(SubscriptionStatus::Active, None).is_expired_at(now));
        assert!(!record(SubscriptionStatus::Canceled, Some(yesterday)).is_expired_at(now));
    }
}
