//! In-memory ledger store for tests and local development

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use numera_shared::{Feature, SubscriptionStatus, SubscriptionTier};

use super::{LedgerStore, NewProfile, NewSubscription, SubscriptionRecord, UserProfile};
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone)]
struct UsageRow {
    user_id: String,
    feature: Feature,
    #[allow(dead_code)]
    payload: serde_json::Value,
    created_at: OffsetDateTime,
}

#[derive(Debug, Default)]
struct Inner {
    profiles: HashMap<String, UserProfile>,
    /// Insertion order doubles as the tie-breaker for equal `created_at`
    subscriptions: Vec<SubscriptionRecord>,
    usage: Vec<UsageRow>,
    failing_users: HashSet<String>,
    /// One-shot insert failures, consumed by the next insert for the user
    failing_inserts: HashSet<String>,
}

impl Inner {
    fn check_writable(&self, user_id: &str) -> BillingResult<()> {
        if self.failing_users.contains(user_id) {
            return Err(BillingError::Database(format!(
                "simulated write failure for user {user_id}"
            )));
        }
        Ok(())
    }
}

/// Ledger store backed by process memory. Cloning shares the same data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedgerStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write touching `user_id` fail with a database error
    pub async fn fail_writes_for(&self, user_id: &str) {
        self.inner
            .write()
            .await
            .failing_users
            .insert(user_id.to_string());
    }

    /// Fail only the next `insert_subscription` for `user_id`
    pub async fn fail_next_insert_for(&self, user_id: &str) {
        self.inner
            .write()
            .await
            .failing_inserts
            .insert(user_id.to_string());
    }

    pub async fn clear_failures(&self) {
        let mut inner = self.inner.write().await;
        inner.failing_users.clear();
        inner.failing_inserts.clear();
    }

    /// Every subscription row for a user regardless of status, oldest first
    pub async fn subscription_history(&self, user_id: &str) -> Vec<SubscriptionRecord> {
        self.inner
            .read()
            .await
            .subscriptions
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Insert a row verbatim, bypassing the at-most-one-active sequencing
    pub async fn seed_subscription(&self, record: SubscriptionRecord) {
        self.inner.write().await.subscriptions.push(record);
    }
}

fn is_paid_active(record: &SubscriptionRecord) -> bool {
    record.status == SubscriptionStatus::Active && record.tier != SubscriptionTier::Free
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn get_profile(&self, user_id: &str) -> BillingResult<Option<UserProfile>> {
        Ok(self.inner.read().await.profiles.get(user_id).cloned())
    }

    async fn create_profile(&self, profile: NewProfile) -> BillingResult<UserProfile> {
        let mut inner = self.inner.write().await;
        inner.check_writable(&profile.user_id)?;

        let now = OffsetDateTime::now_utc();
        let stored = inner
            .profiles
            .entry(profile.user_id.clone())
            .or_insert_with(|| UserProfile {
                id: Uuid::new_v4(),
                user_id: profile.user_id,
                email: profile.email,
                display_name: profile.display_name,
                wants_premium: false,
                terms_agreed: false,
                onboarding_done: false,
                created_at: now,
                updated_at: now,
            });
        Ok(stored.clone())
    }

    async fn set_wants_premium(&self, user_id: &str, wants_premium: bool) -> BillingResult<bool> {
        let mut inner = self.inner.write().await;
        inner.check_writable(user_id)?;

        match inner.profiles.get_mut(user_id) {
            Some(profile) => {
                profile.wants_premium = wants_premium;
                profile.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn active_subscription(
        &self,
        user_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .subscriptions
            .iter()
            .filter(|s| s.user_id == user_id && s.status == SubscriptionStatus::Active)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn active_subscriptions(&self, user_id: &str) -> BillingResult<Vec<SubscriptionRecord>> {
        let inner = self.inner.read().await;
        let mut active: Vec<_> = inner
            .subscriptions
            .iter()
            .filter(|s| s.user_id == user_id && s.status == SubscriptionStatus::Active)
            .cloned()
            .collect();
        active.reverse();
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(active)
    }

    async fn cancel_active_subscriptions(&self, user_id: &str) -> BillingResult<u64> {
        let mut inner = self.inner.write().await;
        inner.check_writable(user_id)?;

        let now = OffsetDateTime::now_utc();
        let mut changed = 0;
        for sub in inner
            .subscriptions
            .iter_mut()
            .filter(|s| s.user_id == user_id && s.status == SubscriptionStatus::Active)
        {
            sub.status = SubscriptionStatus::Canceled;
            sub.updated_at = now;
            changed += 1;
        }
        Ok(changed)
    }

    async fn cancel_expired_subscriptions(
        &self,
        user_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<u64> {
        let mut inner = self.inner.write().await;
        inner.check_writable(user_id)?;

        let mut changed = 0;
        for sub in inner
            .subscriptions
            .iter_mut()
            .filter(|s| s.user_id == user_id && s.is_expired_at(now))
        {
            sub.status = SubscriptionStatus::Canceled;
            sub.updated_at = OffsetDateTime::now_utc();
            changed += 1;
        }
        Ok(changed)
    }

    async fn insert_subscription(&self, sub: NewSubscription) -> BillingResult<SubscriptionRecord> {
        let mut inner = self.inner.write().await;
        inner.check_writable(&sub.user_id)?;
        if inner.failing_inserts.remove(&sub.user_id) {
            return Err(BillingError::Database(format!(
                "simulated insert failure for user {}",
                sub.user_id
            )));
        }

        let now = OffsetDateTime::now_utc();
        let record = SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id: sub.user_id,
            tier: sub.tier,
            status: SubscriptionStatus::Active,
            billing_cycle: sub.billing_cycle,
            starts_at: sub.starts_at,
            ends_at: sub.ends_at,
            external_subscription_id: sub.external_subscription_id,
            external_customer_id: sub.external_customer_id,
            created_at: now,
            updated_at: now,
        };
        inner.subscriptions.push(record.clone());
        Ok(record)
    }

    async fn expired_active_subscriptions(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .subscriptions
            .iter()
            .filter(|s| is_paid_active(s) && s.is_expired_at(now))
            .cloned()
            .collect())
    }

    async fn subscriptions_expiring_between(
        &self,
        from: OffsetDateTime,
        until: OffsetDateTime,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .subscriptions
            .iter()
            .filter(|s| is_paid_active(s) && s.ends_at.is_some_and(|end| end > from && end < until))
            .cloned()
            .collect())
    }

    async fn users_with_multiple_active(&self) -> BillingResult<Vec<(String, u64)>> {
        let inner = self.inner.read().await;
        let mut counts: HashMap<&str, u64> = HashMap::new();
        for sub in inner
            .subscriptions
            .iter()
            .filter(|s| s.status == SubscriptionStatus::Active)
        {
            *counts.entry(sub.user_id.as_str()).or_default() += 1;
        }

        let mut offenders: Vec<(String, u64)> = counts
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(user, count)| (user.to_string(), count))
            .collect();
        offenders.sort();
        Ok(offenders)
    }

    async fn count_usage(
        &self,
        user_id: &str,
        feature: Feature,
        since: OffsetDateTime,
    ) -> BillingResult<u64> {
        let inner = self.inner.read().await;
        Ok(inner
            .usage
            .iter()
            .filter(|u| u.user_id == user_id && u.feature == feature && u.created_at >= since)
            .count() as u64)
    }

    async fn record_usage(
        &self,
        user_id: &str,
        feature: Feature,
        payload: serde_json::Value,
        at: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut inner = self.inner.write().await;
        inner.check_writable(user_id)?;

        inner.usage.push(UsageRow {
            user_id: user_id.to_string(),
            feature,
            payload,
            created_at: at,
        });
        Ok(())
    }

    async fn delete_usage_since(
        &self,
        user_id: &str,
        feature: Feature,
        since: OffsetDateTime,
    ) -> BillingResult<u64> {
        let mut inner = self.inner.write().await;
        inner.check_writable(user_id)?;

        let before = inner.usage.len();
        inner
            .usage
            .retain(|u| !(u.user_id == user_id && u.feature == feature && u.created_at >= since));
        Ok((before - inner.usage.len()) as u64)
    }

    async fn delete_user(&self, user_id: &str) -> BillingResult<()> {
        let mut inner = self.inner.write().await;
        inner.check_writable(user_id)?;

        inner.profiles.remove(user_id);
        inner.subscriptions.retain(|s| s.user_id != user_id);
        inner.usage.retain(|u| u.user_id != user_id);
        Ok(())
    }
}
