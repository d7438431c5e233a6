//! Subscription reconciler.
//!
//! Turns a provider subscription snapshot into local ledger state. Every call
//! re-derives the target state from the snapshot's status and price rather
//! than applying a delta, so webhook redelivery converges on the same rows.
//!
//! Writes are sequenced, not transactional: reset usage on tier change, cancel
//! prior active rows, insert the new row, then flip the profile's
//! `wants_premium` flag. A failure part-way leaves a window that the next
//! delivery, sync or status read repairs.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use numera_shared::{BillingCycle, SubscriptionTier};

use crate::client::{BillingProvider, BillingSubscription};
use crate::error::{BillingError, BillingResult};
use crate::pricing::TierResolver;
use crate::store::{LedgerStore, NewProfile, NewSubscription, SubscriptionRecord};
use crate::subscriptions::{BillingPeriod, SubscriptionStore};
use crate::usage::UsageCounter;

/// What a reconciliation did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// A new active record was written
    Activated {
        user_id: String,
        subscription_id: Uuid,
        tier: SubscriptionTier,
        billing_cycle: BillingCycle,
        tier_changed: bool,
    },
    /// The active record already matched the snapshot
    Unchanged {
        user_id: String,
        subscription_id: Uuid,
        tier: SubscriptionTier,
    },
    /// Active records were canceled
    Canceled { user_id: String, canceled: u64 },
    /// Nothing to do for this status/price combination
    Ignored {
        user_id: String,
        provider_status: String,
        reason: String,
    },
}

impl ReconcileOutcome {
    pub fn user_id(&self) -> &str {
        match self {
            ReconcileOutcome::Activated { user_id, .. }
            | ReconcileOutcome::Unchanged { user_id, .. }
            | ReconcileOutcome::Canceled { user_id, .. }
            | ReconcileOutcome::Ignored { user_id, .. } => user_id,
        }
    }
}

/// Result of a user-initiated sync against the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub user_id: String,
    /// Provider subscription that was reconciled, if any was found
    pub subscription_id: Option<String>,
    pub outcome: ReconcileOutcome,
}

/// Applies provider subscription state to the ledger
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn LedgerStore>,
    subscriptions: SubscriptionStore,
    usage: UsageCounter,
    resolver: Arc<TierResolver>,
    provider: Arc<dyn BillingProvider>,
    user_key: String,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        resolver: Arc<TierResolver>,
        provider: Arc<dyn BillingProvider>,
        user_key: impl Into<String>,
    ) -> Self {
        Self {
            subscriptions: SubscriptionStore::new(store.clone()),
            usage: UsageCounter::new(store.clone()),
            store,
            resolver,
            provider,
            user_key: user_key.into(),
        }
    }

    /// Metadata key holding the user id on provider subscriptions
    pub fn user_key(&self) -> &str {
        &self.user_key
    }

    pub async fn reconcile(&self, sub: &BillingSubscription) -> BillingResult<ReconcileOutcome> {
        self.reconcile_at(sub, OffsetDateTime::now_utc()).await
    }

    /// Reconcile with an explicit clock
    pub async fn reconcile_at(
        &self,
        sub: &BillingSubscription,
        now: OffsetDateTime,
    ) -> BillingResult<ReconcileOutcome> {
        let Some(user_id) = sub.user_id(&self.user_key) else {
            tracing::error!(
                subscription_id = %sub.id,
                customer_id = ?sub.customer_id,
                key = %self.user_key,
                "Subscription has no user correlation key, refusing to reconcile"
            );
            return Err(BillingError::MissingCorrelationKey {
                subscription_id: sub.id.clone(),
                key: self.user_key.clone(),
            });
        };

        let item = sub.primary_item();
        let resolved = self
            .resolver
            .resolve(item.map(|i| i.price_id.as_str()).unwrap_or_default());
        let cycle = item
            .and_then(|i| i.interval)
            .unwrap_or(resolved.billing_cycle);

        tracing::info!(
            user_id = %user_id,
            subscription_id = %sub.id,
            provider_status = %sub.status,
            tier = %resolved.tier,
            billing_cycle = %cycle,
            "Reconciling subscription"
        );

        if sub.status.is_entitled() && resolved.tier.is_paid() {
            return self.activate(user_id, sub, resolved.tier, cycle, now).await;
        }

        if sub.status.is_terminal() {
            return self.cancel(user_id).await;
        }

        let reason = if sub.status.is_entitled() {
            "price does not map to a paid tier"
        } else {
            "status does not change entitlement"
        };
        tracing::info!(
            user_id = %user_id,
            subscription_id = %sub.id,
            provider_status = %sub.status,
            reason,
            "Subscription status not handled, keeping current state"
        );
        Ok(ReconcileOutcome::Ignored {
            user_id: user_id.to_string(),
            provider_status: sub.status.to_string(),
            reason: reason.to_string(),
        })
    }

    async fn activate(
        &self,
        user_id: &str,
        sub: &BillingSubscription,
        tier: SubscriptionTier,
        cycle: BillingCycle,
        now: OffsetDateTime,
    ) -> BillingResult<ReconcileOutcome> {
        let provider_period = match (sub.current_period_start, sub.current_period_end) {
            (Some(starts_at), Some(ends_at)) => Some(BillingPeriod { starts_at, ends_at }),
            _ => None,
        };

        let current = self.subscriptions.current(user_id).await?;

        if let Some(existing) = current
            .as_ref()
            .filter(|r| already_applied(r, sub, tier, cycle, provider_period, now))
        {
            self.set_intent(user_id, true).await?;
            tracing::debug!(
                user_id = %user_id,
                subscription_id = %existing.id,
                "Active record already matches provider state"
            );
            return Ok(ReconcileOutcome::Unchanged {
                user_id: user_id.to_string(),
                subscription_id: existing.id,
                tier,
            });
        }

        let period = provider_period.unwrap_or_else(|| BillingPeriod::starting_at(now, cycle));
        let tier_changed = current.as_ref().is_some_and(|r| r.tier != tier);

        // Must precede the cancel: after a failed insert, redelivery finds no
        // active row and no tier change.
        if tier_changed {
            let previous = current.as_ref().map(|r| r.tier);
            tracing::info!(
                user_id = %user_id,
                previous_tier = ?previous,
                new_tier = %tier,
                "Tier changed, resetting current month usage"
            );
            if let Err(e) = self.usage.reset_current_month(user_id, now).await {
                tracing::warn!(
                    user_id = %user_id,
                    error = %e,
                    "Usage reset after tier change failed, continuing"
                );
            }
        }

        let (record, _) = self
            .subscriptions
            .replace_active(NewSubscription {
                user_id: user_id.to_string(),
                tier,
                billing_cycle: cycle,
                starts_at: Some(period.starts_at),
                ends_at: Some(period.ends_at),
                external_subscription_id: Some(sub.id.clone()),
                external_customer_id: sub.customer_id.clone(),
            })
            .await?;

        self.set_intent(user_id, true).await?;

        Ok(ReconcileOutcome::Activated {
            user_id: user_id.to_string(),
            subscription_id: record.id,
            tier,
            billing_cycle: cycle,
            tier_changed,
        })
    }

    /// Cancel the user's active records and clear the purchase intent flag
    pub async fn cancel(&self, user_id: &str) -> BillingResult<ReconcileOutcome> {
        let canceled = self.subscriptions.cancel_active(user_id).await?;
        self.set_intent(user_id, false).await?;

        Ok(ReconcileOutcome::Canceled {
            user_id: user_id.to_string(),
            canceled,
        })
    }

    /// Cancel active records whose period ended before `now`.
    ///
    /// The intent flag is cleared only when this call canceled something or
    /// the user is left without an active record. A renewal that replaced
    /// the expired row first keeps its flag.
    pub async fn downgrade_expired(&self, user_id: &str, now: OffsetDateTime) -> BillingResult<u64> {
        let canceled = self.subscriptions.cancel_expired(user_id, now).await?;
        if canceled > 0 || self.subscriptions.current(user_id).await?.is_none() {
            self.set_intent(user_id, false).await?;
        }

        if canceled > 0 {
            tracing::info!(user_id = %user_id, canceled, "Downgraded expired subscription to free");
        }
        Ok(canceled)
    }

    /// Re-read the user's subscriptions from the provider and reconcile.
    ///
    /// Prefers an active or trialing subscription, then any subscription
    /// already tagged with this user. With neither, the user is canceled.
    pub async fn sync_user(&self, user_id: &str) -> BillingResult<SyncOutcome> {
        let customer_id = self
            .subscriptions
            .current(user_id)
            .await?
            .and_then(|r| r.external_customer_id)
            .ok_or_else(|| {
                BillingError::NotFound(format!("No billing customer on record for user {user_id}"))
            })?;

        let candidates = self.provider.list_customer_subscriptions(&customer_id).await?;

        let chosen = candidates
            .iter()
            .find(|s| s.status.is_entitled())
            .or_else(|| {
                candidates
                    .iter()
                    .find(|s| s.user_id(&self.user_key) == Some(user_id))
            })
            .cloned();

        let Some(mut sub) = chosen else {
            tracing::info!(
                user_id = %user_id,
                customer_id = %customer_id,
                "No provider subscription found during sync, canceling"
            );
            return Ok(SyncOutcome {
                user_id: user_id.to_string(),
                subscription_id: None,
                outcome: self.cancel(user_id).await?,
            });
        };

        self.claim(&mut sub, user_id).await?;
        let outcome = self.reconcile(&sub).await?;
        Ok(SyncOutcome {
            user_id: user_id.to_string(),
            subscription_id: Some(sub.id),
            outcome,
        })
    }

    /// Make sure `sub` carries `user_id` as its correlation key, tagging it
    /// on the provider side when the key is missing. A subscription tagged
    /// with another user is refused.
    pub async fn claim(&self, sub: &mut BillingSubscription, user_id: &str) -> BillingResult<()> {
        match sub.user_id(&self.user_key) {
            Some(owner) if owner != user_id => Err(BillingError::InvalidInput(format!(
                "Subscription {} belongs to a different user",
                sub.id
            ))),
            Some(_) => Ok(()),
            None => {
                self.provider
                    .set_subscription_user(&sub.id, &self.user_key, user_id)
                    .await?;
                sub.metadata
                    .insert(self.user_key.clone(), user_id.to_string());
                Ok(())
            }
        }
    }

    /// `wants_premium` only records intent. A missing profile is created
    /// when the flag is raised so it is not lost.
    async fn set_intent(&self, user_id: &str, wants_premium: bool) -> BillingResult<()> {
        if self.store.set_wants_premium(user_id, wants_premium).await? || !wants_premium {
            return Ok(());
        }

        self.store
            .create_profile(NewProfile::placeholder(user_id, None))
            .await?;
        self.store.set_wants_premium(user_id, true).await?;
        Ok(())
    }
}

/// Whether `existing` already reflects the snapshot. Without provider
/// timestamps the stored period is kept unless it has run out.
fn already_applied(
    existing: &SubscriptionRecord,
    sub: &BillingSubscription,
    tier: SubscriptionTier,
    cycle: BillingCycle,
    period: Option<BillingPeriod>,
    now: OffsetDateTime,
) -> bool {
    let same_relationship = existing.tier == tier
        && existing.billing_cycle == cycle
        && existing.external_subscription_id.as_deref() == Some(sub.id.as_str());

    let same_period = match period {
        Some(p) => existing.starts_at == Some(p.starts_at) && existing.ends_at == Some(p.ends_at),
        None => !existing.is_expired_at(now),
    };

    same_relationship && same_period
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::{BillingItem, ProviderStatus};
    use crate::pricing::tests::sample_resolver;
    use crate::store::InMemoryLedgerStore;
    use async_trait::async_trait;
    use numera_shared::{Feature, SubscriptionStatus};
    use std::collections::HashMap;
    use time::Duration;
    use tokio::sync::Mutex;

    /// Provider double holding a fixed subscription list
    #[derive(Default)]
    pub(crate) struct FakeProvider {
        pub subscriptions: Mutex<Vec<BillingSubscription>>,
        pub metadata_updates: Mutex<Vec<(String, String)>>,
        pub price_changes: Mutex<Vec<(String, String)>>,
    }

    impl FakeProvider {
        async fn update(
            &self,
            subscription_id: &str,
            apply: impl FnOnce(&mut BillingSubscription),
        ) -> BillingResult<BillingSubscription> {
            let mut subscriptions = self.subscriptions.lock().await;
            let sub = subscriptions
                .iter_mut()
                .find(|s| s.id == subscription_id)
                .ok_or_else(|| BillingError::NotFound(subscription_id.to_string()))?;
            apply(sub);
            Ok(sub.clone())
        }
    }

    #[async_trait]
    impl BillingProvider for FakeProvider {
        async fn retrieve_subscription(
            &self,
            subscription_id: &str,
        ) -> BillingResult<BillingSubscription> {
            self.subscriptions
                .lock()
                .await
                .iter()
                .find(|s| s.id == subscription_id)
                .cloned()
                .ok_or_else(|| BillingError::NotFound(subscription_id.to_string()))
        }

        async fn list_customer_subscriptions(
            &self,
            customer_id: &str,
        ) -> BillingResult<Vec<BillingSubscription>> {
            Ok(self
                .subscriptions
                .lock()
                .await
                .iter()
                .filter(|s| s.customer_id.as_deref() == Some(customer_id))
                .cloned()
                .collect())
        }

        async fn set_subscription_user(
            &self,
            subscription_id: &str,
            _key: &str,
            user_id: &str,
        ) -> BillingResult<()> {
            self.metadata_updates
                .lock()
                .await
                .push((subscription_id.to_string(), user_id.to_string()));
            Ok(())
        }

        async fn change_subscription_price(
            &self,
            subscription_id: &str,
            price_id: &str,
        ) -> BillingResult<BillingSubscription> {
            let updated = self
                .update(subscription_id, |sub| {
                    sub.items = vec![BillingItem {
                        price_id: price_id.to_string(),
                        interval: None,
                    }];
                })
                .await?;
            self.price_changes
                .lock()
                .await
                .push((subscription_id.to_string(), price_id.to_string()));
            Ok(updated)
        }

        async fn set_cancel_at_period_end(
            &self,
            subscription_id: &str,
            cancel: bool,
        ) -> BillingResult<BillingSubscription> {
            self.update(subscription_id, |sub| sub.cancel_at_period_end = cancel)
                .await
        }
    }

    pub(crate) fn snapshot(
        user_id: Option<&str>,
        status: ProviderStatus,
        price_id: &str,
    ) -> BillingSubscription {
        let start = time::macros::datetime!(2025-03-01 00:00 UTC);
        BillingSubscription {
            id: "sub_abc".to_string(),
            customer_id: Some("cus_abc".to_string()),
            status,
            items: vec![BillingItem {
                price_id: price_id.to_string(),
                interval: None,
            }],
            current_period_start: Some(start),
            current_period_end: Some(start + Duration::days(31)),
            cancel_at_period_end: false,
            metadata: user_id
                .map(|u| HashMap::from([("user_id".to_string(), u.to_string())]))
                .unwrap_or_default(),
        }
    }

    pub(crate) fn reconciler(store: &InMemoryLedgerStore) -> Reconciler {
        reconciler_with(store, Arc::new(FakeProvider::default()))
    }

    pub(crate) fn reconciler_with(
        store: &InMemoryLedgerStore,
        provider: Arc<FakeProvider>,
    ) -> Reconciler {
        Reconciler::new(
            Arc::new(store.clone()),
            Arc::new(sample_resolver()),
            provider,
            "user_id",
        )
    }

    #[tokio::test]
    async fn test_activation_writes_record_and_intent() {
        let store = InMemoryLedgerStore::new();
        let reconciler = reconciler(&store);
        store
            .create_profile(NewProfile::placeholder("u1", None))
            .await
            .unwrap();

        let outcome = reconciler
            .reconcile(&snapshot(Some("u1"), ProviderStatus::Active, "price_premium_y"))
            .await
            .unwrap();

        match outcome {
            ReconcileOutcome::Activated {
                tier,
                billing_cycle,
                tier_changed,
                ..
            } => {
                assert_eq!(tier, SubscriptionTier::Premium);
                assert_eq!(billing_cycle, BillingCycle::Yearly);
                assert!(!tier_changed);
            }
            other => panic!("expected activation, got {other:?}"),
        }

        let record = store.active_subscription("u1").await.unwrap().unwrap();
        assert_eq!(record.external_subscription_id.as_deref(), Some("sub_abc"));
        assert_eq!(record.external_customer_id.as_deref(), Some("cus_abc"));
        assert!(store.get_profile("u1").await.unwrap().unwrap().wants_premium);
    }

    #[tokio::test]
    async fn test_item_interval_overrides_catalog_cycle() {
        let store = InMemoryLedgerStore::new();
        let reconciler = reconciler(&store);
        let mut sub = snapshot(Some("u1"), ProviderStatus::Trialing, "price_premium_m");
        sub.items[0].interval = Some(BillingCycle::Yearly);

        reconciler.reconcile(&sub).await.unwrap();
        let record = store.active_subscription("u1").await.unwrap().unwrap();
        assert_eq!(record.billing_cycle, BillingCycle::Yearly);
    }

    #[tokio::test]
    async fn test_missing_period_falls_back_to_cycle_length() {
        let store = InMemoryLedgerStore::new();
        let reconciler = reconciler(&store);
        let mut sub = snapshot(Some("u1"), ProviderStatus::Active, "price_unlimited_y");
        sub.current_period_start = None;
        sub.current_period_end = None;
        let now = time::macros::datetime!(2025-05-20 10:00 UTC);

        reconciler.reconcile_at(&sub, now).await.unwrap();
        let record = store.active_subscription("u1").await.unwrap().unwrap();
        assert_eq!(record.starts_at, Some(now));
        assert_eq!(
            record.ends_at,
            Some(time::macros::datetime!(2026-05-20 10:00 UTC))
        );

        // a redelivery without timestamps keeps the stored period
        let again = reconciler
            .reconcile_at(&sub, now + Duration::hours(1))
            .await
            .unwrap();
        assert!(matches!(again, ReconcileOutcome::Unchanged { .. }));
    }

    #[tokio::test]
    async fn test_missing_correlation_key_mutates_nothing() {
        let store = InMemoryLedgerStore::new();
        let reconciler = reconciler(&store);

        let result = reconciler
            .reconcile(&snapshot(None, ProviderStatus::Active, "price_premium_m"))
            .await;

        assert!(matches!(
            result,
            Err(BillingError::MissingCorrelationKey { .. })
        ));
        assert!(store.users_with_multiple_active().await.unwrap().is_empty());
        assert!(store.subscription_history("u1").await.is_empty());
    }

    #[tokio::test]
    async fn test_past_due_cancels_immediately() {
        let store = InMemoryLedgerStore::new();
        let reconciler = reconciler(&store);
        reconciler
            .reconcile(&snapshot(Some("u1"), ProviderStatus::Active, "price_premium_m"))
            .await
            .unwrap();

        let outcome = reconciler
            .reconcile(&snapshot(Some("u1"), ProviderStatus::PastDue, "price_premium_m"))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Canceled {
                user_id: "u1".to_string(),
                canceled: 1
            }
        );
        assert!(store.active_subscription("u1").await.unwrap().is_none());
        let history = store.subscription_history("u1").await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, SubscriptionStatus::Canceled);
        assert!(!store.get_profile("u1").await.unwrap().unwrap().wants_premium);
    }

    #[tokio::test]
    async fn test_unknown_status_is_a_noop() {
        let store = InMemoryLedgerStore::new();
        let reconciler = reconciler(&store);
        reconciler
            .reconcile(&snapshot(Some("u1"), ProviderStatus::Active, "price_premium_m"))
            .await
            .unwrap();

        for status in [
            ProviderStatus::Unpaid,
            ProviderStatus::Incomplete,
            ProviderStatus::Other("on_hold".into()),
        ] {
            let outcome = reconciler
                .reconcile(&snapshot(Some("u1"), status, "price_premium_m"))
                .await
                .unwrap();
            assert!(matches!(outcome, ReconcileOutcome::Ignored { .. }));
        }
        assert!(store.active_subscription("u1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_active_with_unmapped_price_is_ignored() {
        let store = InMemoryLedgerStore::new();
        let reconciler = reconciler(&store);

        let outcome = reconciler
            .reconcile(&snapshot(Some("u1"), ProviderStatus::Active, "price_unknown"))
            .await
            .unwrap();

        assert!(matches!(outcome, ReconcileOutcome::Ignored { .. }));
        assert!(store.subscription_history("u1").await.is_empty());
    }

    #[tokio::test]
    async fn test_persistence_failure_propagates() {
        let store = InMemoryLedgerStore::new();
        let reconciler = reconciler(&store);
        store.fail_writes_for("u1").await;

        let err = reconciler
            .reconcile(&snapshot(Some("u1"), ProviderStatus::Active, "price_premium_m"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_same_tier_renewal_keeps_usage() {
        let store = InMemoryLedgerStore::new();
        let reconciler = reconciler(&store);
        let first = snapshot(Some("u1"), ProviderStatus::Active, "price_premium_m");
        reconciler.reconcile(&first).await.unwrap();
        store
            .record_usage(
                "u1",
                Feature::Numerology,
                serde_json::json!({}),
                OffsetDateTime::now_utc(),
            )
            .await
            .unwrap();

        let mut renewal = first.clone();
        renewal.current_period_start = first.current_period_end;
        renewal.current_period_end = first.current_period_end.map(|e| e + Duration::days(30));
        let outcome = reconciler.reconcile(&renewal).await.unwrap();

        assert!(matches!(
            outcome,
            ReconcileOutcome::Activated {
                tier_changed: false,
                ..
            }
        ));
        let usage = UsageCounter::new(Arc::new(store.clone()));
        assert_eq!(
            usage
                .count("u1", Feature::Numerology, OffsetDateTime::now_utc())
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_tier_change_reset_survives_failed_insert() {
        let store = InMemoryLedgerStore::new();
        let reconciler = reconciler(&store);
        reconciler
            .reconcile(&snapshot(Some("u1"), ProviderStatus::Active, "price_premium_m"))
            .await
            .unwrap();
        for _ in 0..2 {
            store
                .record_usage(
                    "u1",
                    Feature::Numerology,
                    serde_json::json!({}),
                    OffsetDateTime::now_utc(),
                )
                .await
                .unwrap();
        }

        let upgrade = snapshot(Some("u1"), ProviderStatus::Active, "price_unlimited_m");
        store.fail_next_insert_for("u1").await;
        let err = reconciler.reconcile(&upgrade).await.unwrap_err();
        assert!(err.is_retryable());

        // redelivery sees no active row, the reset already happened
        let outcome = reconciler.reconcile(&upgrade).await.unwrap();
        assert!(matches!(
            outcome,
            ReconcileOutcome::Activated {
                tier: SubscriptionTier::Unlimited,
                ..
            }
        ));
        let record = store.active_subscription("u1").await.unwrap().unwrap();
        assert_eq!(record.tier, SubscriptionTier::Unlimited);
        let usage = UsageCounter::new(Arc::new(store.clone()));
        assert_eq!(
            usage
                .count("u1", Feature::Numerology, OffsetDateTime::now_utc())
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_downgrade_expired_keeps_intent_after_renewal() {
        let store = InMemoryLedgerStore::new();
        let reconciler = reconciler(&store);
        let renewed = snapshot(Some("u1"), ProviderStatus::Active, "price_premium_m");
        reconciler.reconcile(&renewed).await.unwrap();
        let before_end = time::macros::datetime!(2025-03-15 00:00 UTC);

        // nothing expired, the renewed row is still active
        let canceled = reconciler.downgrade_expired("u1", before_end).await.unwrap();
        assert_eq!(canceled, 0);
        assert!(store.get_profile("u1").await.unwrap().unwrap().wants_premium);

        let after_end = time::macros::datetime!(2025-04-02 00:00 UTC);
        let canceled = reconciler.downgrade_expired("u1", after_end).await.unwrap();
        assert_eq!(canceled, 1);
        assert!(!store.get_profile("u1").await.unwrap().unwrap().wants_premium);
    }

    #[tokio::test]
    async fn test_downgrade_expired_clears_stale_intent_without_record() {
        let store = InMemoryLedgerStore::new();
        let reconciler = reconciler(&store);
        store
            .create_profile(NewProfile::placeholder("u1", None))
            .await
            .unwrap();
        store.set_wants_premium("u1", true).await.unwrap();

        let canceled = reconciler
            .downgrade_expired("u1", OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(canceled, 0);
        assert!(!store.get_profile("u1").await.unwrap().unwrap().wants_premium);
    }

    #[tokio::test]
    async fn test_sync_attaches_user_and_reconciles() {
        let store = InMemoryLedgerStore::new();
        let provider = Arc::new(FakeProvider::default());
        let reconciler = reconciler_with(&store, provider.clone());

        reconciler
            .reconcile(&snapshot(Some("u1"), ProviderStatus::Active, "price_premium_m"))
            .await
            .unwrap();

        let mut upgraded = snapshot(None, ProviderStatus::Active, "price_unlimited_m");
        upgraded.id = "sub_new".to_string();
        provider.subscriptions.lock().await.push(upgraded);

        let sync = reconciler.sync_user("u1").await.unwrap();
        assert_eq!(sync.subscription_id.as_deref(), Some("sub_new"));
        assert!(matches!(
            sync.outcome,
            ReconcileOutcome::Activated {
                tier: SubscriptionTier::Unlimited,
                tier_changed: true,
                ..
            }
        ));
        assert_eq!(
            provider.metadata_updates.lock().await.as_slice(),
            &[("sub_new".to_string(), "u1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_sync_without_provider_subscription_cancels() {
        let store = InMemoryLedgerStore::new();
        let reconciler = reconciler(&store);
        reconciler
            .reconcile(&snapshot(Some("u1"), ProviderStatus::Active, "price_premium_m"))
            .await
            .unwrap();

        let sync = reconciler.sync_user("u1").await.unwrap();
        assert_eq!(sync.subscription_id, None);
        assert!(matches!(sync.outcome, ReconcileOutcome::Canceled { .. }));
    }

    #[tokio::test]
    async fn test_sync_without_customer_is_not_found() {
        let store = InMemoryLedgerStore::new();
        let reconciler = reconciler(&store);
        assert!(matches!(
            reconciler.sync_user("stranger").await,
            Err(BillingError::NotFound(_))
        ));
    }
}
