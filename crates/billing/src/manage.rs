//! User-initiated subscription changes.
//!
//! Every action goes to the provider first and the returned snapshot is fed
//! through the reconciler, so the ledger only ever reflects state the
//! provider has accepted. The subscription acted on is always the one on the
//! caller's active record; clients never name a subscription id.

use std::sync::Arc;

use serde::Serialize;

use crate::client::BillingProvider;
use crate::error::{BillingError, BillingResult};
use crate::pricing::TierResolver;
use crate::reconciler::{ReconcileOutcome, Reconciler};
use crate::store::SubscriptionRecord;
use crate::subscriptions::SubscriptionStore;

/// A change the user asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManageAction {
    /// Move to another catalog price. `upgrade` is accepted as an alias.
    ChangePlan { price_id: String },
    /// Same tier, other cycle
    ChangeBillingCycle { price_id: String },
    /// Stop renewing at the end of the current period
    Cancel,
    /// Undo a scheduled cancellation
    Reactivate,
}

impl ManageAction {
    pub fn parse(action: &str, price_id: Option<String>) -> BillingResult<Self> {
        let price = |price_id: Option<String>| {
            price_id
                .filter(|p| !p.trim().is_empty())
                .ok_or_else(|| BillingError::InvalidInput("Price ID is required".to_string()))
        };

        match action {
            "upgrade" | "change_plan" => Ok(ManageAction::ChangePlan {
                price_id: price(price_id)?,
            }),
            "change_billing_cycle" => Ok(ManageAction::ChangeBillingCycle {
                price_id: price(price_id)?,
            }),
            "cancel" => Ok(ManageAction::Cancel),
            "reactivate" => Ok(ManageAction::Reactivate),
            _ => Err(BillingError::InvalidInput("Invalid action".to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ManageAction::ChangePlan { .. } => "change_plan",
            ManageAction::ChangeBillingCycle { .. } => "change_billing_cycle",
            ManageAction::Cancel => "cancel",
            ManageAction::Reactivate => "reactivate",
        }
    }

    fn success_message(&self) -> &'static str {
        match self {
            ManageAction::ChangePlan { .. } => "Subscription updated successfully",
            ManageAction::ChangeBillingCycle { .. } => "Billing cycle updated successfully",
            ManageAction::Cancel => {
                "Subscription will be cancelled at the end of the current period"
            }
            ManageAction::Reactivate => "Subscription reactivated successfully",
        }
    }
}

/// Result of an applied action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManageOutcome {
    pub user_id: String,
    pub subscription_id: String,
    pub action: &'static str,
    pub message: &'static str,
    pub cancel_at_period_end: bool,
    pub outcome: ReconcileOutcome,
}

/// Applies plan changes and cancellation scheduling through the provider
#[derive(Clone)]
pub struct SubscriptionManager {
    subscriptions: SubscriptionStore,
    resolver: Arc<TierResolver>,
    provider: Arc<dyn BillingProvider>,
    reconciler: Reconciler,
}

impl SubscriptionManager {
    pub fn new(
        subscriptions: SubscriptionStore,
        resolver: Arc<TierResolver>,
        provider: Arc<dyn BillingProvider>,
        reconciler: Reconciler,
    ) -> Self {
        Self {
            subscriptions,
            resolver,
            provider,
            reconciler,
        }
    }

    pub async fn apply(&self, user_id: &str, action: ManageAction) -> BillingResult<ManageOutcome> {
        let record = self.subscriptions.current(user_id).await?;
        let Some((record, subscription_id)) = record.and_then(|r| {
            let id = r.external_subscription_id.clone()?;
            Some((r, id))
        }) else {
            return Err(BillingError::InvalidInput(
                "No active subscription found".to_string(),
            ));
        };

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            action = action.as_str(),
            "Applying subscription change"
        );

        let mut sub = match &action {
            ManageAction::ChangePlan { price_id } => {
                self.check_plan_change(&record, price_id, false)?;
                self.provider
                    .change_subscription_price(&subscription_id, price_id)
                    .await?
            }
            ManageAction::ChangeBillingCycle { price_id } => {
                self.check_plan_change(&record, price_id, true)?;
                self.provider
                    .change_subscription_price(&subscription_id, price_id)
                    .await?
            }
            ManageAction::Cancel => {
                self.provider
                    .set_cancel_at_period_end(&subscription_id, true)
                    .await?
            }
            ManageAction::Reactivate => {
                self.provider
                    .set_cancel_at_period_end(&subscription_id, false)
                    .await?
            }
        };

        self.reconciler.claim(&mut sub, user_id).await?;
        let outcome = self.reconciler.reconcile(&sub).await?;

        Ok(ManageOutcome {
            user_id: user_id.to_string(),
            subscription_id: sub.id,
            action: action.as_str(),
            message: action.success_message(),
            cancel_at_period_end: sub.cancel_at_period_end,
            outcome,
        })
    }

    /// Only catalog prices are accepted. A cycle change must keep the tier.
    fn check_plan_change(
        &self,
        record: &SubscriptionRecord,
        price_id: &str,
        keep_tier: bool,
    ) -> BillingResult<()> {
        let target = self
            .resolver
            .catalog()
            .lookup(price_id)
            .ok_or_else(|| BillingError::InvalidInput(format!("Unknown price ID: {price_id}")))?;

        if target.tier == record.tier && target.billing_cycle == record.billing_cycle {
            return Err(BillingError::InvalidInput(
                "Subscription is already on this plan".to_string(),
            ));
        }
        if keep_tier && target.tier != record.tier {
            return Err(BillingError::InvalidInput(
                "A billing cycle change must keep the current tier".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ProviderStatus;
    use crate::pricing::tests::sample_resolver;
    use crate::reconciler::tests::{reconciler_with, snapshot, FakeProvider};
    use crate::store::{InMemoryLedgerStore, LedgerStore};
    use crate::usage::month_start;
    use numera_shared::{BillingCycle, Feature, SubscriptionTier};
    use time::OffsetDateTime;

    struct Harness {
        store: InMemoryLedgerStore,
        provider: Arc<FakeProvider>,
        manager: SubscriptionManager,
    }

    /// A user on monthly premium, known to both the provider and the ledger
    async fn subscribed() -> Harness {
        let store = InMemoryLedgerStore::new();
        let provider = Arc::new(FakeProvider::default());
        let reconciler = reconciler_with(&store, provider.clone());

        let sub = snapshot(Some("u1"), ProviderStatus::Active, "price_premium_m");
        provider.subscriptions.lock().await.push(sub.clone());
        reconciler.reconcile(&sub).await.unwrap();

        let manager = SubscriptionManager::new(
            SubscriptionStore::new(Arc::new(store.clone())),
            Arc::new(sample_resolver()),
            provider.clone(),
            reconciler,
        );
        Harness {
            store,
            provider,
            manager,
        }
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!(
            ManageAction::parse("upgrade", Some("price_unlimited_m".into())).unwrap(),
            ManageAction::ChangePlan {
                price_id: "price_unlimited_m".into()
            }
        );
        assert_eq!(
            ManageAction::parse("reactivate", None).unwrap(),
            ManageAction::Reactivate
        );
        assert!(matches!(
            ManageAction::parse("change_plan", Some("  ".into())),
            Err(BillingError::InvalidInput(_))
        ));
        assert!(matches!(
            ManageAction::parse("pause", None),
            Err(BillingError::InvalidInput(msg)) if msg == "Invalid action"
        ));
    }

    #[tokio::test]
    async fn test_upgrade_changes_price_and_reconciles() {
        let h = subscribed().await;
        h.store
            .record_usage(
                "u1",
                Feature::Numerology,
                serde_json::json!({}),
                OffsetDateTime::now_utc(),
            )
            .await
            .unwrap();

        let result = h
            .manager
            .apply(
                "u1",
                ManageAction::ChangePlan {
                    price_id: "price_unlimited_m".into(),
                },
            )
            .await
            .unwrap();

        assert_eq!(result.subscription_id, "sub_abc");
        assert_eq!(result.message, "Subscription updated successfully");
        assert!(matches!(
            result.outcome,
            ReconcileOutcome::Activated {
                tier: SubscriptionTier::Unlimited,
                tier_changed: true,
                ..
            }
        ));
        assert_eq!(
            h.provider.price_changes.lock().await.as_slice(),
            &[("sub_abc".to_string(), "price_unlimited_m".to_string())]
        );
        let record = h.store.active_subscription("u1").await.unwrap().unwrap();
        assert_eq!(record.tier, SubscriptionTier::Unlimited);
        let since = month_start(OffsetDateTime::now_utc());
        assert_eq!(
            h.store
                .count_usage("u1", Feature::Numerology, since)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_billing_cycle_change_keeps_tier() {
        let h = subscribed().await;

        let result = h
            .manager
            .apply(
                "u1",
                ManageAction::ChangeBillingCycle {
                    price_id: "price_premium_y".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(result.message, "Billing cycle updated successfully");
        let record = h.store.active_subscription("u1").await.unwrap().unwrap();
        assert_eq!(record.billing_cycle, BillingCycle::Yearly);
        assert_eq!(record.tier, SubscriptionTier::Premium);

        let err = h
            .manager
            .apply(
                "u1",
                ManageAction::ChangeBillingCycle {
                    price_id: "price_unlimited_m".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_unknown_or_current_price_is_rejected_before_provider_call() {
        let h = subscribed().await;

        for price_id in ["price_mystery", "price_premium_m"] {
            let err = h
                .manager
                .apply(
                    "u1",
                    ManageAction::ChangePlan {
                        price_id: price_id.into(),
                    },
                )
                .await
                .unwrap_err();
            assert!(matches!(err, BillingError::InvalidInput(_)), "{price_id}");
        }
        assert!(h.provider.price_changes.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_and_reactivate_toggle_schedule() {
        let h = subscribed().await;

        let canceled = h.manager.apply("u1", ManageAction::Cancel).await.unwrap();
        assert!(canceled.cancel_at_period_end);
        assert_eq!(
            canceled.message,
            "Subscription will be cancelled at the end of the current period"
        );
        // access continues until the period ends
        assert!(matches!(canceled.outcome, ReconcileOutcome::Unchanged { .. }));
        assert!(h.store.active_subscription("u1").await.unwrap().is_some());

        let resumed = h
            .manager
            .apply("u1", ManageAction::Reactivate)
            .await
            .unwrap();
        assert!(!resumed.cancel_at_period_end);
        assert!(
            !h.provider.subscriptions.lock().await[0].cancel_at_period_end,
            "provider schedule cleared"
        );
    }

    #[tokio::test]
    async fn test_without_subscription_is_rejected() {
        let h = subscribed().await;
        let err = h
            .manager
            .apply("stranger", ManageAction::Cancel)
            .await
            .unwrap_err();
        assert!(
            matches!(err, BillingError::InvalidInput(msg) if msg == "No active subscription found")
        );
    }

    #[tokio::test]
    async fn test_provider_failure_leaves_ledger_untouched() {
        let h = subscribed().await;
        h.provider.subscriptions.lock().await.clear();

        let err = h
            .manager
            .apply(
                "u1",
                ManageAction::ChangePlan {
                    price_id: "price_unlimited_y".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
        let record = h.store.active_subscription("u1").await.unwrap().unwrap();
        assert_eq!(record.tier, SubscriptionTier::Premium);
    }
}
