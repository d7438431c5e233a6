//! Periodic expiry sweep.
//!
//! Downgrades every paid active record whose period has ended and reports
//! records ending soon. Each user is processed independently: a failure is
//! recorded in the report and the sweep moves on. Re-running the sweep is a
//! no-op for users already downgraded because they no longer match the
//! expired-and-active query.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use time::{Duration, OffsetDateTime};

use numera_shared::SubscriptionTier;

use crate::error::BillingResult;
use crate::reconciler::Reconciler;
use crate::status::days_remaining;
use crate::store::LedgerStore;

/// Per-user result of a downgrade attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SweepOutcome {
    #[serde(rename = "downgraded_to_free", rename_all = "camelCase")]
    Downgraded {
        user_id: String,
        previous_tier: SubscriptionTier,
        #[serde(with = "time::serde::rfc3339::option")]
        expired_at: Option<OffsetDateTime>,
    },
    #[serde(rename = "error", rename_all = "camelCase")]
    Failed { user_id: String, error: String },
}

impl SweepOutcome {
    pub fn user_id(&self) -> &str {
        match self {
            SweepOutcome::Downgraded { user_id, .. } | SweepOutcome::Failed { user_id, .. } => {
                user_id
            }
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, SweepOutcome::Failed { .. })
    }
}

/// A paid subscription ending inside the warning window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiryWarning {
    pub user_id: String,
    pub tier: SubscriptionTier,
    #[serde(with = "time::serde::rfc3339")]
    pub ends_at: OffsetDateTime,
    pub days_until_expiry: i64,
}

/// Complete outcome of one sweep run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub processed: usize,
    pub expired: Vec<SweepOutcome>,
    pub expiring_soon: Vec<ExpiryWarning>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl SweepReport {
    pub fn downgraded(&self) -> usize {
        self.expired.iter().filter(|o| !o.is_failure()).count()
    }

    pub fn failed(&self) -> usize {
        self.expired.iter().filter(|o| o.is_failure()).count()
    }
}

/// Runs the expiry sweep
#[derive(Clone)]
pub struct SweepService {
    store: Arc<dyn LedgerStore>,
    reconciler: Reconciler,
    warning_window: Duration,
}

impl SweepService {
    pub const DEFAULT_WARNING_DAYS: i64 = 7;

    pub fn new(store: Arc<dyn LedgerStore>, reconciler: Reconciler, warning_days: i64) -> Self {
        Self {
            store,
            reconciler,
            warning_window: Duration::days(warning_days),
        }
    }

    pub async fn run(&self) -> BillingResult<SweepReport> {
        self.run_at(OffsetDateTime::now_utc()).await
    }

    /// Sweep with an explicit clock.
    ///
    /// Only a failure to list expired records fails the whole run.
    pub async fn run_at(&self, now: OffsetDateTime) -> BillingResult<SweepReport> {
        let expired_records = self.store.expired_active_subscriptions(now).await?;

        let mut seen = HashSet::new();
        let mut expired = Vec::new();

        for record in expired_records {
            if !seen.insert(record.user_id.clone()) {
                continue;
            }

            let outcome = match self.reconciler.downgrade_expired(&record.user_id, now).await {
                Ok(_) => SweepOutcome::Downgraded {
                    user_id: record.user_id.clone(),
                    previous_tier: record.tier,
                    expired_at: record.ends_at,
                },
                Err(e) => {
                    tracing::error!(
                        user_id = %record.user_id,
                        error = %e,
                        "Failed to downgrade expired subscription"
                    );
                    SweepOutcome::Failed {
                        user_id: record.user_id.clone(),
                        error: e.to_string(),
                    }
                }
            };
            expired.push(outcome);
        }

        let expiring_soon = self.expiring_soon(now).await;

        Ok(SweepReport {
            processed: expired.len(),
            expired,
            expiring_soon,
            timestamp: now,
        })
    }

    /// Informational only; a failed lookup yields an empty list
    async fn expiring_soon(&self, now: OffsetDateTime) -> Vec<ExpiryWarning> {
        match self
            .store
            .subscriptions_expiring_between(now, now + self.warning_window)
            .await
        {
            Ok(records) => records
                .into_iter()
                .filter_map(|r| {
                    let ends_at = r.ends_at?;
                    Some(ExpiryWarning {
                        user_id: r.user_id,
                        tier: r.tier,
                        ends_at,
                        days_until_expiry: days_remaining(ends_at, now),
                    })
                })
                .collect(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to list subscriptions expiring soon");
                Vec::new()
            }
        }
    }
}

/// Log a sweep report, one line per failure
pub fn log_sweep_report(report: &SweepReport) {
    tracing::info!(
        processed = report.processed,
        downgraded = report.downgraded(),
        errors = report.failed(),
        expiring_soon = report.expiring_soon.len(),
        "Expiry sweep complete"
    );

    for outcome in &report.expired {
        if let SweepOutcome::Failed { user_id, error } = outcome {
            tracing::error!(user_id = %user_id, error = %error, "Sweep failed to downgrade user");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::tests::reconciler;
    use crate::store::{InMemoryLedgerStore, NewSubscription};
    use numera_shared::BillingCycle;
    use time::macros::datetime;

    fn paid_until(user_id: &str, ends_at: OffsetDateTime) -> NewSubscription {
        NewSubscription {
            user_id: user_id.to_string(),
            tier: SubscriptionTier::Premium,
            billing_cycle: BillingCycle::Monthly,
            starts_at: Some(ends_at - Duration::days(30)),
            ends_at: Some(ends_at),
            external_subscription_id: None,
            external_customer_id: None,
        }
    }

    #[tokio::test]
    async fn test_warning_window_report() {
        let store = InMemoryLedgerStore::new();
        let sweep = SweepService::new(Arc::new(store.clone()), reconciler(&store), 7);
        let now = datetime!(2025-06-01 00:00 UTC);

        store
            .insert_subscription(paid_until("soon", now + Duration::hours(60)))
            .await
            .unwrap();
        store
            .insert_subscription(paid_until("later", now + Duration::days(20)))
            .await
            .unwrap();

        let report = sweep.run_at(now).await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.expiring_soon.len(), 1);
        assert_eq!(report.expiring_soon[0].user_id, "soon");
        assert_eq!(report.expiring_soon[0].days_until_expiry, 3);
        assert!(
            store.active_subscription("soon").await.unwrap().is_some(),
            "warnings never mutate"
        );
    }

    #[tokio::test]
    async fn test_report_serializes_legacy_shape() {
        let report = SweepReport {
            processed: 1,
            expired: vec![SweepOutcome::Failed {
                user_id: "u1".into(),
                error: "boom".into(),
            }],
            expiring_soon: vec![],
            timestamp: datetime!(2025-06-01 00:00 UTC),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["expired"][0]["status"], "error");
        assert_eq!(json["expired"][0]["userId"], "u1");
        assert_eq!(json["expiringSoon"], serde_json::json!([]));
    }
}
