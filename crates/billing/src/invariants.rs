//! Ledger invariants
//!
//! Read-only consistency checks over the subscription ledger. Cross-row
//! invariants are kept by write ordering rather than database constraints,
//! so concurrent deliveries can briefly break them; these checks report
//! that drift for operators and tests. Checks never write.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::store::LedgerStore;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<String>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Entitlement is ambiguous
    Critical,
    High,
    /// Self-heals on the next sweep or read
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Clone)]
pub struct InvariantChecker {
    store: Arc<dyn LedgerStore>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        self.run_all_checks_at(OffsetDateTime::now_utc()).await
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks_at(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();
        violations.extend(self.check_single_active_subscription().await?);
        violations.extend(self.check_expired_still_active(now).await?);

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// At most one active record per user, across the whole ledger
    pub async fn check_single_active_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        Ok(self
            .store
            .users_with_multiple_active()
            .await?
            .into_iter()
            .map(|(user_id, count)| multiple_active(user_id, count))
            .collect())
    }

    /// At most one active record for each of the given users
    pub async fn check_single_active(
        &self,
        user_ids: &[&str],
    ) -> BillingResult<Vec<InvariantViolation>> {
        let mut violations = Vec::new();
        for user_id in user_ids {
            let count = self.store.active_subscriptions(user_id).await?.len() as u64;
            if count > 1 {
                violations.push(multiple_active(user_id.to_string(), count));
            }
        }
        Ok(violations)
    }

    /// Paid records past `ends_at` that nothing has downgraded yet
    pub async fn check_expired_still_active(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<InvariantViolation>> {
        Ok(self
            .store
            .expired_active_subscriptions(now)
            .await?
            .into_iter()
            .map(|record| InvariantViolation {
                invariant: "expired_still_active".to_string(),
                description: format!(
                    "Active {} subscription ended at {:?} but was not downgraded",
                    record.tier, record.ends_at
                ),
                context: serde_json::json!({
                    "subscription_id": record.id,
                    "tier": record.tier,
                    "ends_at": record.ends_at.map(|t| t.unix_timestamp()),
                }),
                user_ids: vec![record.user_id],
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_active_subscription" => self.check_single_active_subscription().await,
            "expired_still_active" => {
                self.check_expired_still_active(OffsetDateTime::now_utc())
                    .await
            }
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec!["single_active_subscription", "expired_still_active"]
    }
}

fn multiple_active(user_id: String, count: u64) -> InvariantViolation {
    InvariantViolation {
        invariant: "single_active_subscription".to_string(),
        user_ids: vec![user_id],
        description: format!("User has {} active subscriptions (expected at most 1)", count),
        context: serde_json::json!({ "subscription_count": count }),
        severity: ViolationSeverity::Critical,
    }
}
