//! Scheduler-only routes

use axum::{extract::State, Json};

use numera_billing::{log_sweep_report, InvariantCheckSummary, SweepReport};

use crate::{error::ApiResult, state::AppState};

/// Run the expiry sweep on demand
pub async fn monitor_subscriptions(State(state): State<AppState>) -> ApiResult<Json<SweepReport>> {
    let report = state.ledger.sweep.run().await?;
    log_sweep_report(&report);
    Ok(Json(report))
}

pub async fn check_invariants(
    State(state): State<AppState>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let summary = state.ledger.invariants.run_all_checks().await?;
    if !summary.healthy {
        tracing::warn!(
            checks_failed = summary.checks_failed,
            violations = summary.violations.len(),
            "Ledger invariant violations detected"
        );
    }
    Ok(Json(summary))
}
