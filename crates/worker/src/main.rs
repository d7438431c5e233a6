//! Numera Background Worker
//!
//! Handles scheduled jobs:
//! - Expiry sweep: downgrade lapsed subscriptions (daily at 03:00 UTC)
//! - Ledger invariant check (daily at 03:30 UTC, after the sweep)
//! - Heartbeat (every 5 minutes)

use std::time::Duration;

use numera_billing::{log_sweep_report, InvariantCheckSummary, LedgerService};
use numera_shared::{create_pool, required_env, DbConfig};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Cron expressions use six fields, seconds first
const SWEEP_SCHEDULE: &str = "0 0 3 * * *";
const INVARIANT_SCHEDULE: &str = "0 30 3 * * *";
const HEARTBEAT_SCHEDULE: &str = "0 */5 * * * *";

fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(checks_run = summary.checks_run, "Ledger invariants hold");
        return;
    }

    warn!(
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Ledger invariant violations detected"
    );
    for violation in &summary.violations {
        warn!(
            invariant = %violation.invariant,
            severity = %violation.severity,
            user_ids = ?violation.user_ids,
            "{}",
            violation.description
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Numera Worker v{}", env!("CARGO_PKG_VERSION"));

    let db_config = DbConfig::new(required_env("DATABASE_URL")?).with_max_connections(5);
    let pool = create_pool(&db_config).await?;

    let ledger = LedgerService::from_env(pool)?;

    let scheduler = JobScheduler::new().await?;

    // Job 1: Expiry sweep
    let sweep = ledger.sweep.clone();
    scheduler
        .add(Job::new_async(SWEEP_SCHEDULE, move |_uuid, _l| {
            let sweep = sweep.clone();
            Box::pin(async move {
                info!("Running scheduled subscription expiry sweep");
                match sweep.run().await {
                    Ok(report) => log_sweep_report(&report),
                    Err(e) => error!(error = %e, "Expiry sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Subscription expiry sweep (daily at 03:00 UTC)");

    // Job 2: Invariant check
    let invariants = ledger.invariants.clone();
    scheduler
        .add(Job::new_async(INVARIANT_SCHEDULE, move |_uuid, _l| {
            let invariants = invariants.clone();
            Box::pin(async move {
                match invariants.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Invariant check failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Ledger invariant check (daily at 03:30 UTC)");

    // Job 3: Heartbeat
    scheduler
        .add(Job::new_async(HEARTBEAT_SCHEDULE, |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat");
            })
        })?)
        .await?;

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Numera Worker started successfully with 3 scheduled jobs");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
