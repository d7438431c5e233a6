//! Application state

use sqlx::PgPool;

use numera_billing::{BillingResult, LedgerService};

use crate::{
    auth::{CronToken, JwtManager},
    config::Config,
};

/// Identity tokens are issued elsewhere; this only bounds locally issued ones
const LOCAL_TOKEN_EXPIRY_HOURS: i64 = 24;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub jwt_manager: JwtManager,
    pub cron_token: CronToken,
    pub ledger: LedgerService,
}

impl AppState {
    /// Build the state over Postgres and Stripe
    pub fn new(pool: PgPool, config: Config) -> BillingResult<Self> {
        let ledger = LedgerService::from_env(pool)?;
        tracing::info!("Subscription ledger initialized");
        Ok(Self::with_ledger(config, ledger))
    }

    /// Build the state around an existing ledger
    pub fn with_ledger(config: Config, ledger: LedgerService) -> Self {
        Self {
            jwt_manager: JwtManager::new(&config.jwt_secret, LOCAL_TOKEN_EXPIRY_HOURS),
            cron_token: CronToken::new(config.cron_secret.clone()),
            config,
            ledger,
        }
    }
}
