// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries provider messages verbatim
#![allow(clippy::too_many_arguments)] // Service wiring takes every collaborator explicitly
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Numera Subscription & Usage Ledger
//!
//! Keeps each user's subscription tier in step with Stripe and meters the
//! paid features against per-tier monthly quotas.
//!
//! ## Features
//!
//! - **Tier Resolver**: Map Stripe price ids to a tier and billing cycle
//! - **Reconciler**: Apply Stripe subscription state to the ledger, idempotently
//! - **Subscription Management**: Plan and cycle changes, scheduled cancellation
//! - **Expiry Detection**: Force expired subscriptions to free on every read
//! - **Periodic Sweep**: Downgrade expired subscriptions in bulk and report upcoming expiries
//! - **Feature Gate**: Check current-month usage against the tier's quota
//! - **Usage Counter**: Record, count and reset per-feature usage
//! - **Webhooks**: Verify and dispatch Stripe events
//! - **Invariants**: Read-only ledger consistency checks

pub mod client;
pub mod error;
pub mod gate;
pub mod invariants;
pub mod manage;
pub mod pricing;
pub mod quota;
pub mod reconciler;
pub mod status;
pub mod store;
pub mod subscriptions;
pub mod sweep;
pub mod usage;
pub mod webhooks;


use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use numera_shared::{env_or, env_parse_or, ConfigError};

// Client
pub use client::{
    BillingItem, BillingProvider, BillingSubscription, ProviderStatus, StripeClient, StripeConfig,
};

// Error
pub use error::{BillingError, BillingResult};

// Gate
pub use gate::{limit_reached_message, FeatureAccess, FeatureGate};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Manage
pub use manage::{ManageAction, ManageOutcome, SubscriptionManager};

// Pricing
pub use pricing::{PriceCatalog, PriceIds, ResolvedPrice, TestPriceFallback, TierResolver};

// Quota
pub use quota::{Allowance, PerFeature, QuotaTable};

// Reconciler
pub use reconciler::{ReconcileOutcome, Reconciler, SyncOutcome};

// Status
pub use status::{
    compute_effective_tier, days_remaining, EffectiveTier, SubscriptionStatusService,
    SubscriptionStatusView, SubscriptionSummary,
};

// Store
pub use store::{
    InMemoryLedgerStore, LedgerStore, NewProfile, NewSubscription, PgLedgerStore,
    SubscriptionRecord, UserProfile,
};

// Subscriptions
pub use subscriptions::{add_months, BillingPeriod, SubscriptionStore};

// Sweep
pub use sweep::{log_sweep_report, ExpiryWarning, SweepOutcome, SweepReport, SweepService};

// Usage
pub use usage::{month_start, UsageCounter};

// Webhooks
pub use webhooks::{WebhookAction, WebhookHandler, WebhookOutcome};

/// Ledger-wide settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Stripe metadata key holding our user id
    pub user_metadata_key: String,
    pub expiry_warning_days: i64,
    /// Upper bound on every persistence call
    pub store_timeout: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            user_metadata_key: "user_id".to_string(),
            expiry_warning_days: SweepService::DEFAULT_WARNING_DAYS,
            store_timeout: PgLedgerStore::DEFAULT_TIMEOUT,
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let user_metadata_key = env_or("BILLING_USER_METADATA_KEY", "user_id");
        if user_metadata_key.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "BILLING_USER_METADATA_KEY".to_string(),
                reason: "must not be blank".to_string(),
            });
        }

        Ok(Self {
            user_metadata_key,
            expiry_warning_days: env_parse_or(
                "BILLING_EXPIRY_WARNING_DAYS",
                SweepService::DEFAULT_WARNING_DAYS,
            )?,
            store_timeout: Duration::from_secs(env_parse_or("BILLING_STORE_TIMEOUT_SECS", 5u64)?),
        })
    }
}

/// Main ledger service that wires every component over one store and one
/// billing provider
#[derive(Clone)]
pub struct LedgerService {
    pub store: Arc<dyn LedgerStore>,
    pub resolver: Arc<TierResolver>,
    pub quotas: Arc<QuotaTable>,
    pub usage: UsageCounter,
    pub subscriptions: SubscriptionStore,
    pub reconciler: Reconciler,
    pub manager: SubscriptionManager,
    pub status: SubscriptionStatusService,
    pub gate: FeatureGate,
    pub sweep: SweepService,
    pub invariants: InvariantChecker,
    pub webhooks: WebhookHandler,
}

impl LedgerService {
    /// Create the ledger from environment variables over Postgres and Stripe
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = LedgerConfig::from_env()?;
        let stripe = StripeClient::from_env()?;
        let webhook_secret = stripe.config().webhook_secret.clone();
        let store = PgLedgerStore::new(pool).with_timeout(config.store_timeout);

        Ok(Self::new(
            Arc::new(store),
            Arc::new(stripe),
            webhook_secret,
            TierResolver::from_env()?,
            QuotaTable::from_env()?,
            config,
        ))
    }

    /// Create the ledger with explicit collaborators
    pub fn new(
        store: Arc<dyn LedgerStore>,
        provider: Arc<dyn BillingProvider>,
        webhook_secret: impl Into<String>,
        resolver: TierResolver,
        quotas: QuotaTable,
        config: LedgerConfig,
    ) -> Self {
        let resolver = Arc::new(resolver);
        let quotas = Arc::new(quotas);
        let usage = UsageCounter::new(store.clone());
        let reconciler = Reconciler::new(
            store.clone(),
            resolver.clone(),
            provider.clone(),
            config.user_metadata_key.clone(),
        );
        let status =
            SubscriptionStatusService::new(store.clone(), reconciler.clone(), quotas.clone());
        let subscriptions = SubscriptionStore::new(store.clone());

        Self {
            manager: SubscriptionManager::new(
                subscriptions.clone(),
                resolver.clone(),
                provider.clone(),
                reconciler.clone(),
            ),
            subscriptions,
            gate: FeatureGate::new(status.clone(), usage.clone(), quotas.clone()),
            sweep: SweepService::new(
                store.clone(),
                reconciler.clone(),
                config.expiry_warning_days,
            ),
            invariants: InvariantChecker::new(store.clone()),
            webhooks: WebhookHandler::new(webhook_secret, provider, reconciler.clone()),
            status,
            reconciler,
            usage,
            quotas,
            resolver,
            store,
        }
    }
}
