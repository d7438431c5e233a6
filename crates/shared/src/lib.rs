#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Types and plumbing shared by every Numera crate.
//!
//! The ledger's vocabulary (tiers, subscription statuses, billing cycles and
//! metered features) lives here so the API, the billing core and the worker
//! agree on the strings that end up in the database.

pub mod config;
pub mod db;
pub mod types;

pub use config::{env_flag, env_or, env_parse_or, required_env, ConfigError};
pub use db::{create_pool, run_migrations, DbConfig};
pub use types::{
    BillingCycle, Feature, ParseDomainError, SubscriptionStatus, SubscriptionTier,
};
