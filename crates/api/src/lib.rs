// API library clippy configuration
#![allow(clippy::result_large_err)] // ApiError wraps billing errors verbatim
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Numera API
//!
//! HTTP surface of the subscription ledger: status reads, feature gating and
//! usage recording, Stripe webhooks and the scheduler-triggered expiry sweep.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod security;
pub mod state;


pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
