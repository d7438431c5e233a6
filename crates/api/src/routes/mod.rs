//! HTTP routes

pub mod account;
pub mod ops;
pub mod subscription;
pub mod usage;
pub mod webhooks;

use axum::{
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{
    auth::{require_auth, require_cron_token},
    state::AppState,
};

pub fn create_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route("/api/price-ids", get(subscription::price_ids))
        .route("/api/stripe-webhook", post(webhooks::stripe_webhook));

    let authenticated = Router::new()
        .route("/api/subscription/status", get(subscription::status))
        .route("/api/subscription/sync", post(subscription::sync))
        .route("/api/subscription/manage", post(subscription::manage))
        .route("/api/subscription/reset-usage", post(subscription::reset_usage))
        .route(
            "/api/usage/{feature}",
            get(usage::check_usage).post(usage::record_usage),
        )
        .route("/api/account", delete(account::delete_account))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let scheduler = Router::new()
        .route("/api/subscription/monitor", post(ops::monitor_subscriptions))
        .route("/api/ops/invariants", get(ops::check_invariants))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_cron_token,
        ));

    public
        .merge(authenticated)
        .merge(scheduler)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}
