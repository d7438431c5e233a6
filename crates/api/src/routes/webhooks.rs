//! Stripe webhook endpoint

use axum::{extract::State, http::HeaderMap, Json};
use serde::Serialize;

use numera_billing::WebhookOutcome;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub received: bool,
    #[serde(flatten)]
    pub outcome: WebhookOutcome,
}

/// Verify, then reconcile. Retryable failures answer 500 so Stripe
/// redelivers; undeliverable events are acknowledged.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<WebhookResponse>> {
    let signature = headers
        .get("Stripe-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing Stripe-Signature header".to_string()))?;

    let event = state.ledger.webhooks.verify_event(&body, signature)?;
    let outcome = state.ledger.webhooks.handle_event(event).await?;

    if let WebhookOutcome::Undeliverable {
        subscription_id,
        reason,
    } = &outcome
    {
        tracing::warn!(
            subscription_id = %subscription_id,
            reason = %reason,
            "Acknowledging webhook that cannot be attributed to a user"
        );
    }

    Ok(Json(WebhookResponse {
        received: true,
        outcome,
    }))
}
