//! Subscription status, sync, plan management and manual usage reset

use axum::{
    body::Bytes,
    extract::{Extension, State},
    Json,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use numera_billing::{
    ManageAction, ManageOutcome, PerFeature, PriceIds, SubscriptionStatusView, SyncOutcome,
};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Full subscription view, creating the profile on first sight
pub async fn status(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionStatusView>> {
    let view = state
        .ledger
        .status
        .status(&auth_user.user_id, auth_user.email.as_deref())
        .await?;
    Ok(Json(view))
}

/// Re-read the user's subscription from Stripe
pub async fn sync(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<SyncOutcome>> {
    tracing::info!(user_id = %auth_user.user_id, "Manual subscription sync requested");
    let outcome = state.ledger.reconciler.sync_user(&auth_user.user_id).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManageRequest {
    pub action: String,
    #[serde(default)]
    pub price_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ManageResponse {
    pub success: bool,
    #[serde(flatten)]
    pub result: ManageOutcome,
}

/// Change plan or cycle, or schedule/undo cancellation, on the caller's
/// own subscription
pub async fn manage(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    body: Bytes,
) -> ApiResult<Json<ManageResponse>> {
    let request: ManageRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {}", e)))?;
    let action = ManageAction::parse(&request.action, request.price_id)?;

    let result = state.ledger.manager.apply(&auth_user.user_id, action).await?;
    tracing::info!(
        user_id = %auth_user.user_id,
        action = result.action,
        subscription_id = %result.subscription_id,
        "Subscription change applied"
    );
    Ok(Json(ManageResponse {
        success: true,
        result,
    }))
}

#[derive(Debug, Serialize)]
pub struct ResetUsageResponse {
    pub success: bool,
    pub deleted: PerFeature<u64>,
}

pub async fn reset_usage(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<ResetUsageResponse>> {
    let deleted = state
        .ledger
        .usage
        .reset_current_month(&auth_user.user_id, OffsetDateTime::now_utc())
        .await?;

    tracing::info!(
        user_id = %auth_user.user_id,
        deleted = ?deleted,
        "Reset current month usage"
    );
    Ok(Json(ResetUsageResponse {
        success: true,
        deleted,
    }))
}

/// Configured Stripe price ids for building checkout requests
pub async fn price_ids(State(state): State<AppState>) -> Json<PriceIds> {
    Json(state.ledger.resolver.catalog().price_ids().clone())
}
