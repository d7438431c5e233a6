//! Account deletion

use axum::{
    extract::{Extension, State},
    Json,
};
use serde_json::{json, Value};

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

/// Purge the caller's profile, subscription history and usage events.
///
/// Any live Stripe subscription is left alone; its next webhook finds no
/// profile and recreates a placeholder on reconciliation.
pub async fn delete_account(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<Value>> {
    tracing::info!(user_id = %auth_user.user_id, "Account deletion requested");
    state.ledger.store.delete_user(&auth_user.user_id).await?;
    Ok(Json(json!({ "deleted": true })))
}
