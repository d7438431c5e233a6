//! Feature gate and usage recording

use axum::{
    body::Bytes,
    extract::{Extension, Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

use numera_billing::{Allowance, FeatureAccess};
use numera_shared::{Feature, SubscriptionTier};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

fn parse_feature(raw: &str) -> ApiResult<Feature> {
    raw.parse()
        .map_err(|e: numera_shared::ParseDomainError| ApiError::NotFound(e.to_string()))
}

/// Empty bodies are recorded as `{}`
fn parse_payload(body: &[u8]) -> ApiResult<serde_json::Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON payload: {}", e)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageCheckResponse {
    #[serde(flatten)]
    pub access: FeatureAccess,
    pub remaining: Option<u64>,
}

pub async fn check_usage(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(feature): Path<String>,
) -> ApiResult<Json<UsageCheckResponse>> {
    let feature = parse_feature(&feature)?;
    let access = state.ledger.gate.can_use(&auth_user.user_id, feature).await?;

    Ok(Json(UsageCheckResponse {
        remaining: access.remaining(),
        access,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedUsage {
    pub feature: Feature,
    pub tier: SubscriptionTier,
    pub used: u64,
    pub limit: Allowance,
    pub remaining: Option<u64>,
}

/// Gate, then record one use. Denied requests get the gate's reason.
pub async fn record_usage(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(feature): Path<String>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<RecordedUsage>)> {
    let feature = parse_feature(&feature)?;
    let payload = parse_payload(&body)?;

    let access = state.ledger.gate.can_use(&auth_user.user_id, feature).await?;
    if !access.allowed {
        return Err(ApiError::Forbidden(access.reason.unwrap_or_else(|| {
            format!("Usage limit reached for {}", feature.display_name())
        })));
    }

    state
        .ledger
        .usage
        .record(&auth_user.user_id, feature, payload)
        .await?;

    // the gate reports 0 used for unlimited allowances
    let used = if access.limit.is_unlimited() {
        access.used
    } else {
        access.used + 1
    };

    Ok((
        StatusCode::CREATED,
        Json(RecordedUsage {
            feature,
            tier: access.tier,
            used,
            limit: access.limit,
            remaining: access.limit.remaining(used),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_payload() {
        assert_eq!(parse_payload(b"").unwrap(), serde_json::json!({}));
        assert_eq!(parse_payload(b" \n").unwrap(), serde_json::json!({}));
        assert_eq!(
            parse_payload(br#"{"name":"Ada","birthDate":"1815-12-10"}"#).unwrap()["name"],
            "Ada"
        );
        assert!(matches!(parse_payload(b"{oops"), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn test_unknown_feature_is_not_found() {
        assert!(matches!(parse_feature("tarot"), Err(ApiError::NotFound(_))));
        assert_eq!(parse_feature("love-match").unwrap(), Feature::LoveMatch);
    }
}
