//! API error type and its JSON rendering

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use numera_billing::BillingError;

pub type ApiResult<T> = Result<T, ApiError>;

const GENERIC_ERROR: &str = "Something went wrong. Please try again or contact support.";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "Request failed");
                GENERIC_ERROR.to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::InvalidInput(msg) => ApiError::BadRequest(msg),
            BillingError::WebhookSignatureInvalid => {
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            BillingError::WebhookEventNotSupported(msg) => ApiError::BadRequest(msg),
            e @ BillingError::MissingCorrelationKey { .. } => ApiError::BadRequest(e.to_string()),
            e @ (BillingError::Config(_)
            | BillingError::Database(_)
            | BillingError::StripeApi(_)
            | BillingError::Timeout(_)
            | BillingError::Internal(_)) => ApiError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_errors_map_to_status() {
        let cases = [
            (BillingError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (BillingError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (BillingError::WebhookSignatureInvalid, StatusCode::BAD_REQUEST),
            (BillingError::Database("down".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (BillingError::Timeout("slow".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (billing, status) in cases {
            assert_eq!(ApiError::from(billing).status(), status);
        }
    }

    #[tokio::test]
    async fn test_internal_errors_hide_detail() {
        let response = ApiError::Internal("connection refused".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], GENERIC_ERROR);
        assert_eq!(body["code"], 500);
    }
}
