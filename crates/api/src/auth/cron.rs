//! Shared-secret bearer auth for the externally scheduled sweep

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;

use super::middleware::{extract_bearer_token, AuthError};
use crate::state::AppState;

/// Expected bearer token for scheduler-only routes
#[derive(Clone)]
pub struct CronToken(String);

impl CronToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Exact match, compared in constant time
    pub fn matches(&self, presented: &str) -> bool {
        !self.0.is_empty() && bool::from(self.0.as_bytes().ct_eq(presented.as_bytes()))
    }
}

impl std::fmt::Debug for CronToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CronToken(..)")
    }
}

/// Middleware that requires the cron bearer token
pub async fn require_cron_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = extract_bearer_token(&request)
        .map(|token| state.cron_token.matches(&token))
        .unwrap_or(false);

    if !authorized {
        tracing::warn!(path = %request.uri().path(), "Rejected scheduler request with bad token");
        return AuthError::InvalidCronToken.into_response();
    }
    next.run(request).await
}
