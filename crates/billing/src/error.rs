//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("Subscription {subscription_id} has no '{key}' metadata")]
    MissingCorrelationKey {
        subscription_id: String,
        key: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether a caller (or Stripe, via webhook redelivery) should try again.
    ///
    /// Persistence and provider failures are transient. Bad input, missing
    /// correlation metadata and signature failures will fail the same way
    /// on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::Database(_)
                | BillingError::StripeApi(_)
                | BillingError::Timeout(_)
                | BillingError::Internal(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}

impl From<numera_shared::ConfigError> for BillingError {
    fn from(e: numera_shared::ConfigError) -> Self {
        BillingError::Config(e.to_string())
    }
}

impl From<numera_shared::ParseDomainError> for BillingError {
    fn from(e: numera_shared::ParseDomainError) -> Self {
        BillingError::Database(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BillingError::Database("down".into()).is_retryable());
        assert!(BillingError::Timeout("store".into()).is_retryable());
        assert!(BillingError::StripeApi("502".into()).is_retryable());
        assert!(!BillingError::WebhookSignatureInvalid.is_retryable());
        assert!(!BillingError::InvalidInput("bad".into()).is_retryable());
        assert!(!BillingError::MissingCorrelationKey {
            subscription_id: "sub_1".into(),
            key: "user_id".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_correlation_error_message() {
        let err = BillingError::MissingCorrelationKey {
            subscription_id: "sub_123".into(),
            key: "user_id".into(),
        };
        assert_eq!(
            err.to_string(),
            "Subscription sub_123 has no 'user_id' metadata"
        );
    }
}
