//! Stripe webhook handling
//!
//! Verifies the `Stripe-Signature` header, maps each event to the provider
//! subscription it concerns and hands that subscription to the reconciler.
//! Only verified events ever reach the reconciler.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use stripe::{Event, EventObject, EventType, Subscription, Webhook};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::client::{BillingProvider, BillingSubscription};
use crate::error::{BillingError, BillingResult};
use crate::reconciler::{ReconcileOutcome, Reconciler};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed webhook, in seconds
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Check a `t=...,v1=...` signature header against the raw payload.
///
/// Any of several `v1` entries may match (Stripe sends more than one while a
/// secret is being rolled).
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp,
            now = now_unix,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let expected = sign(payload, timestamp, secret)?;
    let matched = signatures
        .iter()
        .any(|sig| bool::from(expected.as_bytes().ct_eq(sig.as_bytes())));

    if matched {
        Ok(())
    } else {
        tracing::warn!("Webhook signature mismatch");
        Err(BillingError::WebhookSignatureInvalid)
    }
}

/// Hex HMAC-SHA256 of `"{timestamp}.{payload}"`
pub fn sign(payload: &str, timestamp: i64, secret: &str) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// What a verified event asks the ledger to do
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookAction {
    /// The event embeds the subscription
    Reconcile(BillingSubscription),
    /// The event only references the subscription by id
    Retrieve { subscription_id: String },
    /// Not a subscription-lifecycle event
    Ignore { event_type: String },
}

/// Result of handling one event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Reconciled { outcome: ReconcileOutcome },
    /// The subscription carries no user correlation key and never will on
    /// redelivery, so the event is acknowledged and dropped
    Undeliverable {
        subscription_id: String,
        reason: String,
    },
    Skipped { event_type: String },
}

/// Webhook handler for Stripe events
#[derive(Clone)]
pub struct WebhookHandler {
    webhook_secret: String,
    provider: Arc<dyn BillingProvider>,
    reconciler: Reconciler,
}

impl WebhookHandler {
    pub fn new(
        webhook_secret: impl Into<String>,
        provider: Arc<dyn BillingProvider>,
        reconciler: Reconciler,
    ) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            provider,
            reconciler,
        }
    }

    /// Verify and parse a Stripe webhook event
    ///
    /// `Webhook::construct_event` keeps only one `v1` entry of the header, so
    /// an event signed while the secret is being rolled can fail there. On
    /// failure the signature is re-checked by hand against every `v1` entry
    /// and the payload is parsed into the same typed [`Event`]. A payload the
    /// crate cannot deserialize is rejected either way.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        match Webhook::construct_event(payload, signature, &self.webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::debug!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        verify_signature(
            payload,
            signature,
            &self.webhook_secret,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;

        serde_json::from_str::<Event>(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookEventNotSupported(format!("Unparseable event: {}", e))
        })
    }

    /// Handle a verified Stripe event
    pub async fn handle_event(&self, event: Event) -> BillingResult<WebhookOutcome> {
        tracing::info!(
            event_type = %event.type_,
            event_id = %event.id,
            "Processing Stripe webhook event"
        );
        let action = action_for(event)?;
        self.apply(action).await
    }

    /// Execute an action. Split from [`handle_event`](Self::handle_event)
    /// so it can run without a signed Stripe payload.
    pub async fn apply(&self, action: WebhookAction) -> BillingResult<WebhookOutcome> {
        let subscription = match action {
            WebhookAction::Ignore { event_type } => {
                tracing::info!(event_type = %event_type, "Unhandled Stripe event type");
                return Ok(WebhookOutcome::Skipped { event_type });
            }
            WebhookAction::Reconcile(subscription) => subscription,
            WebhookAction::Retrieve { subscription_id } => {
                self.provider.retrieve_subscription(&subscription_id).await?
            }
        };

        match self.reconciler.reconcile(&subscription).await {
            Ok(outcome) => Ok(WebhookOutcome::Reconciled { outcome }),
            Err(e @ BillingError::MissingCorrelationKey { .. }) => {
                Ok(WebhookOutcome::Undeliverable {
                    subscription_id: subscription.id,
                    reason: e.to_string(),
                })
            }
            Err(e) => {
                tracing::error!(
                    subscription_id = %subscription.id,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Reconciliation failed"
                );
                Err(e)
            }
        }
    }
}

/// Map an event to the subscription it concerns
pub fn action_for(event: Event) -> BillingResult<WebhookAction> {
    let event_type = event.type_;

    match event_type {
        EventType::CheckoutSessionCompleted => match event.data.object {
            EventObject::CheckoutSession(session) => Ok(session
                .subscription
                .map(|sub| WebhookAction::Retrieve {
                    subscription_id: sub.id().to_string(),
                })
                .unwrap_or_else(|| WebhookAction::Ignore {
                    event_type: event_type.to_string(),
                })),
            _ => Err(BillingError::WebhookEventNotSupported(
                "Expected CheckoutSession".to_string(),
            )),
        },

        EventType::CustomerSubscriptionCreated
        | EventType::CustomerSubscriptionUpdated
        | EventType::CustomerSubscriptionDeleted => {
            let subscription = extract_subscription(event.data.object)?;
            Ok(WebhookAction::Reconcile(BillingSubscription::from(
                &subscription,
            )))
        }

        EventType::InvoicePaymentSucceeded | EventType::InvoicePaymentFailed => {
            match event.data.object {
                EventObject::Invoice(invoice) => Ok(invoice
                    .subscription
                    .map(|sub| WebhookAction::Retrieve {
                        subscription_id: sub.id().to_string(),
                    })
                    .unwrap_or_else(|| WebhookAction::Ignore {
                        event_type: event_type.to_string(),
                    })),
                _ => Err(BillingError::WebhookEventNotSupported(
                    "Expected Invoice".to_string(),
                )),
            }
        }

        other => Ok(WebhookAction::Ignore {
            event_type: other.to_string(),
        }),
    }
}

fn extract_subscription(object: EventObject) -> BillingResult<Subscription> {
    match object {
        EventObject::Subscription(subscription) => Ok(subscription),
        _ => Err(BillingError::WebhookEventNotSupported(
            "Expected Subscription".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ProviderStatus;
    use crate::reconciler::tests::{reconciler_with, snapshot, FakeProvider};
    use crate::store::{InMemoryLedgerStore, LedgerStore};
    use numera_shared::SubscriptionTier;

    const SECRET: &str = "whsec_test_secret";

    fn handler(store: &InMemoryLedgerStore, provider: Arc<FakeProvider>) -> WebhookHandler {
        WebhookHandler::new(SECRET, provider.clone(), reconciler_with(store, provider))
    }

    #[test]
    fn test_valid_signature_accepted() {
        let payload = r#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let sig = sign(payload, now, SECRET).unwrap();
        let header = format!("t={},v1={}", now, sig);

        assert!(verify_signature(payload, &header, SECRET, now + 10).is_ok());
    }

    #[test]
    fn test_any_v1_entry_may_match() {
        let payload = "{}";
        let now = 1_700_000_000;
        let sig = sign(payload, now, SECRET).unwrap();
        let header = format!("t={},v1=deadbeef,v0=ignored,v1={}", now, sig);

        assert!(verify_signature(payload, &header, SECRET, now).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let now = 1_700_000_000;
        let sig = sign(r#"{"amount":1}"#, now, SECRET).unwrap();
        let header = format!("t={},v1={}", now, sig);

        assert!(matches!(
            verify_signature(r#"{"amount":2}"#, &header, SECRET, now),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = "{}";
        let then = 1_700_000_000;
        let sig = sign(payload, then, SECRET).unwrap();
        let header = format!("t={},v1={}", then, sig);

        assert!(verify_signature(payload, &header, SECRET, then + SIGNATURE_TOLERANCE_SECS).is_ok());
        assert!(
            verify_signature(payload, &header, SECRET, then + SIGNATURE_TOLERANCE_SECS + 1)
                .is_err()
        );
    }

    #[test]
    fn test_fallback_checks_every_v1_entry_then_parses_strictly() {
        let handler = handler(&InMemoryLedgerStore::new(), Arc::new(FakeProvider::default()));
        let payload = r#"{"id":"evt_1","type":"customer.subscription.updated"}"#;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let sig = sign(payload, now, SECRET).unwrap();

        // signature passes on the first entry, the incomplete event does not parse
        let header = format!("t={},v1={},v1=deadbeef", now, sig);
        assert!(matches!(
            handler.verify_event(payload, &header),
            Err(BillingError::WebhookEventNotSupported(_))
        ));

        let forged = format!("t={},v1=deadbeef", now);
        assert!(matches!(
            handler.verify_event(payload, &forged),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_malformed_header_rejected() {
        for header in ["", "garbage", "t=abc,v1=00", "t=1700000000"] {
            assert!(
                verify_signature("{}", header, SECRET, 1_700_000_000).is_err(),
                "header {:?} should be rejected",
                header
            );
        }
    }

    #[tokio::test]
    async fn test_retrieve_action_reconciles_fetched_subscription() {
        let store = InMemoryLedgerStore::new();
        let provider = Arc::new(FakeProvider::default());
        provider
            .subscriptions
            .lock()
            .await
            .push(snapshot(Some("u1"), ProviderStatus::Active, "price_unlimited_m"));

        let outcome = handler(&store, provider)
            .apply(WebhookAction::Retrieve {
                subscription_id: "sub_abc".to_string(),
            })
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            WebhookOutcome::Reconciled {
                outcome: ReconcileOutcome::Activated {
                    tier: SubscriptionTier::Unlimited,
                    ..
                }
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_user_is_acknowledged_not_retried() {
        let store = InMemoryLedgerStore::new();
        let outcome = handler(&store, Arc::new(FakeProvider::default()))
            .apply(WebhookAction::Reconcile(snapshot(
                None,
                ProviderStatus::Active,
                "price_premium_m",
            )))
            .await
            .unwrap();

        assert!(matches!(outcome, WebhookOutcome::Undeliverable { .. }));
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_retryable_error() {
        let store = InMemoryLedgerStore::new();
        store.fail_writes_for("u1").await;

        let err = handler(&store, Arc::new(FakeProvider::default()))
            .apply(WebhookAction::Reconcile(snapshot(
                Some("u1"),
                ProviderStatus::Active,
                "price_premium_m",
            )))
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        store.clear_failures().await;
        assert!(store.active_subscription("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_subscription_id_is_not_found() {
        let store = InMemoryLedgerStore::new();
        let result = handler(&store, Arc::new(FakeProvider::default()))
            .apply(WebhookAction::Retrieve {
                subscription_id: "sub_missing".to_string(),
            })
            .await;
        assert!(matches!(result, Err(BillingError::NotFound(_))));
    }
}
