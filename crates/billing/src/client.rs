//! Stripe client and the provider-neutral view of a subscription.
//!
//! The reconciler never sees `stripe::` types. Webhook payloads and API
//! responses are converted into [`BillingSubscription`] at this boundary.

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use stripe::{
    Client, CustomerId, ListSubscriptions, RecurringInterval, Subscription, SubscriptionId,
    SubscriptionStatus as StripeSubStatus, SubscriptionStatusFilter, UpdateSubscription,
    UpdateSubscriptionItems,
};
use time::OffsetDateTime;

use numera_shared::{env_parse_or, required_env, BillingCycle, ConfigError};

use crate::error::{BillingError, BillingResult};

/// Subscription status as reported by the billing provider.
///
/// Unknown statuses are kept verbatim so new provider states pass through as
/// no-ops instead of failing deserialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Unpaid,
    Paused,
    Other(String),
}

impl ProviderStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ProviderStatus::Active => "active",
            ProviderStatus::Trialing => "trialing",
            ProviderStatus::PastDue => "past_due",
            ProviderStatus::Canceled => "canceled",
            ProviderStatus::Incomplete => "incomplete",
            ProviderStatus::IncompleteExpired => "incomplete_expired",
            ProviderStatus::Unpaid => "unpaid",
            ProviderStatus::Paused => "paused",
            ProviderStatus::Other(s) => s,
        }
    }

    /// Statuses that grant the paid tier
    pub fn is_entitled(&self) -> bool {
        matches!(self, ProviderStatus::Active | ProviderStatus::Trialing)
    }

    /// Statuses that end the relationship immediately. `past_due` has no
    /// grace period.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProviderStatus::Canceled | ProviderStatus::IncompleteExpired | ProviderStatus::PastDue
        )
    }
}

impl FromStr for ProviderStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "active" => ProviderStatus::Active,
            "trialing" => ProviderStatus::Trialing,
            "past_due" => ProviderStatus::PastDue,
            "canceled" => ProviderStatus::Canceled,
            "incomplete" => ProviderStatus::Incomplete,
            "incomplete_expired" => ProviderStatus::IncompleteExpired,
            "unpaid" => ProviderStatus::Unpaid,
            "paused" => ProviderStatus::Paused,
            other => ProviderStatus::Other(other.to_string()),
        })
    }
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&StripeSubStatus> for ProviderStatus {
    fn from(status: &StripeSubStatus) -> Self {
        match status {
            StripeSubStatus::Active => ProviderStatus::Active,
            StripeSubStatus::PastDue => ProviderStatus::PastDue,
            StripeSubStatus::Canceled => ProviderStatus::Canceled,
            StripeSubStatus::Unpaid => ProviderStatus::Unpaid,
            StripeSubStatus::Trialing => ProviderStatus::Trialing,
            StripeSubStatus::Incomplete => ProviderStatus::Incomplete,
            StripeSubStatus::IncompleteExpired => ProviderStatus::IncompleteExpired,
            StripeSubStatus::Paused => ProviderStatus::Paused,
        }
    }
}

/// One priced line of a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingItem {
    pub price_id: String,
    /// Recurring interval from the price, when the provider sent one
    pub interval: Option<BillingCycle>,
}

/// Provider-neutral subscription snapshot consumed by the reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingSubscription {
    pub id: String,
    pub customer_id: Option<String>,
    pub status: ProviderStatus,
    pub items: Vec<BillingItem>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    /// Scheduled to end when the current period runs out
    pub cancel_at_period_end: bool,
    pub metadata: HashMap<String, String>,
}

impl BillingSubscription {
    /// The first item carries the plan price
    pub fn primary_item(&self) -> Option<&BillingItem> {
        self.items.first()
    }

    pub fn user_id(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(String::as_str)
            .filter(|id| !id.trim().is_empty())
    }
}

fn timestamp(ts: i64) -> Option<OffsetDateTime> {
    if ts <= 0 {
        return None;
    }
    OffsetDateTime::from_unix_timestamp(ts).ok()
}

impl From<&Subscription> for BillingSubscription {
    fn from(sub: &Subscription) -> Self {
        let items = sub
            .items
            .data
            .iter()
            .filter_map(|item| item.price.as_ref())
            .map(|price| BillingItem {
                price_id: price.id.to_string(),
                interval: price.recurring.as_ref().map(|r| match r.interval {
                    RecurringInterval::Year => BillingCycle::Yearly,
                    _ => BillingCycle::Monthly,
                }),
            })
            .collect();

        BillingSubscription {
            id: sub.id.to_string(),
            customer_id: Some(sub.customer.id().to_string()),
            status: ProviderStatus::from(&sub.status),
            items,
            current_period_start: timestamp(sub.current_period_start),
            current_period_end: timestamp(sub.current_period_end),
            cancel_at_period_end: sub.cancel_at_period_end,
            metadata: sub.metadata.clone(),
        }
    }
}

/// Outbound billing-provider operations used by the reconciler
#[async_trait]
pub trait BillingProvider: Send + Sync {
    async fn retrieve_subscription(&self, subscription_id: &str)
        -> BillingResult<BillingSubscription>;

    async fn list_customer_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<BillingSubscription>>;

    /// Attach the user correlation key to the subscription's metadata
    async fn set_subscription_user(
        &self,
        subscription_id: &str,
        key: &str,
        user_id: &str,
    ) -> BillingResult<()>;

    /// Move the plan item to `price_id`, prorating the remainder of the period
    async fn change_subscription_price(
        &self,
        subscription_id: &str,
        price_id: &str,
    ) -> BillingResult<BillingSubscription>;

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<BillingSubscription>;
}

/// Stripe credentials
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub request_timeout: Duration,
}

impl StripeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut missing = Vec::new();
        let secret_key = required_env("STRIPE_SECRET_KEY").map_err(|e| missing.push(e));
        let webhook_secret = required_env("STRIPE_WEBHOOK_SECRET").map_err(|e| missing.push(e));

        match (secret_key, webhook_secret) {
            (Ok(secret_key), Ok(webhook_secret)) => Ok(Self {
                secret_key,
                webhook_secret,
                request_timeout: Duration::from_secs(env_parse_or(
                    "STRIPE_REQUEST_TIMEOUT_SECS",
                    10u64,
                )?),
            }),
            _ => Err(ConfigError::Missing(
                missing
                    .into_iter()
                    .flat_map(|e| match e {
                        ConfigError::Missing(keys) => keys,
                        other => vec![other.to_string()],
                    })
                    .collect(),
            )),
        }
    }
}

/// Stripe API client
#[derive(Clone)]
pub struct StripeClient {
    inner: Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            inner: Client::new(config.secret_key.clone()),
            config,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> BillingResult<T>
    where
        F: Future<Output = Result<T, stripe::StripeError>>,
    {
        match tokio::time::timeout(self.config.request_timeout, fut).await {
            Ok(result) => result.map_err(|e| {
                tracing::error!(operation, error = %e, "Stripe request failed");
                BillingError::from(e)
            }),
            Err(_) => {
                tracing::error!(operation, "Stripe request timed out");
                Err(BillingError::Timeout(operation.to_string()))
            }
        }
    }
}

fn parse_subscription_id(id: &str) -> BillingResult<SubscriptionId> {
    id.parse()
        .map_err(|_| BillingError::InvalidInput(format!("Invalid subscription ID: {}", id)))
}

#[async_trait]
impl BillingProvider for StripeClient {
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<BillingSubscription> {
        let sub_id = parse_subscription_id(subscription_id)?;
        let subscription = self
            .bounded(
                "retrieve_subscription",
                Subscription::retrieve(&self.inner, &sub_id, &[]),
            )
            .await?;
        Ok(BillingSubscription::from(&subscription))
    }

    async fn list_customer_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<BillingSubscription>> {
        let customer_id = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid customer ID: {}", e)))?;

        let params = ListSubscriptions {
            customer: Some(customer_id),
            status: Some(SubscriptionStatusFilter::All),
            limit: Some(10),
            ..Default::default()
        };

        let subscriptions = self
            .bounded(
                "list_customer_subscriptions",
                Subscription::list(&self.inner, &params),
            )
            .await?;
        Ok(subscriptions
            .data
            .iter()
            .map(BillingSubscription::from)
            .collect())
    }

    async fn set_subscription_user(
        &self,
        subscription_id: &str,
        key: &str,
        user_id: &str,
    ) -> BillingResult<()> {
        let sub_id = parse_subscription_id(subscription_id)?;
        let mut params = UpdateSubscription::new();
        params.metadata = Some(HashMap::from([(key.to_string(), user_id.to_string())]));

        self.bounded(
            "set_subscription_user",
            Subscription::update(&self.inner, &sub_id, params),
        )
        .await?;

        tracing::info!(
            subscription_id = %subscription_id,
            user_id = %user_id,
            "Attached user id to subscription metadata"
        );
        Ok(())
    }

    async fn change_subscription_price(
        &self,
        subscription_id: &str,
        price_id: &str,
    ) -> BillingResult<BillingSubscription> {
        let sub_id = parse_subscription_id(subscription_id)?;
        let current = self
            .bounded(
                "retrieve_subscription",
                Subscription::retrieve(&self.inner, &sub_id, &[]),
            )
            .await?;
        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| {
                BillingError::InvalidInput(format!(
                    "Subscription {} has no plan item",
                    subscription_id
                ))
            })?;

        let mut params = UpdateSubscription::new();
        params.items = Some(vec![UpdateSubscriptionItems {
            id: Some(item_id),
            price: Some(price_id.to_string()),
            ..Default::default()
        }]);
        params.proration_behavior = Some(SubscriptionProrationBehavior::CreateProrations);

        let updated = self
            .bounded(
                "change_subscription_price",
                Subscription::update(&self.inner, &sub_id, params),
            )
            .await?;

        tracing::info!(
            subscription_id = %subscription_id,
            price_id = %price_id,
            "Changed subscription price"
        );
        Ok(BillingSubscription::from(&updated))
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_id: &str,
        cancel: bool,
    ) -> BillingResult<BillingSubscription> {
        let sub_id = parse_subscription_id(subscription_id)?;
        let mut params = UpdateSubscription::new();
        params.cancel_at_period_end = Some(cancel);

        let updated = self
            .bounded(
                "set_cancel_at_period_end",
                Subscription::update(&self.inner, &sub_id, params),
            )
            .await?;

        tracing::info!(
            subscription_id = %subscription_id,
            cancel_at_period_end = cancel,
            "Updated subscription cancellation schedule"
        );
        Ok(BillingSubscription::from(&updated))
    }
}
