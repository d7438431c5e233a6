//! Postgres-backed ledger store

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use numera_shared::Feature;

use super::{LedgerStore, NewProfile, NewSubscription, SubscriptionRecord, UserProfile};
use crate::error::{BillingError, BillingResult};

/// Row type for subscriptions; enum columns are stored as text
#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: String,
    tier: String,
    status: String,
    billing_cycle: String,
    starts_at: Option<OffsetDateTime>,
    ends_at: Option<OffsetDateTime>,
    external_subscription_id: Option<String>,
    external_customer_id: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for SubscriptionRecord {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(SubscriptionRecord {
            id: row.id,
            user_id: row.user_id,
            tier: row.tier.parse()?,
            status: row.status.parse()?,
            billing_cycle: row.billing_cycle.parse()?,
            starts_at: row.starts_at,
            ends_at: row.ends_at,
            external_subscription_id: row.external_subscription_id,
            external_customer_id: row.external_customer_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProfileRow {
    id: Uuid,
    user_id: String,
    email: String,
    display_name: Option<String>,
    wants_premium: bool,
    terms_agreed: bool,
    onboarding_done: bool,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<ProfileRow> for UserProfile {
    fn from(row: ProfileRow) -> Self {
        UserProfile {
            id: row.id,
            user_id: row.user_id,
            email: row.email,
            display_name: row.display_name,
            wants_premium: row.wants_premium,
            terms_agreed: row.terms_agreed,
            onboarding_done: row.onboarding_done,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleActiveRow {
    user_id: String,
    sub_count: i64,
}

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, tier, status, billing_cycle, starts_at, ends_at, \
     external_subscription_id, external_customer_id, created_at, updated_at";

const PROFILE_COLUMNS: &str = "id, user_id, email, display_name, wants_premium, terms_agreed, \
     onboarding_done, created_at, updated_at";

fn into_records(rows: Vec<SubscriptionRow>) -> BillingResult<Vec<SubscriptionRecord>> {
    rows.into_iter().map(SubscriptionRecord::try_from).collect()
}

/// Ledger store over a Postgres pool. Every query is bounded by `timeout`.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgLedgerStore {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> BillingResult<T>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|e| {
                tracing::error!(operation, error = %e, "Ledger query failed");
                BillingError::from(e)
            }),
            Err(_) => {
                tracing::error!(
                    operation,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Ledger query timed out"
                );
                Err(BillingError::Timeout(operation.to_string()))
            }
        }
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn get_profile(&self, user_id: &str) -> BillingResult<Option<UserProfile>> {
        let sql = format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE user_id = $1");
        let row: Option<ProfileRow> = self
            .bounded(
                "get_profile",
                sqlx::query_as::<_, ProfileRow>(&sql).bind(user_id).fetch_optional(&self.pool),
            )
            .await?;
        Ok(row.map(UserProfile::from))
    }

    async fn create_profile(&self, profile: NewProfile) -> BillingResult<UserProfile> {
        // The no-op update makes RETURNING yield the existing row on conflict
        let sql = format!(
            r#"
            INSERT INTO profiles (user_id, email, display_name)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE SET user_id = EXCLUDED.user_id
            RETURNING {PROFILE_COLUMNS}
            "#
        );
        let row: ProfileRow = self
            .bounded(
                "create_profile",
                sqlx::query_as::<_, ProfileRow>(&sql)
                    .bind(&profile.user_id)
                    .bind(&profile.email)
                    .bind(&profile.display_name)
                    .fetch_one(&self.pool),
            )
            .await?;
        Ok(row.into())
    }

    async fn set_wants_premium(&self, user_id: &str, wants_premium: bool) -> BillingResult<bool> {
        let result = self
            .bounded(
                "set_wants_premium",
                sqlx::query(
                    r#"
                    UPDATE profiles
                    SET wants_premium = $2, updated_at = NOW()
                    WHERE user_id = $1
                    "#,
                )
                .bind(user_id)
                .bind(wants_premium)
                .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn active_subscription(
        &self,
        user_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let sql = format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE user_id = $1 AND status = 'active'
            ORDER BY created_at DESC
            LIMIT 1
            "#
        );
        let row: Option<SubscriptionRow> = self
            .bounded(
                "active_subscription",
                sqlx::query_as::<_, SubscriptionRow>(&sql).bind(user_id).fetch_optional(&self.pool),
            )
            .await?;
        row.map(SubscriptionRecord::try_from).transpose()
    }

    async fn active_subscriptions(&self, user_id: &str) -> BillingResult<Vec<SubscriptionRecord>> {
        let sql = format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE user_id = $1 AND status = 'active'
            ORDER BY created_at DESC
            "#
        );
        let rows: Vec<SubscriptionRow> = self
            .bounded(
                "active_subscriptions",
                sqlx::query_as::<_, SubscriptionRow>(&sql).bind(user_id).fetch_all(&self.pool),
            )
            .await?;
        into_records(rows)
    }

    async fn cancel_active_subscriptions(&self, user_id: &str) -> BillingResult<u64> {
        let result = self
            .bounded(
                "cancel_active_subscriptions",
                sqlx::query(
                    r#"
                    UPDATE subscriptions
                    SET status = 'canceled', updated_at = NOW()
                    WHERE user_id = $1 AND status = 'active'
                    "#,
                )
                .bind(user_id)
                .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected())
    }

    async fn cancel_expired_subscriptions(
        &self,
        user_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<u64> {
        let result = self
            .bounded(
                "cancel_expired_subscriptions",
                sqlx::query(
                    r#"
                    UPDATE subscriptions
                    SET status = 'canceled', updated_at = NOW()
                    WHERE user_id = $1 AND status = 'active' AND ends_at < $2
                    "#,
                )
                .bind(user_id)
                .bind(now)
                .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_subscription(&self, sub: NewSubscription) -> BillingResult<SubscriptionRecord> {
        let sql = format!(
            r#"
            INSERT INTO subscriptions (
                user_id, tier, status, billing_cycle, starts_at, ends_at,
                external_subscription_id, external_customer_id
            )
            VALUES ($1, $2, 'active', $3, $4, $5, $6, $7)
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        );
        let row: SubscriptionRow = self
            .bounded(
                "insert_subscription",
                sqlx::query_as::<_, SubscriptionRow>(&sql)
                    .bind(&sub.user_id)
                    .bind(sub.tier.as_str())
                    .bind(sub.billing_cycle.as_str())
                    .bind(sub.starts_at)
                    .bind(sub.ends_at)
                    .bind(&sub.external_subscription_id)
                    .bind(&sub.external_customer_id)
                    .fetch_one(&self.pool),
            )
            .await?;
        row.try_into()
    }

    async fn expired_active_subscriptions(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let sql = format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE status = 'active' AND ends_at < $1 AND tier <> 'free'
            ORDER BY ends_at ASC
            "#
        );
        let rows: Vec<SubscriptionRow> = self
            .bounded(
                "expired_active_subscriptions",
                sqlx::query_as::<_, SubscriptionRow>(&sql).bind(now).fetch_all(&self.pool),
            )
            .await?;
        into_records(rows)
    }

    async fn subscriptions_expiring_between(
        &self,
        from: OffsetDateTime,
        until: OffsetDateTime,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let sql = format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE status = 'active' AND ends_at > $1 AND ends_at < $2 AND tier <> 'free'
            ORDER BY ends_at ASC
            "#
        );
        let rows: Vec<SubscriptionRow> = self
            .bounded(
                "subscriptions_expiring_between",
                sqlx::query_as::<_, SubscriptionRow>(&sql)
                    .bind(from)
                    .bind(until)
                    .fetch_all(&self.pool),
            )
            .await?;
        into_records(rows)
    }

    async fn users_with_multiple_active(&self) -> BillingResult<Vec<(String, u64)>> {
        let rows: Vec<MultipleActiveRow> = self
            .bounded(
                "users_with_multiple_active",
                sqlx::query_as::<_, MultipleActiveRow>(
                    r#"
                    SELECT user_id, COUNT(*) AS sub_count
                    FROM subscriptions
                    WHERE status = 'active'
                    GROUP BY user_id
                    HAVING COUNT(*) > 1
                    ORDER BY user_id
                    "#,
                )
                .fetch_all(&self.pool),
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.user_id, row.sub_count.max(0) as u64))
            .collect())
    }

    async fn count_usage(
        &self,
        user_id: &str,
        feature: Feature,
        since: OffsetDateTime,
    ) -> BillingResult<u64> {
        // Table names come from a closed enum, never from input
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE user_id = $1 AND created_at >= $2",
            feature.table_name()
        );
        let count: i64 = self
            .bounded(
                "count_usage",
                sqlx::query_scalar::<_, i64>(&sql)
                    .bind(user_id)
                    .bind(since)
                    .fetch_one(&self.pool),
            )
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn record_usage(
        &self,
        user_id: &str,
        feature: Feature,
        payload: serde_json::Value,
        at: OffsetDateTime,
    ) -> BillingResult<()> {
        let sql = format!(
            "INSERT INTO {} (user_id, payload, created_at) VALUES ($1, $2, $3)",
            feature.table_name()
        );
        self.bounded(
            "record_usage",
            sqlx::query(&sql)
                .bind(user_id)
                .bind(payload)
                .bind(at)
                .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn delete_usage_since(
        &self,
        user_id: &str,
        feature: Feature,
        since: OffsetDateTime,
    ) -> BillingResult<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE user_id = $1 AND created_at >= $2",
            feature.table_name()
        );
        let result = self
            .bounded(
                "delete_usage_since",
                sqlx::query(&sql)
                    .bind(user_id)
                    .bind(since)
                    .execute(&self.pool),
            )
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_user(&self, user_id: &str) -> BillingResult<()> {
        let pool = &self.pool;
        self.bounded("delete_user", async move {
            let mut tx = pool.begin().await?;

            for feature in Feature::ALL {
                let sql = format!("DELETE FROM {} WHERE user_id = $1", feature.table_name());
                sqlx::query(&sql).bind(user_id).execute(&mut *tx).await?;
            }
            sqlx::query("DELETE FROM subscriptions WHERE user_id = $1")
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM profiles WHERE user_id = $1")
                .bind(user_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await
        })
        .await?;

        tracing::info!(user_id = %user_id, "Deleted all ledger data for user");
        Ok(())
    }
}
