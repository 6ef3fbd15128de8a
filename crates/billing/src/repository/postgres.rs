//! PostgreSQL state repository

use async_trait::async_trait;
use quotaflow_shared::OrgId;
use sqlx::types::Json;
use sqlx::PgPool;
use time::OffsetDateTime;

use super::StateRepository;
use crate::error::BillingResult;
use crate::models::{
    EntitlementGrant, Metadata, QuotaStatus, QuotaTracking, Subscription, SubscriptionStatus,
};

/// Subscription statuses under which quota may be consumed
const ACCESS_STATUSES: [SubscriptionStatus; 2] =
    [SubscriptionStatus::Active, SubscriptionStatus::Trialing];

const QUOTA_COLUMNS: &str = "org_id, invoice_count, invoice_entitlement, max_seats, \
     period_start, period_end, last_synced_at, last_consumed_at";

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    org_id: OrgId,
    external_customer_id: String,
    external_subscription_id: String,
    status: String,
    product_id: String,
    product_name: String,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    canceled_at: Option<OffsetDateTime>,
    metadata: Json<Metadata>,
    updated_at: OffsetDateTime,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        Self {
            org_id: row.org_id,
            external_customer_id: row.external_customer_id,
            external_subscription_id: row.external_subscription_id,
            status: SubscriptionStatus::parse(&row.status),
            product_id: row.product_id,
            product_name: row.product_name,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            canceled_at: row.canceled_at,
            metadata: row.metadata.0,
            updated_at: row.updated_at,
        }
    }
}

/// State repository backed by the `subscriptions` and `quota_tracking` tables
#[derive(Clone)]
pub struct PgStateRepository {
    pool: PgPool,
}

impl PgStateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateRepository for PgStateRepository {
    async fn get_subscription_by_org_id(
        &self,
        org_id: OrgId,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT org_id, external_customer_id, external_subscription_id, status,
                   product_id, product_name, current_period_start, current_period_end,
                   cancel_at_period_end, canceled_at, metadata, updated_at
            FROM subscriptions
            WHERE org_id = $1
            "#,
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Subscription::from))
    }

    async fn upsert_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                org_id, external_customer_id, external_subscription_id, status,
                product_id, product_name, current_period_start, current_period_end,
                cancel_at_period_end, canceled_at, metadata, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (org_id) DO UPDATE SET
                external_customer_id = EXCLUDED.external_customer_id,
                external_subscription_id = EXCLUDED.external_subscription_id,
                status = EXCLUDED.status,
                product_id = EXCLUDED.product_id,
                product_name = EXCLUDED.product_name,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                canceled_at = EXCLUDED.canceled_at,
                metadata = EXCLUDED.metadata,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(subscription.org_id)
        .bind(&subscription.external_customer_id)
        .bind(&subscription.external_subscription_id)
        .bind(subscription.status.as_str())
        .bind(&subscription.product_id)
        .bind(&subscription.product_name)
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.canceled_at)
        .bind(Json(&subscription.metadata))
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_subscription(&self, org_id: OrgId) -> BillingResult<bool> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE org_id = $1")
            .bind(org_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_quota_by_org_id(&self, org_id: OrgId) -> BillingResult<Option<QuotaTracking>> {
        let row = sqlx::query_as::<_, QuotaTracking>(&format!(
            "SELECT {} FROM quota_tracking WHERE org_id = $1",
            QUOTA_COLUMNS
        ))
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn upsert_quota(&self, quota: &QuotaTracking) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO quota_tracking (
                org_id, invoice_count, invoice_entitlement, max_seats,
                period_start, period_end, last_synced_at, last_consumed_at
            )
            VALUES ($1, GREATEST($2, 0), $3, $4, $5, $6, $7, $8)
            ON CONFLICT (org_id) DO UPDATE SET
                invoice_count = EXCLUDED.invoice_count,
                invoice_entitlement = EXCLUDED.invoice_entitlement,
                max_seats = EXCLUDED.max_seats,
                period_start = EXCLUDED.period_start,
                period_end = EXCLUDED.period_end,
                last_synced_at = EXCLUDED.last_synced_at,
                last_consumed_at = EXCLUDED.last_consumed_at
            "#,
        )
        .bind(quota.org_id)
        .bind(quota.invoice_count)
        .bind(quota.invoice_entitlement)
        .bind(quota.max_seats)
        .bind(quota.period_start)
        .bind(quota.period_end)
        .bind(quota.last_synced_at)
        .bind(quota.last_consumed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn apply_entitlement(
        &self,
        org_id: OrgId,
        grant: &EntitlementGrant,
        now: OffsetDateTime,
    ) -> BillingResult<QuotaTracking> {
        // Right-hand references to quota_tracking.* see the pre-update row
        let row = sqlx::query_as::<_, QuotaTracking>(&format!(
            r#"
            INSERT INTO quota_tracking (
                org_id, invoice_count, invoice_entitlement, max_seats,
                period_start, period_end, last_synced_at
            )
            VALUES ($1, GREATEST($2, 0), $2, COALESCE($3, 0), $4, $5, $6)
            ON CONFLICT (org_id) DO UPDATE SET
                invoice_count = CASE
                    WHEN quota_tracking.invoice_entitlement IS NULL
                         OR (EXCLUDED.period_start IS NOT NULL
                             AND (quota_tracking.period_start IS NULL
                                  OR EXCLUDED.period_start > quota_tracking.period_start))
                    THEN EXCLUDED.invoice_count
                    ELSE LEAST(2147483647, GREATEST(0,
                        quota_tracking.invoice_count::BIGINT
                        + ($2::BIGINT - quota_tracking.invoice_entitlement::BIGINT)))::INTEGER
                END,
                invoice_entitlement = EXCLUDED.invoice_entitlement,
                max_seats = COALESCE($3, quota_tracking.max_seats),
                period_start = COALESCE(EXCLUDED.period_start, quota_tracking.period_start),
                period_end = COALESCE(EXCLUDED.period_end, quota_tracking.period_end),
                last_synced_at = EXCLUDED.last_synced_at
            RETURNING {}
            "#,
            QUOTA_COLUMNS
        ))
        .bind(org_id)
        .bind(grant.invoice_count)
        .bind(grant.max_seats)
        .bind(grant.period_start)
        .bind(grant.period_end)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn set_invoice_count(
        &self,
        org_id: OrgId,
        invoice_count: i32,
        now: OffsetDateTime,
    ) -> BillingResult<QuotaTracking> {
        let row = sqlx::query_as::<_, QuotaTracking>(&format!(
            r#"
            INSERT INTO quota_tracking (org_id, invoice_count, last_synced_at)
            VALUES ($1, GREATEST($2, 0), $3)
            ON CONFLICT (org_id) DO UPDATE SET
                invoice_count = EXCLUDED.invoice_count,
                last_synced_at = EXCLUDED.last_synced_at
            RETURNING {}
            "#,
            QUOTA_COLUMNS
        ))
        .bind(org_id)
        .bind(invoice_count)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn decrement_invoice_count(
        &self,
        org_id: OrgId,
        now: OffsetDateTime,
    ) -> BillingResult<Option<i32>> {
        let row: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE quota_tracking q
            SET invoice_count = q.invoice_count - 1,
                last_consumed_at = $2
            FROM subscriptions s
            WHERE q.org_id = $1
              AND s.org_id = q.org_id
              AND s.status = ANY($3)
              AND q.invoice_count > 0
            RETURNING q.invoice_count
            "#,
        )
        .bind(org_id)
        .bind(now)
        .bind(ACCESS_STATUSES.map(|s| s.as_str()).to_vec())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(count,)| count))
    }

    async fn get_quota_status(&self, org_id: OrgId) -> BillingResult<Option<QuotaStatus>> {
        let row: Option<(Option<String>, Option<i32>, Option<OffsetDateTime>)> = sqlx::query_as(
            r#"
            SELECT s.status, q.invoice_count, q.last_synced_at
            FROM (SELECT $1::INTEGER AS org_id) k
            LEFT JOIN subscriptions s ON s.org_id = k.org_id
            LEFT JOIN quota_tracking q ON q.org_id = k.org_id
            WHERE s.org_id IS NOT NULL OR q.org_id IS NOT NULL
            "#,
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(status, invoice_count, last_synced_at)| {
            QuotaStatus::new(
                org_id,
                status.as_deref().map(SubscriptionStatus::parse),
                invoice_count.unwrap_or(0),
                last_synced_at,
            )
        }))
    }
}
