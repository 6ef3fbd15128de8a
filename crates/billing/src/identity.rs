//! Tenant identity resolution
//!
//! Maps the billing provider's external customer id to an internal
//! organization id and back.

use std::collections::HashMap;

use async_trait::async_trait;
use quotaflow_shared::OrgId;
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::error::{BillingError, BillingResult};

#[async_trait]
pub trait IdentityAdapter: Send + Sync {
    /// External customer id for an organization
    async fn get_external_id(&self, org_id: OrgId) -> BillingResult<String>;

    /// Organization for an external customer id
    async fn get_org_id_by_external_id(&self, external_id: &str) -> BillingResult<OrgId>;
}

/// Identity mapping stored in `billing_customers`
#[derive(Clone)]
pub struct PgIdentityAdapter {
    pool: PgPool,
}

impl PgIdentityAdapter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Link an organization to its external customer id
    pub async fn link_customer(&self, org_id: OrgId, external_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_customers (org_id, external_customer_id)
            VALUES ($1, $2)
            ON CONFLICT (org_id) DO UPDATE SET external_customer_id = EXCLUDED.external_customer_id
            "#,
        )
        .bind(org_id)
        .bind(external_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            org_id = %org_id,
            external_customer_id = %external_id,
            "Linked organization to billing customer"
        );

        Ok(())
    }
}

#[async_trait]
impl IdentityAdapter for PgIdentityAdapter {
    async fn get_external_id(&self, org_id: OrgId) -> BillingResult<String> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT external_customer_id FROM billing_customers WHERE org_id = $1")
                .bind(org_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(id,)| id)
            .ok_or(BillingError::ExternalIdNotMapped(org_id))
    }

    async fn get_org_id_by_external_id(&self, external_id: &str) -> BillingResult<OrgId> {
        let row: Option<(OrgId,)> =
            sqlx::query_as("SELECT org_id FROM billing_customers WHERE external_customer_id = $1")
                .bind(external_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|(org_id,)| org_id)
            .ok_or_else(|| BillingError::OrganizationNotMapped(external_id.to_string()))
    }
}

/// In-process identity map for tests and local runs
#[derive(Default)]
pub struct InMemoryIdentityAdapter {
    by_org: RwLock<HashMap<OrgId, String>>,
}

impl InMemoryIdentityAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn link_customer(&self, org_id: OrgId, external_id: impl Into<String>) {
        self.by_org.write().await.insert(org_id, external_id.into());
    }
}

#[async_trait]
impl IdentityAdapter for InMemoryIdentityAdapter {
    async fn get_external_id(&self, org_id: OrgId) -> BillingResult<String> {
        self.by_org
            .read()
            .await
            .get(&org_id)
            .cloned()
            .ok_or(BillingError::ExternalIdNotMapped(org_id))
    }

    async fn get_org_id_by_external_id(&self, external_id: &str) -> BillingResult<OrgId> {
        self.by_org
            .read()
            .await
            .iter()
            .find(|(_, ext)| ext.as_str() == external_id)
            .map(|(org_id, _)| *org_id)
            .ok_or_else(|| BillingError::OrganizationNotMapped(external_id.to_string()))
    }
}
