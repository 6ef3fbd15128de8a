//! In-memory state repository
//!
//! One mutex guards both tables so every operation is atomic, matching the
//! single-statement guarantees of the Postgres implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use quotaflow_shared::OrgId;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::StateRepository;
use crate::error::BillingResult;
use crate::models::{EntitlementGrant, QuotaStatus, QuotaTracking, Subscription};

#[derive(Default)]
struct Tables {
    subscriptions: HashMap<OrgId, Subscription>,
    quotas: HashMap<OrgId, QuotaTracking>,
}

#[derive(Default)]
pub struct InMemoryStateRepository {
    tables: Mutex<Tables>,
}

impl InMemoryStateRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateRepository for InMemoryStateRepository {
    async fn get_subscription_by_org_id(
        &self,
        org_id: OrgId,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self.tables.lock().await.subscriptions.get(&org_id).cloned())
    }

    async fn upsert_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        self.tables
            .lock()
            .await
            .subscriptions
            .insert(subscription.org_id, subscription.clone());
        Ok(())
    }

    async fn delete_subscription(&self, org_id: OrgId) -> BillingResult<bool> {
        Ok(self.tables.lock().await.subscriptions.remove(&org_id).is_some())
    }

    async fn get_quota_by_org_id(&self, org_id: OrgId) -> BillingResult<Option<QuotaTracking>> {
        Ok(self.tables.lock().await.quotas.get(&org_id).cloned())
    }

    async fn upsert_quota(&self, quota: &QuotaTracking) -> BillingResult<()> {
        let mut row = quota.clone();
        row.invoice_count = row.invoice_count.max(0);
        self.tables.lock().await.quotas.insert(row.org_id, row);
        Ok(())
    }

    async fn apply_entitlement(
        &self,
        org_id: OrgId,
        grant: &EntitlementGrant,
        now: OffsetDateTime,
    ) -> BillingResult<QuotaTracking> {
        let mut tables = self.tables.lock().await;
        let row = grant.apply_to(org_id, tables.quotas.get(&org_id), now);
        tables.quotas.insert(org_id, row.clone());
        Ok(row)
    }

    async fn set_invoice_count(
        &self,
        org_id: OrgId,
        invoice_count: i32,
        now: OffsetDateTime,
    ) -> BillingResult<QuotaTracking> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .quotas
            .entry(org_id)
            .or_insert_with(|| QuotaTracking::empty(org_id, now));
        row.invoice_count = invoice_count.max(0);
        row.last_synced_at = now;
        Ok(row.clone())
    }

    async fn decrement_invoice_count(
        &self,
        org_id: OrgId,
        now: OffsetDateTime,
    ) -> BillingResult<Option<i32>> {
        let mut tables = self.tables.lock().await;
        let grants_access = tables
            .subscriptions
            .get(&org_id)
            .is_some_and(|s| s.status.grants_access());
        if !grants_access {
            return Ok(None);
        }
        match tables.quotas.get_mut(&org_id) {
            Some(row) if row.invoice_count > 0 => {
                row.invoice_count -= 1;
                row.last_consumed_at = Some(now);
                Ok(Some(row.invoice_count))
            }
            _ => Ok(None),
        }
    }

    async fn get_quota_status(&self, org_id: OrgId) -> BillingResult<Option<QuotaStatus>> {
        let tables = self.tables.lock().await;
        let subscription = tables.subscriptions.get(&org_id);
        let quota = tables.quotas.get(&org_id);
        if subscription.is_none() && quota.is_none() {
            return Ok(None);
        }
        Ok(Some(QuotaStatus::from_parts(org_id, subscription, quota)))
    }
}
