//! Billing state persistence
//!
//! Every write that can race with quota consumption is a single atomic
//! operation at the storage layer. Callers never read-modify-write a
//! `QuotaTracking` row themselves.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use quotaflow_shared::OrgId;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::models::{EntitlementGrant, QuotaStatus, QuotaTracking, Subscription};

pub use memory::InMemoryStateRepository;
pub use postgres::PgStateRepository;

#[async_trait]
pub trait StateRepository: Send + Sync {
    async fn get_subscription_by_org_id(&self, org_id: OrgId)
        -> BillingResult<Option<Subscription>>;

    /// Insert or overwrite the organization's subscription snapshot
    async fn upsert_subscription(&self, subscription: &Subscription) -> BillingResult<()>;

    /// Returns true if a row was removed
    async fn delete_subscription(&self, org_id: OrgId) -> BillingResult<bool>;

    async fn get_quota_by_org_id(&self, org_id: OrgId) -> BillingResult<Option<QuotaTracking>>;

    /// Insert or overwrite the whole quota row
    async fn upsert_quota(&self, quota: &QuotaTracking) -> BillingResult<()>;

    /// Reconcile the remaining count against a new entitlement
    ///
    /// See [`EntitlementGrant::apply_to`] for the rule.
    async fn apply_entitlement(
        &self,
        org_id: OrgId,
        grant: &EntitlementGrant,
        now: OffsetDateTime,
    ) -> BillingResult<QuotaTracking>;

    /// Overwrite only the remaining count and `last_synced_at`
    ///
    /// Negative counts are stored as zero. A minimal row is created if none
    /// exists.
    async fn set_invoice_count(
        &self,
        org_id: OrgId,
        invoice_count: i32,
        now: OffsetDateTime,
    ) -> BillingResult<QuotaTracking>;

    /// Decrement the remaining count by one if it is positive and the
    /// organization's subscription grants access
    ///
    /// Returns the new count, or `None` when nothing was consumed: no quota
    /// row, a count already at zero, or no subscription in an access-granting
    /// status.
    async fn decrement_invoice_count(
        &self,
        org_id: OrgId,
        now: OffsetDateTime,
    ) -> BillingResult<Option<i32>>;

    /// Joined read of subscription status and remaining quota
    ///
    /// `None` when the organization has neither row.
    async fn get_quota_status(&self, org_id: OrgId) -> BillingResult<Option<QuotaStatus>>;
}
