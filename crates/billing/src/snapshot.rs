//! Writing provider state into the local snapshot
//!
//! Shared by the webhook handlers, checkout verification and lazy re-sync so
//! that all three paths produce identical rows for identical provider state.

use quotaflow_shared::OrgId;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::models::{EntitlementGrant, ProviderSubscription, QuotaTracking, Subscription};
use crate::normalizer::SubscriptionEventData;
use crate::repository::StateRepository;

impl SubscriptionEventData {
    /// Snapshot row for an organization
    pub fn to_subscription(&self, org_id: OrgId, now: OffsetDateTime) -> Subscription {
        Subscription {
            org_id,
            external_customer_id: self.external_customer_id.clone(),
            external_subscription_id: self.subscription_id.clone(),
            status: self.status,
            product_id: self.product_id.clone(),
            product_name: self.product_name.clone(),
            current_period_start: self.current_period_start,
            current_period_end: self.current_period_end,
            cancel_at_period_end: self.cancel_at_period_end,
            canceled_at: self.canceled_at,
            metadata: self.metadata.clone(),
            updated_at: now,
        }
    }

    /// Entitlement carried by the event, if any
    pub fn entitlement(&self) -> Option<EntitlementGrant> {
        self.invoice_quota.map(|invoice_count| EntitlementGrant {
            invoice_count,
            max_seats: self.max_seats,
            period_start: self.current_period_start,
            period_end: self.current_period_end,
        })
    }
}

impl From<ProviderSubscription> for SubscriptionEventData {
    fn from(sub: ProviderSubscription) -> Self {
        Self {
            subscription_id: sub.id,
            external_customer_id: sub.external_customer_id,
            status: sub.status,
            current_period_start: sub.current_period_start,
            current_period_end: sub.current_period_end,
            cancel_at_period_end: sub.cancel_at_period_end,
            canceled_at: sub.canceled_at,
            product_id: sub.product_id,
            product_name: sub.product_name,
            metadata: sub.metadata,
            invoice_quota: sub.invoice_quota,
            max_seats: sub.max_seats,
            ..Default::default()
        }
    }
}

/// Upsert the subscription and reconcile the quota from its entitlement
///
/// Returns the quota row when the event carried an entitlement.
pub async fn persist_subscription(
    repository: &dyn StateRepository,
    org_id: OrgId,
    data: &SubscriptionEventData,
    now: OffsetDateTime,
) -> BillingResult<Option<QuotaTracking>> {
    repository
        .upsert_subscription(&data.to_subscription(org_id, now))
        .await?;

    let Some(grant) = data.entitlement() else {
        tracing::debug!(
            org_id = %org_id,
            subscription_id = %data.subscription_id,
            "Subscription carries no invoice entitlement, quota left unchanged"
        );
        return Ok(None);
    };

    let quota = repository.apply_entitlement(org_id, &grant, now).await?;

    tracing::info!(
        org_id = %org_id,
        subscription_id = %data.subscription_id,
        status = %data.status,
        invoice_entitlement = grant.invoice_count,
        invoice_count = quota.invoice_count,
        "Subscription snapshot stored"
    );

    Ok(Some(quota))
}
