//! Entitlement derivation
//!
//! Answers "can this organization process invoices right now?" from local
//! snapshots only. Everything here is a pure function of its inputs; the
//! engine decides when the inputs are fresh enough.

use quotaflow_shared::OrgId;
use time::OffsetDateTime;

use crate::models::{
    BillingStatus, CheckoutStatus, QuotaStatus, QuotaTracking, Subscription, SubscriptionStatus,
};

pub const NO_SUBSCRIPTION_REASON: &str = "no active subscription found";

/// Whether a local snapshot must be re-verified with the provider
///
/// Low remaining counts and any non-active status are the cases where a
/// stale snapshot would wrongly refuse (or allow) work.
pub fn needs_fallback(status: &QuotaStatus, threshold: i32) -> bool {
    status.invoice_count < threshold
        || status.subscription_status != Some(SubscriptionStatus::Active)
}

/// Why a quota request is refused, given the organization's subscription status
pub fn quota_denied_reason(subscription_status: Option<SubscriptionStatus>) -> String {
    match subscription_status {
        None => NO_SUBSCRIPTION_REASON.to_string(),
        Some(s) if !s.grants_access() => format!("subscription is {}", s),
        Some(_) => "invoice quota exhausted".to_string(),
    }
}

/// Derive the billing status from local state
pub fn compute_billing_status(
    org_id: OrgId,
    external_id: Option<String>,
    subscription: Option<&Subscription>,
    quota: Option<&QuotaTracking>,
    now: OffsetDateTime,
) -> BillingStatus {
    let invoice_count = quota.map(|q| q.invoice_count).unwrap_or(0);

    let Some(subscription) = subscription else {
        return BillingStatus {
            org_id,
            external_id,
            has_active_subscription: false,
            can_process_invoices: false,
            invoice_count,
            reason: NO_SUBSCRIPTION_REASON.to_string(),
            checked_at: now,
        };
    };

    let has_active_subscription = subscription.status.grants_access();
    let can_process_invoices = has_active_subscription && invoice_count > 0;

    let reason = match (has_active_subscription, invoice_count > 0) {
        (true, true) if subscription.cancel_at_period_end => {
            "subscription active until the end of the current period".to_string()
        }
        (true, true) => format!("subscription {}", subscription.status),
        (true, false) => "invoice quota exhausted for the current period".to_string(),
        (false, _) => format!("subscription is {}", subscription.status),
    };

    BillingStatus {
        org_id,
        external_id: external_id.or_else(|| Some(subscription.external_customer_id.clone())),
        has_active_subscription,
        can_process_invoices,
        invoice_count,
        reason,
        checked_at: now,
    }
}

/// Inactive status for a checkout that ended without payment
pub fn checkout_not_completed(
    org_id: Option<OrgId>,
    external_id: Option<String>,
    session_id: &str,
    status: CheckoutStatus,
    now: OffsetDateTime,
) -> BillingStatus {
    BillingStatus {
        org_id: org_id.unwrap_or_default(),
        external_id,
        has_active_subscription: false,
        can_process_invoices: false,
        invoice_count: 0,
        reason: format!("checkout session {} is {}", session_id, status),
        checked_at: now,
    }
}
