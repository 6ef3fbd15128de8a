//! Billing state snapshots and read models
//!
//! `Subscription` and `QuotaTracking` are the only persisted state: one row per
//! organization each, overwritten by every sync path. `BillingStatus` and
//! `QuotaStatus` are derived on read and never stored.

use quotaflow_shared::OrgId;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Free-form metadata attached to provider objects
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Subscription status as reported by the billing provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
    IncompleteExpired,
    #[default]
    #[serde(other)]
    Unknown,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Unknown => "unknown",
        }
    }

    /// Lenient parse: unrecognised values map to `Unknown`
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => SubscriptionStatus::Active,
            "trialing" => SubscriptionStatus::Trialing,
            "past_due" => SubscriptionStatus::PastDue,
            // Providers disagree on the spelling
            "canceled" | "cancelled" => SubscriptionStatus::Canceled,
            "unpaid" => SubscriptionStatus::Unpaid,
            "incomplete" => SubscriptionStatus::Incomplete,
            "incomplete_expired" => SubscriptionStatus::IncompleteExpired,
            _ => SubscriptionStatus::Unknown,
        }
    }

    /// Statuses that grant access to paid functionality
    pub fn grants_access(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latest subscription snapshot for an organization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub org_id: OrgId,
    pub external_customer_id: String,
    pub external_subscription_id: String,
    pub status: SubscriptionStatus,
    pub product_id: String,
    pub product_name: String,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub metadata: Metadata,
    pub updated_at: OffsetDateTime,
}

/// Remaining invoice quota for an organization
///
/// `invoice_count` counts down toward zero. It is only as fresh as
/// `last_synced_at`; callers decide whether that is fresh enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct QuotaTracking {
    pub org_id: OrgId,
    pub invoice_count: i32,
    /// Per-period grant the remaining count was last derived from; `None`
    /// until a subscription entitlement has been applied
    pub invoice_entitlement: Option<i32>,
    pub max_seats: i32,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub last_synced_at: OffsetDateTime,
    pub last_consumed_at: Option<OffsetDateTime>,
}

impl QuotaTracking {
    /// Minimal row for an organization seen for the first time
    pub fn empty(org_id: OrgId, now: OffsetDateTime) -> Self {
        Self {
            org_id,
            invoice_count: 0,
            invoice_entitlement: None,
            max_seats: 0,
            period_start: None,
            period_end: None,
            last_synced_at: now,
            last_consumed_at: None,
        }
    }
}

/// A per-period invoice entitlement observed at the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitlementGrant {
    pub invoice_count: i32,
    /// Seats from the product; `None` keeps the stored value
    pub max_seats: Option<i32>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
}

impl EntitlementGrant {
    /// Compute the row that results from applying this grant
    ///
    /// A grant for a later period, or for a row that never received an
    /// entitlement, resets the remaining count. A grant for the
    /// same (or an unknown) period only shifts the remaining count by the
    /// change in entitlement, so replays and re-syncs never refill quota that
    /// was already consumed. Repositories must apply this atomically.
    pub fn apply_to(
        &self,
        org_id: OrgId,
        current: Option<&QuotaTracking>,
        now: OffsetDateTime,
    ) -> QuotaTracking {
        let Some(current) = current else {
            return QuotaTracking {
                org_id,
                invoice_count: self.invoice_count.max(0),
                invoice_entitlement: Some(self.invoice_count),
                max_seats: self.max_seats.unwrap_or(0),
                period_start: self.period_start,
                period_end: self.period_end,
                last_synced_at: now,
                last_consumed_at: None,
            };
        };

        let new_period = match (self.period_start, current.period_start) {
            (Some(incoming), Some(stored)) => incoming > stored,
            (Some(_), None) => true,
            (None, _) => false,
        };

        let invoice_count = match current.invoice_entitlement {
            Some(entitlement) if !new_period => {
                let delta = i64::from(self.invoice_count) - i64::from(entitlement);
                (i64::from(current.invoice_count) + delta).clamp(0, i64::from(i32::MAX)) as i32
            }
            _ => self.invoice_count,
        };

        QuotaTracking {
            org_id,
            invoice_count: invoice_count.max(0),
            invoice_entitlement: Some(self.invoice_count),
            max_seats: self.max_seats.unwrap_or(current.max_seats),
            period_start: self.period_start.or(current.period_start),
            period_end: self.period_end.or(current.period_end),
            last_synced_at: now,
            last_consumed_at: current.last_consumed_at,
        }
    }
}

/// Joined read of subscription state and remaining quota
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub org_id: OrgId,
    pub subscription_status: Option<SubscriptionStatus>,
    pub invoice_count: i32,
    pub can_process_invoice: bool,
    pub last_synced_at: Option<OffsetDateTime>,
}

impl QuotaStatus {
    /// Combine the two snapshots into the read model
    pub fn from_parts(
        org_id: OrgId,
        subscription: Option<&Subscription>,
        quota: Option<&QuotaTracking>,
    ) -> Self {
        Self::new(
            org_id,
            subscription.map(|s| s.status),
            quota.map(|q| q.invoice_count).unwrap_or(0),
            quota.map(|q| q.last_synced_at),
        )
    }

    pub fn new(
        org_id: OrgId,
        subscription_status: Option<SubscriptionStatus>,
        invoice_count: i32,
        last_synced_at: Option<OffsetDateTime>,
    ) -> Self {
        Self {
            org_id,
            subscription_status,
            invoice_count,
            can_process_invoice: subscription_status.is_some_and(|s| s.grants_access())
                && invoice_count > 0,
            last_synced_at,
        }
    }
}

/// Billing state answer for status queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingStatus {
    pub org_id: OrgId,
    pub external_id: Option<String>,
    pub has_active_subscription: bool,
    pub can_process_invoices: bool,
    pub invoice_count: i32,
    pub reason: String,
    pub checked_at: OffsetDateTime,
}

/// Checkout session status at the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckoutStatus {
    #[serde(alias = "open")]
    Pending,
    #[serde(alias = "confirmed")]
    Succeeded,
    Expired,
    Failed,
}

impl CheckoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckoutStatus::Pending => "pending",
            CheckoutStatus::Succeeded => "succeeded",
            CheckoutStatus::Expired => "expired",
            CheckoutStatus::Failed => "failed",
        }
    }

    /// No further change is expected from the provider
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CheckoutStatus::Pending)
    }
}

impl std::fmt::Display for CheckoutStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checkout session as returned by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSessionResponse {
    pub id: String,
    pub status: CheckoutStatus,
    #[serde(default)]
    pub external_customer_id: Option<String>,
    #[serde(default)]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub amount: i64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
}

/// Full subscription snapshot fetched from the provider
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProviderSubscription {
    pub id: String,
    pub external_customer_id: String,
    pub status: SubscriptionStatus,
    pub product_id: String,
    pub product_name: String,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub metadata: Metadata,
    /// Entitlement resolved from subscription, product or benefit metadata
    pub invoice_quota: Option<i32>,
    pub max_seats: Option<i32>,
}
