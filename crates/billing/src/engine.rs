//! Subscription and invoice-quota reconciliation
//!
//! Three paths write the local snapshot:
//!
//! - **Webhooks** ([`ReconciliationEngine::process_webhook_event`]) are the
//!   normal, event-driven path.
//! - **Verify on redirect** ([`ReconciliationEngine::verify_checkout_session`])
//!   covers the gap between a completed checkout and its webhook.
//! - **Lazy guarding** ([`ReconciliationEngine::get_quota_status`]) re-syncs
//!   from the provider when the local snapshot looks stale or unfavorable,
//!   healing missed webhooks without calling the provider on every read.
//!
//! Consumption never calls the provider inline. The repository's atomic
//! decrement is the system of record; usage is reported to the provider's
//! meter in the background.

use std::future::Future;
use std::sync::Arc;

use quotaflow_shared::{OrgId, RollbackStack};
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

use crate::checkout::CheckoutPoller;
use crate::config::ReconciliationConfig;
use crate::entitlement;
use crate::error::{BillingError, BillingResult};
use crate::identity::IdentityAdapter;
use crate::metered::{MeterReporter, UsageReport};
use crate::models::{
    BillingStatus, CheckoutSessionResponse, CheckoutStatus, QuotaStatus, SubscriptionStatus,
};
use crate::normalizer::SubscriptionEventData;
use crate::provider::{ProviderClient, ProviderError};
use crate::repository::StateRepository;
use crate::snapshot;
use crate::webhooks::{WebhookContext, WebhookRegistry};

/// Result of a successful consumption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsumedQuota {
    pub org_id: OrgId,
    /// Invoices remaining after this one
    pub invoice_count: i32,
}

/// Reconciles provider billing state into local subscription and quota rows
pub struct ReconciliationEngine {
    repository: Arc<dyn StateRepository>,
    provider: Arc<dyn ProviderClient>,
    identity: Arc<dyn IdentityAdapter>,
    registry: WebhookRegistry,
    poller: CheckoutPoller,
    reporter: MeterReporter,
    config: ReconciliationConfig,
}

impl ReconciliationEngine {
    /// Create an engine with the default webhook handlers
    ///
    /// Spawns the meter reporter, so this must run inside a Tokio runtime.
    pub fn new(
        repository: Arc<dyn StateRepository>,
        provider: Arc<dyn ProviderClient>,
        identity: Arc<dyn IdentityAdapter>,
        config: ReconciliationConfig,
    ) -> Self {
        let poller = CheckoutPoller::new(provider.clone(), config.poller);
        let reporter = MeterReporter::spawn(provider.clone(), identity.clone(), config.meter_reporter);

        Self {
            repository,
            provider,
            identity,
            registry: WebhookRegistry::with_default_handlers(),
            poller,
            reporter,
            config,
        }
    }

    /// Replace the webhook handler table
    pub fn with_registry(mut self, registry: WebhookRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    pub fn meter_reporter(&self) -> &MeterReporter {
        &self.reporter
    }

    // =========================================================================
    // Webhook path
    // =========================================================================

    /// Apply one provider webhook
    ///
    /// Unknown event types succeed without effect. Recognized events whose
    /// payload cannot be normalized, or whose customer maps to no
    /// organization, fail.
    pub async fn process_webhook_event(&self, event_type: &str, payload: &Value) -> BillingResult<()> {
        let ctx = WebhookContext {
            repository: self.repository.as_ref(),
            identity: self.identity.as_ref(),
            config: &self.config,
            now: OffsetDateTime::now_utc(),
        };

        self.registry
            .dispatch(&ctx, event_type, payload)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    event_type = %event_type,
                    error = %e,
                    "Failed to process billing webhook"
                );
            })
    }

    // =========================================================================
    // Verify-on-redirect path
    // =========================================================================

    /// Confirm a checkout session and sync the resulting subscription
    ///
    /// Blocks for at most the poller budget. Sessions that end expired or
    /// failed produce an inactive status rather than an error.
    pub async fn verify_checkout_session(&self, session_id: &str) -> BillingResult<BillingStatus> {
        let session = self.poller.poll(session_id).await?;
        self.complete_checkout(session).await
    }

    /// Like [`verify_checkout_session`](Self::verify_checkout_session), but
    /// stops polling as soon as `cancel` resolves
    pub async fn verify_checkout_session_until<F>(
        &self,
        session_id: &str,
        cancel: F,
    ) -> BillingResult<BillingStatus>
    where
        F: Future<Output = ()>,
    {
        let session = self.poller.poll_until_cancelled(session_id, cancel).await?;
        self.complete_checkout(session).await
    }

    async fn complete_checkout(&self, session: CheckoutSessionResponse) -> BillingResult<BillingStatus> {
        let now = OffsetDateTime::now_utc();

        if session.status != CheckoutStatus::Succeeded {
            let org_id = match &session.external_customer_id {
                Some(external_id) => self.identity.get_org_id_by_external_id(external_id).await.ok(),
                None => None,
            };
            tracing::info!(
                session_id = %session.id,
                status = %session.status,
                "Checkout session ended without payment"
            );
            return Ok(entitlement::checkout_not_completed(
                org_id,
                session.external_customer_id,
                &session.id,
                session.status,
                now,
            ));
        }

        let external_id = session
            .external_customer_id
            .ok_or(BillingError::MissingField("external_customer_id"))?;
        let org_id = self.identity.get_org_id_by_external_id(&external_id).await?;

        self.sync_external(org_id, &external_id, now).await?;

        tracing::info!(
            org_id = %org_id,
            session_id = %session.id,
            "Checkout verified and subscription synced"
        );

        self.billing_status_with(org_id, Some(external_id), now).await
    }

    // =========================================================================
    // Lazy-guarding path
    // =========================================================================

    /// Fetch the provider's current subscription and store it locally
    ///
    /// A provider with no active subscription for the customer cancels the
    /// local one.
    pub async fn sync_from_provider(&self, org_id: OrgId) -> BillingResult<QuotaStatus> {
        let external_id = self.identity.get_external_id(org_id).await?;
        let now = OffsetDateTime::now_utc();
        match self.sync_external(org_id, &external_id, now).await {
            Ok(()) => {}
            Err(BillingError::Provider(ProviderError::NotFound(what))) => {
                if !self.cancel_local_subscription(org_id, now).await? {
                    return Err(ProviderError::NotFound(what).into());
                }
            }
            Err(e) => return Err(e),
        }

        self.repository
            .get_quota_status(org_id)
            .await?
            .ok_or_else(|| BillingError::Internal(format!("quota status missing after sync for {}", org_id)))
    }

    async fn sync_external(
        &self,
        org_id: OrgId,
        external_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let provider_subscription = self.provider.get_subscription(external_id).await?;
        let mut data = SubscriptionEventData::from(provider_subscription);
        if data.external_customer_id.is_empty() {
            data.external_customer_id = external_id.to_string();
        }
        snapshot::persist_subscription(self.repository.as_ref(), org_id, &data, now).await?;
        Ok(())
    }

    /// Returns false when there is no local subscription to cancel
    async fn cancel_local_subscription(&self, org_id: OrgId, now: OffsetDateTime) -> BillingResult<bool> {
        let Some(mut subscription) = self.repository.get_subscription_by_org_id(org_id).await? else {
            return Ok(false);
        };
        if subscription.status == SubscriptionStatus::Canceled {
            return Ok(true);
        }

        tracing::warn!(
            org_id = %org_id,
            subscription_id = %subscription.external_subscription_id,
            previous_status = %subscription.status,
            "Provider has no active subscription, canceling local snapshot"
        );

        subscription.status = SubscriptionStatus::Canceled;
        subscription.cancel_at_period_end = false;
        subscription.canceled_at.get_or_insert(now);
        subscription.updated_at = now;
        self.repository.upsert_subscription(&subscription).await?;
        Ok(true)
    }

    /// Quota status, re-verified with the provider when it looks unreliable
    ///
    /// Organizations with no local rows are answered locally. A re-sync that
    /// fails for any reason other than the provider reporting no active
    /// subscription falls back to the local snapshot.
    pub async fn get_quota_status(&self, org_id: OrgId) -> BillingResult<QuotaStatus> {
        let Some(local) = self.repository.get_quota_status(org_id).await? else {
            return Ok(QuotaStatus::new(org_id, None, 0, None));
        };

        if !entitlement::needs_fallback(&local, self.config.fallback_invoice_threshold) {
            return Ok(local);
        }

        tracing::debug!(
            org_id = %org_id,
            invoice_count = local.invoice_count,
            "Local quota needs verification, re-syncing from provider"
        );

        match self.sync_from_provider(org_id).await {
            Ok(fresh) => {
                if fresh.invoice_count != local.invoice_count
                    || fresh.subscription_status != local.subscription_status
                {
                    tracing::info!(
                        org_id = %org_id,
                        local_invoice_count = local.invoice_count,
                        provider_invoice_count = fresh.invoice_count,
                        "Local quota corrected from provider"
                    );
                }
                Ok(fresh)
            }
            Err(e) => {
                tracing::warn!(
                    org_id = %org_id,
                    error = %e,
                    "Provider re-sync failed, answering from local snapshot"
                );
                Ok(local)
            }
        }
    }

    /// Check that the organization may process one more invoice
    ///
    /// Does not consume anything. Fails with `QuotaExceeded` when the
    /// subscription is inactive or no invoices remain.
    pub async fn check_quota_availability(&self, org_id: OrgId) -> BillingResult<QuotaStatus> {
        let status = self.get_quota_status(org_id).await?;
        if status.can_process_invoice {
            return Ok(status);
        }

        Err(BillingError::QuotaExceeded {
            org_id,
            reason: entitlement::quota_denied_reason(status.subscription_status),
        })
    }

    // =========================================================================
    // Consumption
    // =========================================================================

    /// Spend one invoice from the organization's quota
    ///
    /// Call after the billable work has succeeded. Fails with `QuotaExceeded`
    /// when no invoices remain or the subscription does not grant access.
    /// Usage is reported to the provider in the background; a failed report
    /// never restores quota.
    pub async fn consume_invoice_quota(&self, org_id: OrgId) -> BillingResult<ConsumedQuota> {
        match self.repository.get_quota_by_org_id(org_id).await {
            Ok(Some(quota)) => tracing::debug!(
                org_id = %org_id,
                invoice_count = quota.invoice_count,
                "Consuming invoice quota"
            ),
            Ok(None) => tracing::debug!(org_id = %org_id, "Consuming invoice quota with no quota row"),
            Err(e) => tracing::debug!(org_id = %org_id, error = %e, "Could not read quota before consume"),
        }

        let now = OffsetDateTime::now_utc();
        let Some(invoice_count) = self.repository.decrement_invoice_count(org_id, now).await? else {
            let subscription_status = self
                .repository
                .get_subscription_by_org_id(org_id)
                .await?
                .map(|s| s.status);
            let reason = entitlement::quota_denied_reason(subscription_status);
            tracing::info!(org_id = %org_id, reason = %reason, "Invoice quota consumption refused");
            return Err(BillingError::QuotaExceeded { org_id, reason });
        };

        self.reporter.report(UsageReport {
            org_id,
            meter_slug: self.config.invoice_meter_slug.clone(),
            amount: 1,
        });

        Ok(ConsumedQuota {
            org_id,
            invoice_count,
        })
    }

    /// Check availability and consume in one call
    #[deprecated(
        note = "spends quota before the billable work runs; call check_quota_availability, then consume_invoice_quota after the work succeeds"
    )]
    pub async fn verify_and_consume(&self, org_id: OrgId) -> BillingResult<ConsumedQuota> {
        self.check_quota_availability(org_id).await?;
        self.consume_invoice_quota(org_id).await
    }

    // =========================================================================
    // Reads and administration
    // =========================================================================

    /// Billing status from local state only
    pub async fn get_billing_status(&self, org_id: OrgId) -> BillingResult<BillingStatus> {
        let external_id = self.identity.get_external_id(org_id).await.ok();
        self.billing_status_with(org_id, external_id, OffsetDateTime::now_utc())
            .await
    }

    async fn billing_status_with(
        &self,
        org_id: OrgId,
        external_id: Option<String>,
        now: OffsetDateTime,
    ) -> BillingResult<BillingStatus> {
        let subscription = self.repository.get_subscription_by_org_id(org_id).await?;
        let quota = self.repository.get_quota_by_org_id(org_id).await?;
        Ok(entitlement::compute_billing_status(
            org_id,
            external_id,
            subscription.as_ref(),
            quota.as_ref(),
            now,
        ))
    }

    /// Remove the subscription and zero the remaining quota
    ///
    /// If zeroing the quota fails the deleted subscription is restored.
    pub async fn unsubscribe(&self, org_id: OrgId) -> BillingResult<()> {
        let saved = self
            .repository
            .get_subscription_by_org_id(org_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription for organization {}", org_id)))?;

        let mut rollback = RollbackStack::new();

        self.repository.delete_subscription(org_id).await?;
        let repository = self.repository.clone();
        rollback.push("restore subscription", async move {
            repository.upsert_subscription(&saved).await
        });

        if let Err(e) = self
            .repository
            .set_invoice_count(org_id, 0, OffsetDateTime::now_utc())
            .await
        {
            tracing::error!(org_id = %org_id, error = %e, "Failed to zero quota, restoring subscription");
            rollback.rollback().await;
            return Err(e);
        }
        rollback.commit();

        tracing::info!(org_id = %org_id, "Organization unsubscribed");
        Ok(())
    }
}
