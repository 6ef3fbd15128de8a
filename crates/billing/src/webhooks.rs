//! Billing provider webhook handling
//!
//! Event types are dispatched through a [`WebhookRegistry`]. Types without a
//! registered handler are acknowledged and logged, so adding a new event on
//! the provider side never turns into a failing delivery.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;

use crate::config::ReconciliationConfig;
use crate::error::BillingResult;
use crate::identity::IdentityAdapter;
use crate::models::SubscriptionStatus;
use crate::normalizer;
use crate::repository::StateRepository;
use crate::snapshot;

/// Collaborators available to a webhook handler
pub struct WebhookContext<'a> {
    pub repository: &'a dyn StateRepository,
    pub identity: &'a dyn IdentityAdapter,
    pub config: &'a ReconciliationConfig,
    pub now: OffsetDateTime,
}

/// Handles one or more webhook event types
#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn handle(&self, ctx: &WebhookContext<'_>, payload: &Value) -> BillingResult<()>;
}

/// Event type to handler table
#[derive(Clone, Default)]
pub struct WebhookRegistry {
    handlers: HashMap<String, Arc<dyn WebhookHandler>>,
}

impl WebhookRegistry {
    /// Empty registry: every event is a no-op
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in subscription, customer and meter handlers
    pub fn with_default_handlers() -> Self {
        let upsert: Arc<dyn WebhookHandler> = Arc::new(SubscriptionUpsertHandler);
        let cancel: Arc<dyn WebhookHandler> = Arc::new(SubscriptionCanceledHandler);
        let meter: Arc<dyn WebhookHandler> = Arc::new(MeterGrantHandler);

        let mut registry = Self::new();
        registry.register("subscription.created", upsert.clone());
        registry.register("subscription.updated", upsert);
        registry.register("subscription.canceled", cancel.clone());
        registry.register("subscription.revoked", cancel);
        registry.register("customer.updated", Arc::new(CustomerUpdatedHandler));
        registry.register("meter.grant.created", meter.clone());
        registry.register("meter.grant.updated", meter.clone());
        registry.register("entitlement.grant.updated", meter);
        registry
    }

    /// Register (or replace) the handler for an event type
    pub fn register(&mut self, event_type: impl Into<String>, handler: Arc<dyn WebhookHandler>) {
        self.handlers.insert(event_type.into(), handler);
    }

    pub fn handles(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Run the handler for `event_type`, or acknowledge it if there is none
    pub async fn dispatch(
        &self,
        ctx: &WebhookContext<'_>,
        event_type: &str,
        payload: &Value,
    ) -> BillingResult<()> {
        match self.handlers.get(event_type) {
            Some(handler) => handler.handle(ctx, payload).await,
            None => {
                tracing::info!(
                    event_type = %event_type,
                    "Received unhandled billing event type - no handler configured"
                );
                Ok(())
            }
        }
    }
}

/// `subscription.created` / `subscription.updated`
pub struct SubscriptionUpsertHandler;

#[async_trait]
impl WebhookHandler for SubscriptionUpsertHandler {
    async fn handle(&self, ctx: &WebhookContext<'_>, payload: &Value) -> BillingResult<()> {
        let data = normalizer::normalize_subscription(payload, &ctx.config.quota_metadata_key)?;
        let org_id = ctx
            .identity
            .get_org_id_by_external_id(&data.external_customer_id)
            .await?;

        snapshot::persist_subscription(ctx.repository, org_id, &data, ctx.now).await?;

        if data.status == SubscriptionStatus::PastDue {
            tracing::warn!(
                org_id = %org_id,
                subscription_id = %data.subscription_id,
                "Subscription is past due"
            );
        }

        Ok(())
    }
}

/// `subscription.canceled` / `subscription.revoked`
pub struct SubscriptionCanceledHandler;

#[async_trait]
impl WebhookHandler for SubscriptionCanceledHandler {
    async fn handle(&self, ctx: &WebhookContext<'_>, payload: &Value) -> BillingResult<()> {
        let data = normalizer::normalize_subscription(payload, &ctx.config.quota_metadata_key)?;
        let org_id = ctx
            .identity
            .get_org_id_by_external_id(&data.external_customer_id)
            .await?;

        let existing = ctx.repository.get_subscription_by_org_id(org_id).await?;
        let mut subscription = data.to_subscription(org_id, ctx.now);
        subscription.status = SubscriptionStatus::Canceled;
        subscription.cancel_at_period_end = false;
        subscription.canceled_at = Some(data.canceled_at.unwrap_or(ctx.now));

        // Cancellation payloads are often thin; keep what we already know
        if let Some(existing) = existing {
            if subscription.product_id.is_empty() {
                subscription.product_id = existing.product_id;
                subscription.product_name = existing.product_name;
            }
            if subscription.external_subscription_id.is_empty() {
                subscription.external_subscription_id = existing.external_subscription_id;
            }
            if subscription.current_period_end.is_none() {
                subscription.current_period_start = existing.current_period_start;
                subscription.current_period_end = existing.current_period_end;
            }
            if subscription.metadata.is_empty() {
                subscription.metadata = existing.metadata;
            }
        }

        ctx.repository.upsert_subscription(&subscription).await?;

        tracing::info!(
            org_id = %org_id,
            subscription_id = %subscription.external_subscription_id,
            "Subscription canceled"
        );

        Ok(())
    }
}

/// `customer.updated`: only the invoice-count metadata is applied
pub struct CustomerUpdatedHandler;

#[async_trait]
impl WebhookHandler for CustomerUpdatedHandler {
    async fn handle(&self, ctx: &WebhookContext<'_>, payload: &Value) -> BillingResult<()> {
        let data = normalizer::normalize_customer(payload, &ctx.config.quota_metadata_key)?;

        let Some(invoice_count) = data.invoice_quota else {
            tracing::info!(
                external_customer_id = %data.external_customer_id,
                "Customer update carries no invoice count, nothing to apply"
            );
            return Ok(());
        };

        let org_id = ctx
            .identity
            .get_org_id_by_external_id(&data.external_customer_id)
            .await?;
        let quota = ctx
            .repository
            .set_invoice_count(org_id, invoice_count, ctx.now)
            .await?;

        tracing::info!(
            org_id = %org_id,
            invoice_count = quota.invoice_count,
            "Invoice count patched from customer metadata"
        );

        Ok(())
    }
}

/// `meter.grant.*` / `entitlement.grant.updated`
///
/// The provider's balance is authoritative for the configured meter and
/// overwrites the remaining count.
pub struct MeterGrantHandler;

#[async_trait]
impl WebhookHandler for MeterGrantHandler {
    async fn handle(&self, ctx: &WebhookContext<'_>, payload: &Value) -> BillingResult<()> {
        let data = normalizer::normalize_meter_grant(payload)?;

        if data.meter_slug != ctx.config.invoice_meter_slug {
            tracing::debug!(
                meter_slug = %data.meter_slug,
                "Ignoring grant for unrelated meter"
            );
            return Ok(());
        }

        let org_id = ctx
            .identity
            .get_org_id_by_external_id(&data.external_customer_id)
            .await?;
        let quota = ctx
            .repository
            .set_invoice_count(org_id, data.available_credits, ctx.now)
            .await?;

        tracing::info!(
            org_id = %org_id,
            meter_slug = %data.meter_slug,
            invoice_count = quota.invoice_count,
            "Invoice count set from meter balance"
        );

        Ok(())
    }
}
