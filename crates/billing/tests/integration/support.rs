//! Shared fixtures: provider mock and engine wiring

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use quotaflow_billing::provider::ProviderResult;
use quotaflow_billing::{
    CheckoutSessionResponse, CheckoutStatus, InMemoryIdentityAdapter, InMemoryStateRepository,
    ProviderClient, ProviderError, ProviderSubscription, ReconciliationConfig,
    ReconciliationEngine, SubscriptionStatus,
};
use quotaflow_shared::OrgId;

pub const ORG: OrgId = OrgId(7);
pub const CUSTOMER: &str = "cus_123";

/// Provider mock with per-call counters
#[derive(Default)]
pub struct MockProvider {
    pub subscriptions: Mutex<HashMap<String, ProviderSubscription>>,
    pub checkout_statuses: Mutex<Vec<CheckoutStatus>>,
    pub ingested: Mutex<Vec<(String, String, i64)>>,
    pub subscription_calls: AtomicU32,
    pub checkout_calls: AtomicU32,
}

impl MockProvider {
    pub fn set_subscription(&self, customer: &str, invoice_quota: i32) {
        self.subscriptions.lock().unwrap().insert(
            customer.to_string(),
            ProviderSubscription {
                id: "sub_1".to_string(),
                external_customer_id: customer.to_string(),
                status: SubscriptionStatus::Active,
                product_id: "prod_pro".to_string(),
                product_name: "Pro".to_string(),
                invoice_quota: Some(invoice_quota),
                ..Default::default()
            },
        );
    }

    /// Statuses returned by successive checkout polls; the last one repeats
    pub fn script_checkout(&self, statuses: Vec<CheckoutStatus>) {
        *self.checkout_statuses.lock().unwrap() = statuses;
    }

    pub fn subscription_calls(&self) -> u32 {
        self.subscription_calls.load(Ordering::SeqCst)
    }

    pub fn checkout_calls(&self) -> u32 {
        self.checkout_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    async fn get_subscription(&self, customer: &str) -> ProviderResult<ProviderSubscription> {
        self.subscription_calls.fetch_add(1, Ordering::SeqCst);
        self.subscriptions
            .lock()
            .unwrap()
            .get(customer)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(customer.to_string()))
    }

    async fn get_checkout_session(&self, session_id: &str) -> ProviderResult<CheckoutSessionResponse> {
        let call = self.checkout_calls.fetch_add(1, Ordering::SeqCst) as usize;
        let statuses = self.checkout_statuses.lock().unwrap();
        let status = statuses
            .get(call)
            .or(statuses.last())
            .copied()
            .ok_or_else(|| ProviderError::NotFound(session_id.to_string()))?;

        Ok(CheckoutSessionResponse {
            id: session_id.to_string(),
            status,
            external_customer_id: Some(CUSTOMER.to_string()),
            subscription_id: Some("sub_1".to_string()),
            product_id: Some("prod_pro".to_string()),
            amount: 4900,
            created_at: None,
        })
    }

    async fn ingest_meter_event(&self, customer: &str, meter_slug: &str, amount: i64) -> ProviderResult<()> {
        self.ingested
            .lock()
            .unwrap()
            .push((customer.to_string(), meter_slug.to_string(), amount));
        Ok(())
    }
}

pub struct Harness {
    pub engine: Arc<ReconciliationEngine>,
    pub repository: Arc<InMemoryStateRepository>,
    pub provider: Arc<MockProvider>,
}

impl Harness {
    /// Engine with organization 7 linked to `cus_123`
    pub async fn new() -> Self {
        let repository = Arc::new(InMemoryStateRepository::new());
        let provider = Arc::new(MockProvider::default());
        let identity = Arc::new(InMemoryIdentityAdapter::new());
        identity.link_customer(ORG, CUSTOMER).await;

        let engine = ReconciliationEngine::new(
            repository.clone(),
            provider.clone(),
            identity,
            ReconciliationConfig::default(),
        );

        Self {
            engine: Arc::new(engine),
            repository,
            provider,
        }
    }

    /// Activate the organization through a `subscription.created` webhook
    pub async fn subscribe(&self, invoice_count: i32) {
        self.engine
            .process_webhook_event(
                "subscription.created",
                &serde_json::json!({
                    "id": "sub_1",
                    "status": "active",
                    "external_customer_id": CUSTOMER,
                    "product": {"metadata": {"invoice_count": invoice_count}}
                }),
            )
            .await
            .unwrap();
    }
}
