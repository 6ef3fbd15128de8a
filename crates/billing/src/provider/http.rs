//! HTTP billing provider client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};

use super::{ProviderClient, ProviderError, ProviderResult};
use crate::config::DEFAULT_QUOTA_METADATA_KEY;
use crate::error::{BillingError, BillingResult};
use crate::models::{CheckoutSessionResponse, CheckoutStatus, ProviderSubscription};
use crate::normalizer::{self, coerce, Document};

/// Configuration for the billing provider API
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Base URL, e.g. `https://api.provider.example`
    pub api_url: String,
    /// Organization access token sent as a bearer token
    pub access_token: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// Metadata key holding the invoice entitlement
    pub quota_metadata_key: String,
}

impl ProviderConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            api_url: std::env::var("PROVIDER_API_URL")
                .map_err(|_| BillingError::Config("PROVIDER_API_URL not set".to_string()))?,
            access_token: std::env::var("PROVIDER_ACCESS_TOKEN")
                .map_err(|_| BillingError::Config("PROVIDER_ACCESS_TOKEN not set".to_string()))?,
            timeout: Duration::from_millis(
                std::env::var("PROVIDER_TIMEOUT_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10_000),
            ),
            quota_metadata_key: std::env::var("INVOICE_QUOTA_METADATA_KEY")
                .unwrap_or_else(|_| DEFAULT_QUOTA_METADATA_KEY.to_string()),
        })
    }
}

/// Billing provider client over its REST API
#[derive(Clone)]
pub struct HttpProviderClient {
    client: Client,
    config: ProviderConfig,
}

impl HttpProviderClient {
    /// Create a new client from config
    pub fn new(config: ProviderConfig) -> BillingResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    /// Create a new client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Self::new(ProviderConfig::from_env()?)
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_url.trim_end_matches('/'), path)
    }

    async fn get_json(&self, path: &str, query: &[(&str, &str)], what: &str) -> ProviderResult<Value> {
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.config.access_token)
            .query(query)
            .send()
            .await
            .map_err(map_transport_error)?;

        let response = check_status(response, what).await?;
        response
            .json::<Value>()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn get_subscription(
        &self,
        external_customer_id: &str,
    ) -> ProviderResult<ProviderSubscription> {
        let body = self
            .get_json(
                "/v1/subscriptions/",
                &[
                    ("external_customer_id", external_customer_id),
                    ("active", "true"),
                    ("limit", "1"),
                ],
                external_customer_id,
            )
            .await?;

        let item = match body.get("items") {
            Some(Value::Array(items)) => items.first().cloned(),
            _ => Some(body),
        }
        .ok_or_else(|| {
            ProviderError::NotFound(format!("subscription for {}", external_customer_id))
        })?;

        normalizer::provider_subscription(&item, &self.config.quota_metadata_key)
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }

    async fn get_checkout_session(
        &self,
        session_id: &str,
    ) -> ProviderResult<CheckoutSessionResponse> {
        let body = self
            .get_json(&format!("/v1/checkouts/{}", session_id), &[], session_id)
            .await?;
        checkout_from_value(&body, session_id)
    }

    async fn ingest_meter_event(
        &self,
        external_customer_id: &str,
        meter_slug: &str,
        amount: i64,
    ) -> ProviderResult<()> {
        let body = json!({
            "events": [{
                "name": meter_slug,
                "external_customer_id": external_customer_id,
                "metadata": { "amount": amount },
            }]
        });

        let response = self
            .client
            .post(self.url("/v1/events/ingest"))
            .bearer_auth(&self.config.access_token)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        check_status(response, meter_slug).await?;
        Ok(())
    }
}

fn map_transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Network(err.to_string())
    }
}

async fn check_status(response: Response, what: &str) -> ProviderResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(ProviderError::NotFound(what.to_string()));
    }
    let message = response.text().await.unwrap_or_default();
    Err(ProviderError::Http {
        status: status.as_u16(),
        message,
    })
}

fn checkout_from_value(body: &Value, session_id: &str) -> ProviderResult<CheckoutSessionResponse> {
    let doc = Document::new(body);

    let status = match doc.get("status") {
        Some(raw) => serde_json::from_value::<CheckoutStatus>(raw.clone()).unwrap_or_else(|_| {
            tracing::warn!(
                session_id = %session_id,
                status = %raw,
                "Unrecognised checkout status, treating as pending"
            );
            CheckoutStatus::Pending
        }),
        None => return Err(ProviderError::Decode("checkout status missing".to_string())),
    };

    Ok(CheckoutSessionResponse {
        id: doc.first_str(&["id"]).unwrap_or_else(|| session_id.to_string()),
        status,
        external_customer_id: doc.first_str(&[
            "external_customer_id",
            "customer_external_id",
            "customer.external_id",
        ]),
        subscription_id: doc.first_str(&["subscription_id", "subscription.id"]),
        product_id: doc.first_str(&["product_id", "product.id"]),
        amount: doc
            .first_of(&["amount", "total_amount"])
            .and_then(coerce::to_i64)
            .unwrap_or(0),
        created_at: doc
            .first_of(&["created_at"])
            .and_then(|v| coerce::to_timestamp(v).ok().flatten()),
    })
}
