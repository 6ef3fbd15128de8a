//! Billing provider interface
//!
//! The engine only talks to the provider through [`ProviderClient`]. The HTTP
//! implementation lives in [`http`]; tests use in-process mocks.

pub mod http;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{CheckoutSessionResponse, ProviderSubscription};

pub use http::{HttpProviderClient, ProviderConfig};

/// Errors returned by a provider client
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Resource not found at provider: {0}")]
    NotFound(String),

    #[error("Provider returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Network error talking to provider: {0}")]
    Network(String),

    #[error("Timed out waiting for provider")]
    Timeout,

    #[error("Could not decode provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Returns true if this error is transient and the call should be retried
    ///
    /// 404 and other 4xx responses (except 429) will not change on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Network(_) | ProviderError::Timeout => true,
            ProviderError::Http { status, .. } => *status == 429 || *status >= 500,
            ProviderError::NotFound(_) | ProviderError::Decode(_) => false,
        }
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Operations the reconciliation engine needs from the billing provider
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Current subscription for an external customer
    async fn get_subscription(
        &self,
        external_customer_id: &str,
    ) -> ProviderResult<ProviderSubscription>;

    /// Checkout session by id
    async fn get_checkout_session(&self, session_id: &str)
        -> ProviderResult<CheckoutSessionResponse>;

    /// Record usage against a provider-side meter
    async fn ingest_meter_event(
        &self,
        external_customer_id: &str,
        meter_slug: &str,
        amount: i64,
    ) -> ProviderResult<()>;
}
