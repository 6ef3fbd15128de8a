// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Quotaflow Billing Module
//!
//! Reconciles subscription and invoice-quota state from an external billing
//! provider into local per-organization snapshots.
//!
//! ## Features
//!
//! - **Webhooks**: Normalize and apply provider events through a handler registry
//! - **Checkout Verification**: Bounded polling on the post-checkout redirect
//! - **Lazy Guarding**: Re-sync from the provider when local state looks stale
//! - **Quota Consumption**: Atomic local decrement with background usage reporting
//! - **Persistence**: PostgreSQL and in-memory state repositories

pub mod checkout;
pub mod config;
pub mod engine;
pub mod entitlement;
pub mod error;
pub mod identity;
pub mod metered;
pub mod models;
pub mod normalizer;
pub mod provider;
pub mod repository;
pub mod snapshot;
pub mod webhooks;

// Checkout
pub use checkout::CheckoutPoller;

// Config
pub use config::{MeterReporterConfig, PollerConfig, ReconciliationConfig};

// Engine
pub use engine::{ConsumedQuota, ReconciliationEngine};

// Error
pub use error::{BillingError, BillingResult};

// Identity
pub use identity::{IdentityAdapter, InMemoryIdentityAdapter, PgIdentityAdapter};

// Metered
pub use metered::{MeterReporter, UsageReport};

// Models
pub use models::{
    BillingStatus, CheckoutSessionResponse, CheckoutStatus, EntitlementGrant, ProviderSubscription,
    QuotaStatus, QuotaTracking, Subscription, SubscriptionStatus,
};

// Normalizer
pub use normalizer::{CustomerEventData, MeterGrantEventData, SubscriptionEventData};

// Provider
pub use provider::{HttpProviderClient, ProviderClient, ProviderConfig, ProviderError};

// Repository
pub use repository::{InMemoryStateRepository, PgStateRepository, StateRepository};

// Webhooks
pub use webhooks::{WebhookContext, WebhookHandler, WebhookRegistry};
