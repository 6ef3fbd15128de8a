//! Reconciliation engine configuration

use std::str::FromStr;
use std::time::Duration;

use crate::error::{BillingError, BillingResult};

/// Meter whose grants drive the invoice quota
pub const DEFAULT_INVOICE_METER_SLUG: &str = "invoice_processing";
/// Metadata key holding the per-period invoice entitlement
pub const DEFAULT_QUOTA_METADATA_KEY: &str = "invoice_count";
/// Below this many remaining invoices the local snapshot is re-verified
pub const FALLBACK_INVOICE_THRESHOLD: i32 = 10;

/// Checkout verification polling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    pub interval: Duration,
    /// Wall-clock budget for the whole poll, first attempt included
    pub budget: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            budget: Duration::from_secs(10),
        }
    }
}

/// Background usage reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeterReporterConfig {
    /// Timeout for each delivery attempt
    pub attempt_timeout: Duration,
    /// Retries after the first attempt
    pub max_retries: usize,
    pub queue_capacity: usize,
    /// Base delay for exponential backoff between attempts
    pub backoff_base_ms: u64,
}

impl Default for MeterReporterConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(10),
            max_retries: 3,
            queue_capacity: 1024,
            backoff_base_ms: 200,
        }
    }
}

/// Settings for [`crate::ReconciliationEngine`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationConfig {
    pub invoice_meter_slug: String,
    pub quota_metadata_key: String,
    pub fallback_invoice_threshold: i32,
    pub poller: PollerConfig,
    pub meter_reporter: MeterReporterConfig,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            invoice_meter_slug: DEFAULT_INVOICE_METER_SLUG.to_string(),
            quota_metadata_key: DEFAULT_QUOTA_METADATA_KEY.to_string(),
            fallback_invoice_threshold: FALLBACK_INVOICE_THRESHOLD,
            poller: PollerConfig::default(),
            meter_reporter: MeterReporterConfig::default(),
        }
    }
}

impl ReconciliationConfig {
    /// Create config from environment variables, falling back to defaults
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            invoice_meter_slug: std::env::var("INVOICE_METER_SLUG")
                .unwrap_or(defaults.invoice_meter_slug),
            quota_metadata_key: std::env::var("INVOICE_QUOTA_METADATA_KEY")
                .unwrap_or(defaults.quota_metadata_key),
            fallback_invoice_threshold: env_or(
                "FALLBACK_INVOICE_THRESHOLD",
                defaults.fallback_invoice_threshold,
            )?,
            poller: PollerConfig {
                interval: Duration::from_millis(env_or("CHECKOUT_POLL_INTERVAL_MS", 2_000)?),
                budget: Duration::from_millis(env_or("CHECKOUT_POLL_BUDGET_MS", 10_000)?),
            },
            meter_reporter: MeterReporterConfig {
                attempt_timeout: Duration::from_millis(env_or("METER_REPORT_TIMEOUT_MS", 10_000)?),
                max_retries: env_or("METER_REPORT_MAX_RETRIES", 3)?,
                queue_capacity: env_or("METER_REPORT_QUEUE_CAPACITY", 1024)?,
                backoff_base_ms: defaults.meter_reporter.backoff_base_ms,
            },
        })
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> BillingResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has an invalid value: {:?}", name, raw))),
        Err(_) => Ok(default),
    }
}
