//! Billing error types

use quotaflow_shared::OrgId;
use thiserror::Error;

use crate::models::CheckoutStatus;
use crate::provider::ProviderError;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Billing provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Payload missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("No organization mapped to external customer: {0}")]
    OrganizationNotMapped(String),

    #[error("No external customer mapped to organization: {0}")]
    ExternalIdNotMapped(OrgId),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Quota exceeded for organization {org_id}: {reason}")]
    QuotaExceeded { org_id: OrgId, reason: String },

    #[error("Checkout session {session_id} not confirmed after {attempts} attempts (last status: {})", .last_status.map(|s| s.as_str()).unwrap_or("unknown"))]
    CheckoutPollTimeout {
        session_id: String,
        attempts: u32,
        last_status: Option<CheckoutStatus>,
    },

    #[error("Operation cancelled by caller")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether the caller ran out of quota (as opposed to a generic failure)
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, BillingError::QuotaExceeded { .. })
    }

    /// HTTP status an outer handler should answer with
    pub fn http_status(&self) -> u16 {
        match self {
            BillingError::QuotaExceeded { .. } => 402,
            BillingError::NotFound(_)
            | BillingError::OrganizationNotMapped(_)
            | BillingError::ExternalIdNotMapped(_) => 404,
            BillingError::MissingField(_) | BillingError::InvalidField { .. } => 422,
            BillingError::Cancelled => 408,
            BillingError::CheckoutPollTimeout { .. } => 504,
            BillingError::Provider(e) if e.is_retryable() => 503,
            BillingError::Provider(ProviderError::NotFound(_)) => 404,
            _ => 500,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_exceeded_maps_to_payment_required() {
        let err = BillingError::QuotaExceeded {
            org_id: OrgId(7),
            reason: "invoice quota exhausted".to_string(),
        };
        assert!(err.is_quota_exceeded());
        assert_eq!(err.http_status(), 402);
    }

    #[test]
    fn test_generic_failures_map_to_server_error() {
        assert_eq!(BillingError::Database("boom".into()).http_status(), 500);
        assert!(!BillingError::Database("boom".into()).is_quota_exceeded());
        assert_eq!(BillingError::MissingField("external_customer_id").http_status(), 422);
    }

    #[test]
    fn test_poll_timeout_message_carries_last_status() {
        let err = BillingError::CheckoutPollTimeout {
            session_id: "cs_1".into(),
            attempts: 6,
            last_status: Some(CheckoutStatus::Pending),
        };
        let msg = err.to_string();
        assert!(msg.contains("cs_1"));
        assert!(msg.contains("pending"));
        assert!(msg.contains("6 attempts"));
    }
}
