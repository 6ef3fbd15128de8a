//! Checkout verification poller
//!
//! Used on the redirect back from the provider's hosted checkout, when the
//! confirming webhook may not have arrived yet. The caller is blocked for at
//! most the configured budget.

use std::future::Future;
use std::sync::Arc;

use tokio::time::{sleep_until, timeout_at, Instant};

use crate::config::PollerConfig;
use crate::error::{BillingError, BillingResult};
use crate::models::{CheckoutSessionResponse, CheckoutStatus};
use crate::provider::ProviderClient;

/// Polls a checkout session until it leaves `pending`
#[derive(Clone)]
pub struct CheckoutPoller {
    provider: Arc<dyn ProviderClient>,
    config: PollerConfig,
}

impl CheckoutPoller {
    pub fn new(provider: Arc<dyn ProviderClient>, config: PollerConfig) -> Self {
        Self { provider, config }
    }

    /// Poll until the session reaches a terminal status
    ///
    /// The first attempt is immediate; later attempts start on a fixed
    /// schedule of `interval` from the first, and no call starts at or after
    /// the deadline. Each provider call is bounded by the overall deadline. Non-retryable provider errors abort at once.
    /// Dropping the returned future stops polling.
    pub async fn poll(&self, session_id: &str) -> BillingResult<CheckoutSessionResponse> {
        let start = Instant::now();
        let deadline = start + self.config.budget;
        let mut attempts: u32 = 0;
        let mut last_status: Option<CheckoutStatus> = None;

        loop {
            attempts += 1;

            match timeout_at(deadline, self.provider.get_checkout_session(session_id)).await {
                Err(_) => {
                    tracing::warn!(
                        session_id = %session_id,
                        attempts = attempts,
                        "Checkout status request outlived the polling budget"
                    );
                    break;
                }
                Ok(Ok(session)) => {
                    last_status = Some(session.status);
                    if session.status.is_terminal() {
                        tracing::info!(
                            session_id = %session_id,
                            status = %session.status,
                            attempts = attempts,
                            "Checkout session reached terminal status"
                        );
                        return Ok(session);
                    }
                    tracing::debug!(
                        session_id = %session_id,
                        attempts = attempts,
                        "Checkout session still pending"
                    );
                }
                Ok(Err(e)) if e.is_retryable() => {
                    tracing::warn!(
                        session_id = %session_id,
                        attempts = attempts,
                        error = %e,
                        "Transient error polling checkout session"
                    );
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %e,
                        "Checkout verification aborted"
                    );
                    return Err(e.into());
                }
            }

            // A call starting at the deadline could never complete in time
            let next_attempt = start + self.config.interval * attempts;
            if next_attempt >= deadline {
                sleep_until(deadline).await;
                break;
            }
            sleep_until(next_attempt).await;
        }

        Err(BillingError::CheckoutPollTimeout {
            session_id: session_id.to_string(),
            attempts,
            last_status,
        })
    }

    /// Like [`poll`](Self::poll), but gives up as soon as `cancel` resolves
    pub async fn poll_until_cancelled<F>(
        &self,
        session_id: &str,
        cancel: F,
    ) -> BillingResult<CheckoutSessionResponse>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            _ = cancel => {
                tracing::info!(session_id = %session_id, "Checkout verification cancelled");
                Err(BillingError::Cancelled)
            }
            result = self.poll(session_id) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::models::ProviderSubscription;
    use crate::provider::{ProviderError, ProviderResult};

    /// Serves scripted responses, then `pending` forever
    #[derive(Default)]
    struct ScriptedCheckouts {
        script: Mutex<VecDeque<ProviderResult<CheckoutStatus>>>,
        calls: AtomicU32,
        latency: Option<Duration>,
    }

    impl ScriptedCheckouts {
        fn with(script: Vec<ProviderResult<CheckoutStatus>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedCheckouts {
        async fn get_subscription(&self, id: &str) -> ProviderResult<ProviderSubscription> {
            Err(ProviderError::NotFound(id.to_string()))
        }

        async fn get_checkout_session(
            &self,
            session_id: &str,
        ) -> ProviderResult<CheckoutSessionResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(CheckoutStatus::Pending));
            next.map(|status| CheckoutSessionResponse {
                id: session_id.to_string(),
                status,
                external_customer_id: Some("cus_123".to_string()),
                subscription_id: None,
                product_id: None,
                amount: 0,
                created_at: None,
            })
        }

        async fn ingest_meter_event(&self, _: &str, _: &str, _: i64) -> ProviderResult<()> {
            Ok(())
        }
    }

    fn poller(provider: Arc<ScriptedCheckouts>) -> CheckoutPoller {
        CheckoutPoller::new(provider, PollerConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_forever_times_out_within_budget() {
        let provider = Arc::new(ScriptedCheckouts::default());
        let started = Instant::now();

        let err = poller(provider.clone()).poll("cs_1").await.unwrap_err();
        let elapsed = started.elapsed();

        match err {
            BillingError::CheckoutPollTimeout {
                attempts,
                last_status,
                ..
            } => {
                // Calls at 0, 2, 4, 6 and 8 seconds; none at the deadline
                assert_eq!(attempts, 5);
                assert_eq!(last_status, Some(CheckoutStatus::Pending));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(provider.calls(), 5);
        assert_eq!(elapsed, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_short_circuits_without_waiting() {
        let provider = Arc::new(ScriptedCheckouts::with(vec![Err(ProviderError::NotFound(
            "cs_missing".into(),
        ))]));
        let started = Instant::now();

        let err = poller(provider.clone()).poll("cs_missing").await.unwrap_err();

        assert!(matches!(err, BillingError::Provider(ProviderError::NotFound(_))));
        assert_eq!(provider.calls(), 1);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried_until_success() {
        let provider = Arc::new(ScriptedCheckouts::with(vec![
            Err(ProviderError::Http {
                status: 503,
                message: "unavailable".into(),
            }),
            Ok(CheckoutStatus::Pending),
            Ok(CheckoutStatus::Succeeded),
        ]));
        let started = Instant::now();

        let session = poller(provider.clone()).poll("cs_1").await.unwrap();

        assert_eq!(session.status, CheckoutStatus::Succeeded);
        assert_eq!(provider.calls(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_is_returned_immediately() {
        let provider = Arc::new(ScriptedCheckouts::with(vec![Ok(CheckoutStatus::Expired)]));
        let session = poller(provider.clone()).poll("cs_1").await.unwrap();
        assert_eq!(session.status, CheckoutStatus::Expired);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_is_cut_off_at_deadline() {
        let provider = Arc::new(ScriptedCheckouts {
            latency: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let started = Instant::now();

        let err = poller(provider.clone()).poll("cs_1").await.unwrap_err();

        assert!(matches!(
            err,
            BillingError::CheckoutPollTimeout { attempts: 1, last_status: None, .. }
        ));
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_polling() {
        let provider = Arc::new(ScriptedCheckouts::default());
        let started = Instant::now();

        let err = poller(provider.clone())
            .poll_until_cancelled("cs_1", tokio::time::sleep(Duration::from_secs(3)))
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::Cancelled));
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(provider.calls(), 2);
    }
}
