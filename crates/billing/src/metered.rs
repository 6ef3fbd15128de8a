//! Usage reporting to the provider's meter
//!
//! Quota consumption must never wait on the provider. Each consumed invoice is
//! queued here and delivered by a background task with its own per-attempt
//! timeout and exponential backoff. A full queue drops the report with a
//! warning; the local decrement has already happened and is never undone.

use std::sync::Arc;
use std::time::Duration;

use quotaflow_shared::OrgId;
use tokio::sync::{mpsc, oneshot};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::MeterReporterConfig;
use crate::identity::IdentityAdapter;
use crate::provider::{ProviderClient, ProviderError};

/// Upper bound on a single backoff delay
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

/// One unit of usage to deliver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageReport {
    pub org_id: OrgId,
    pub meter_slug: String,
    pub amount: i64,
}

enum Command {
    Report(UsageReport),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the background usage reporter
#[derive(Clone)]
pub struct MeterReporter {
    sender: mpsc::Sender<Command>,
}

impl MeterReporter {
    /// Start the background delivery task on the current runtime
    pub fn spawn(
        provider: Arc<dyn ProviderClient>,
        identity: Arc<dyn IdentityAdapter>,
        config: MeterReporterConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let worker = ReporterWorker {
            provider,
            identity,
            config,
        };
        tokio::spawn(worker.run(receiver));
        Self { sender }
    }

    /// Queue a usage report without waiting
    ///
    /// Returns false if the report was dropped.
    pub fn report(&self, report: UsageReport) -> bool {
        match self.sender.try_send(Command::Report(report)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(Command::Report(report))) => {
                tracing::warn!(
                    org_id = %report.org_id,
                    meter_slug = %report.meter_slug,
                    "Meter report queue full, dropping usage report"
                );
                false
            }
            Err(_) => {
                tracing::warn!("Meter reporter stopped, dropping usage report");
                false
            }
        }
    }

    /// Deliver everything already queued, then stop the background task
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.sender.send(Command::Shutdown(ack)).await.is_err() {
            return;
        }
        let _ = done.await;
    }
}

struct ReporterWorker {
    provider: Arc<dyn ProviderClient>,
    identity: Arc<dyn IdentityAdapter>,
    config: MeterReporterConfig,
}

impl ReporterWorker {
    async fn run(self, mut receiver: mpsc::Receiver<Command>) {
        let mut acks = Vec::new();

        while let Some(command) = receiver.recv().await {
            match command {
                Command::Report(report) => self.deliver(report).await,
                Command::Shutdown(ack) => {
                    acks.push(ack);
                    receiver.close();
                }
            }
        }

        tracing::info!("Meter reporter drained and stopped");
        for ack in acks {
            let _ = ack.send(());
        }
    }

    async fn deliver(&self, report: UsageReport) {
        let external_id = match self.identity.get_external_id(report.org_id).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(
                    org_id = %report.org_id,
                    error = %e,
                    "Cannot report usage for organization without billing customer"
                );
                return;
            }
        };

        let strategy = ExponentialBackoff::from_millis(self.config.backoff_base_ms.max(1))
            .max_delay(RETRY_MAX_DELAY)
            .map(jitter)
            .take(self.config.max_retries);

        let result = RetryIf::spawn(
            strategy,
            || self.attempt(&external_id, &report),
            |e: &ProviderError| {
                tracing::debug!(org_id = %report.org_id, error = %e, "Usage report attempt failed");
                e.is_retryable()
            },
        )
        .await;

        match result {
            Ok(()) => tracing::debug!(
                org_id = %report.org_id,
                meter_slug = %report.meter_slug,
                amount = report.amount,
                "Usage reported"
            ),
            Err(e) => tracing::error!(
                org_id = %report.org_id,
                meter_slug = %report.meter_slug,
                error = %e,
                "Failed to report usage"
            ),
        }
    }

    async fn attempt(&self, external_id: &str, report: &UsageReport) -> Result<(), ProviderError> {
        tokio::time::timeout(
            self.config.attempt_timeout,
            self.provider
                .ingest_meter_event(external_id, &report.meter_slug, report.amount),
        )
        .await
        .map_err(|_| ProviderError::Timeout)?
    }
}
