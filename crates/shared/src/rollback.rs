//! Compensable-step list for multi-step operations
//!
//! Each completed step registers its inverse action. If a later step fails the
//! caller invokes [`RollbackStack::rollback`], which runs the registered
//! inverses last-registered-first. On success the caller invokes
//! [`RollbackStack::commit`] and the inverses are discarded.
//!
//! ```ignore
//! let mut rollback = RollbackStack::new();
//! let saved = repo.get_subscription_by_org_id(org_id).await?;
//! repo.delete_subscription(org_id).await?;
//! rollback.push("restore subscription", async move { repo.upsert_subscription(&saved).await });
//!
//! if let Err(e) = repo.upsert_quota(&zeroed).await {
//!     rollback.rollback().await;
//!     return Err(e);
//! }
//! rollback.commit();
//! ```

use futures::future::BoxFuture;
use std::future::Future;

struct Compensation<E> {
    label: &'static str,
    action: BoxFuture<'static, Result<(), E>>,
}

/// LIFO list of inverse actions
pub struct RollbackStack<E> {
    steps: Vec<Compensation<E>>,
}

impl<E> Default for RollbackStack<E> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<E: std::fmt::Display> RollbackStack<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the inverse of a step that has just completed
    pub fn push<F>(&mut self, label: &'static str, action: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.steps.push(Compensation {
            label,
            action: Box::pin(action),
        });
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Discard all inverses; the operation completed
    pub fn commit(mut self) {
        self.steps.clear();
    }

    /// Run every registered inverse, newest first
    ///
    /// A failing inverse is logged and does not stop the remaining ones.
    /// Returns the number of inverses that failed.
    pub async fn rollback(mut self) -> usize {
        let mut failures = 0;
        while let Some(step) = self.steps.pop() {
            match step.action.await {
                Ok(()) => {
                    tracing::info!(step = step.label, "Rolled back step");
                }
                Err(e) => {
                    failures += 1;
                    tracing::error!(
                        step = step.label,
                        error = %e,
                        "Failed to roll back step"
                    );
                }
            }
        }
        failures
    }
}
