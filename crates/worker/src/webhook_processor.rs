//! Webhook Queue Processor
//!
//! Drains provider webhooks persisted in `billing_webhook_queue` into the
//! reconciliation engine. Rows are claimed atomically so several workers can
//! share the table; failures are retried until `max_attempts` is reached.

use quotaflow_billing::ReconciliationEngine;
use serde_json::Value;
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Rows stuck in `processing` longer than this are assumed abandoned by a
/// crashed worker and become claimable again
const STALE_CLAIM_MINUTES: i32 = 5;

/// Process one batch of pending webhooks
///
/// Returns the number of rows that were applied successfully.
pub async fn process_webhook_queue(
    pool: &PgPool,
    engine: &ReconciliationEngine,
    batch_size: i64,
) -> usize {
    // Claim and mark in one statement so the row locks cover the status change
    let webhooks: Vec<(Uuid, String, Value, i32, i32)> = match sqlx::query_as(
        r#"
        UPDATE billing_webhook_queue
        SET status = 'processing', last_attempt_at = NOW(), attempts = attempts + 1
        WHERE id IN (
            SELECT id
            FROM billing_webhook_queue
            WHERE (status = 'pending'
                   OR (status = 'failed' AND attempts < max_attempts)
                   OR (status = 'processing'
                       AND last_attempt_at < NOW() - make_interval(mins => $2)))
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, event_type, payload, attempts, max_attempts
        "#,
    )
    .bind(batch_size.max(1))
    .bind(STALE_CLAIM_MINUTES)
    .fetch_all(pool)
    .await
    {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "Failed to claim webhooks from queue");
            return 0;
        }
    };

    if webhooks.is_empty() {
        return 0;
    }

    info!(count = webhooks.len(), "Processing billing webhooks from queue");

    let mut processed = 0;
    for (queue_id, event_type, payload, attempts, max_attempts) in webhooks {
        match engine.process_webhook_event(&event_type, &payload).await {
            Ok(()) => {
                if let Err(e) = sqlx::query(
                    "UPDATE billing_webhook_queue SET status = 'completed', processed_at = NOW(), last_error = NULL WHERE id = $1",
                )
                .bind(queue_id)
                .execute(pool)
                .await
                {
                    error!(queue_id = %queue_id, error = %e, "Failed to mark webhook as completed");
                }
                info!(queue_id = %queue_id, event_type = %event_type, "Webhook processed successfully");
                processed += 1;
            }
            Err(e) => {
                let error_msg = e.to_string();

                if let Err(e) = sqlx::query(
                    "UPDATE billing_webhook_queue SET status = 'failed', last_error = $1 WHERE id = $2",
                )
                .bind(&error_msg)
                .bind(queue_id)
                .execute(pool)
                .await
                {
                    error!(queue_id = %queue_id, error = %e, "Failed to mark webhook as failed");
                }

                if attempts >= max_attempts {
                    error!(
                        queue_id = %queue_id,
                        event_type = %event_type,
                        attempts = attempts,
                        error = %error_msg,
                        "Webhook permanently failed after max retries"
                    );
                } else {
                    warn!(
                        queue_id = %queue_id,
                        event_type = %event_type,
                        attempts = attempts,
                        max_attempts = max_attempts,
                        error = %error_msg,
                        "Webhook processing failed, will retry"
                    );
                }
            }
        }
    }

    processed
}

/// Delete completed and permanently failed rows older than the retention window
pub async fn cleanup_old_webhooks(pool: &PgPool, retention_days: i32) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        DELETE FROM billing_webhook_queue
        WHERE (status = 'completed' OR (status = 'failed' AND attempts >= max_attempts))
          AND created_at < NOW() - make_interval(days => $1)
        "#,
    )
    .bind(retention_days)
    .execute(pool)
    .await?;

    let deleted = result.rows_affected();
    if deleted > 0 {
        info!(count = deleted, retention_days, "Cleaned up old billing webhooks");
    }

    Ok(deleted)
}
