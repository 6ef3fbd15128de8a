//! Quota consumption under concurrent callers

use std::sync::Arc;

use quotaflow_billing::{BillingError, StateRepository};
use tokio::sync::Barrier;

use crate::support::{Harness, ORG};

async fn race_consumers(h: &Harness, callers: usize) -> (usize, usize) {
    let barrier = Arc::new(Barrier::new(callers));

    let handles: Vec<_> = (0..callers)
        .map(|_| {
            let engine = h.engine.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                engine.consume_invoice_quota(ORG).await
            })
        })
        .collect();

    let mut successes = 0;
    let mut rejections = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(BillingError::QuotaExceeded { .. }) => rejections += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    (successes, rejections)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_n_consumers_against_k_remaining() {
    let h = Harness::new().await;
    h.subscribe(7).await;

    let (successes, rejections) = race_consumers(&h, 25).await;

    assert_eq!(successes, 7);
    assert_eq!(rejections, 18);
    let quota = h.repository.get_quota_by_org_id(ORG).await.unwrap().unwrap();
    assert_eq!(quota.invoice_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancellation_during_consumption_stops_spending() {
    let h = Harness::new().await;
    h.subscribe(40).await;

    let cancel = {
        let engine = h.engine.clone();
        tokio::spawn(async move {
            engine
                .process_webhook_event(
                    "subscription.canceled",
                    &serde_json::json!({"external_customer_id": "cus_123"}),
                )
                .await
        })
    };
    let (successes, rejections) = race_consumers(&h, 10).await;
    cancel.await.unwrap().unwrap();

    assert_eq!(successes + rejections, 10);
    let quota = h.repository.get_quota_by_org_id(ORG).await.unwrap().unwrap();
    assert_eq!(quota.invoice_count, 40 - successes as i32);

    // Nothing more can be spent once the cancellation is stored
    let (successes, rejections) = race_consumers(&h, 5).await;
    assert_eq!((successes, rejections), (0, 5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_last_invoice_goes_to_exactly_one_caller() {
    let h = Harness::new().await;
    h.subscribe(1).await;

    let (successes, rejections) = race_consumers(&h, 2).await;

    assert_eq!((successes, rejections), (1, 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_webhook_during_consumption_never_refills_spent_quota() {
    let h = Harness::new().await;
    let event = serde_json::json!({
        "id": "sub_1",
        "status": "active",
        "current_period_start": "2026-03-01T00:00:00Z",
        "external_customer_id": "cus_123",
        "product": {"metadata": {"invoice_count": 20}}
    });
    h.engine.process_webhook_event("subscription.updated", &event).await.unwrap();

    let replays: Vec<_> = (0..5)
        .map(|_| {
            let engine = h.engine.clone();
            let event = event.clone();
            tokio::spawn(async move { engine.process_webhook_event("subscription.updated", &event).await })
        })
        .collect();
    let (successes, _) = race_consumers(&h, 8).await;
    for replay in replays {
        replay.await.unwrap().unwrap();
    }

    assert_eq!(successes, 8);
    let quota = h.repository.get_quota_by_org_id(ORG).await.unwrap().unwrap();
    assert_eq!(quota.invoice_count, 12);
}
