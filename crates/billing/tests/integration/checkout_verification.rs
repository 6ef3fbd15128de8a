//! Verify-on-redirect path

use std::time::Duration;

use quotaflow_billing::{BillingError, CheckoutStatus, StateRepository};
use tokio::time::Instant;

use crate::support::{Harness, CUSTOMER, ORG};

#[tokio::test(start_paused = true)]
async fn test_confirmed_checkout_syncs_subscription() {
    let h = Harness::new().await;
    h.provider.set_subscription(CUSTOMER, 50);
    h.provider
        .script_checkout(vec![CheckoutStatus::Pending, CheckoutStatus::Succeeded]);

    let started = Instant::now();
    let status = h.engine.verify_checkout_session("cs_1").await.unwrap();

    assert_eq!(started.elapsed(), Duration::from_secs(2));
    assert_eq!(status.org_id, ORG);
    assert!(status.has_active_subscription);
    assert!(status.can_process_invoices);
    assert_eq!(status.invoice_count, 50);
    assert_eq!(status.external_id.as_deref(), Some(CUSTOMER));

    let sub = h.repository.get_subscription_by_org_id(ORG).await.unwrap().unwrap();
    assert_eq!(sub.product_id, "prod_pro");
}

#[tokio::test(start_paused = true)]
async fn test_checkout_followed_by_webhook_does_not_double_grant() {
    let h = Harness::new().await;
    h.provider.set_subscription(CUSTOMER, 50);
    h.provider.script_checkout(vec![CheckoutStatus::Succeeded]);

    h.engine.verify_checkout_session("cs_1").await.unwrap();
    h.engine.consume_invoice_quota(ORG).await.unwrap();

    h.engine
        .process_webhook_event(
            "subscription.created",
            &serde_json::json!({"data": {"id": "sub_1", "status": "active",
                "customer": {"external_id": CUSTOMER},
                "metadata": {"invoice_count": 50},
                "product": {"metadata": {"invoice_count": 50}}}}),
        )
        .await
        .unwrap();

    let quota = h.repository.get_quota_by_org_id(ORG).await.unwrap().unwrap();
    assert_eq!(quota.invoice_count, 49);
}

#[tokio::test(start_paused = true)]
async fn test_pending_checkout_times_out() {
    let h = Harness::new().await;
    h.provider.script_checkout(vec![CheckoutStatus::Pending]);

    let started = Instant::now();
    let err = h.engine.verify_checkout_session("cs_slow").await.unwrap_err();

    assert!(matches!(
        err,
        BillingError::CheckoutPollTimeout { last_status: Some(CheckoutStatus::Pending), .. }
    ));
    assert_eq!(h.provider.checkout_calls(), 5);
    assert_eq!(started.elapsed(), Duration::from_secs(10));
    assert!(h.repository.get_subscription_by_org_id(ORG).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_missing_session_fails_fast() {
    let h = Harness::new().await;

    let started = Instant::now();
    let err = h.engine.verify_checkout_session("cs_missing").await.unwrap_err();

    assert_eq!(err.http_status(), 404);
    assert_eq!(h.provider.checkout_calls(), 1);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_caller_cancellation() {
    let h = Harness::new().await;
    h.provider.script_checkout(vec![CheckoutStatus::Pending]);

    let err = h
        .engine
        .verify_checkout_session_until("cs_1", tokio::time::sleep(Duration::from_secs(5)))
        .await
        .unwrap_err();

    assert!(matches!(err, BillingError::Cancelled));
    assert_eq!(h.provider.checkout_calls(), 3);
}
