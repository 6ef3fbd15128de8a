//! Webhook-driven sync and local reads

use quotaflow_billing::{BillingError, StateRepository, SubscriptionStatus};
use quotaflow_shared::OrgId;
use serde_json::{json, Value};

use crate::support::{Harness, CUSTOMER, ORG};

fn subscription_event(invoice_count: Value, period_start: &str) -> Value {
    json!({
        "type": "subscription.updated",
        "data": {
            "id": "sub_1",
            "status": "active",
            "current_period_start": period_start,
            "customer": {"external_id": CUSTOMER},
            "product": {"id": "prod_pro", "name": "Pro", "metadata": {"invoice_count": invoice_count}}
        }
    })
}

#[tokio::test]
async fn test_webhook_then_consume_end_to_end() {
    let h = Harness::new().await;

    h.engine
        .process_webhook_event(
            "subscription.created",
            &subscription_event(json!(50), "2026-03-01T00:00:00Z"),
        )
        .await
        .unwrap();

    let status = h.engine.get_quota_status(ORG).await.unwrap();
    assert_eq!(status.invoice_count, 50);
    assert_eq!(status.subscription_status, Some(SubscriptionStatus::Active));
    assert!(status.can_process_invoice);
    assert_eq!(h.provider.subscription_calls(), 0);

    let consumed = h.engine.consume_invoice_quota(ORG).await.unwrap();
    assert_eq!(consumed.invoice_count, 49);

    h.engine.meter_reporter().shutdown().await;
    assert_eq!(
        h.provider.ingested.lock().unwrap().as_slice(),
        &[(CUSTOMER.to_string(), "invoice_processing".to_string(), 1)]
    );
}

#[tokio::test]
async fn test_replayed_webhook_is_idempotent() {
    let h = Harness::new().await;
    let event = subscription_event(json!("50"), "2026-03-01T00:00:00Z");

    h.engine.process_webhook_event("subscription.updated", &event).await.unwrap();
    let first_sub = h.repository.get_subscription_by_org_id(ORG).await.unwrap().unwrap();

    h.engine.consume_invoice_quota(ORG).await.unwrap();
    h.engine.consume_invoice_quota(ORG).await.unwrap();

    h.engine.process_webhook_event("subscription.updated", &event).await.unwrap();
    h.engine.process_webhook_event("subscription.updated", &event).await.unwrap();

    let quota = h.repository.get_quota_by_org_id(ORG).await.unwrap().unwrap();
    assert_eq!(quota.invoice_count, 48);
    assert_eq!(quota.invoice_entitlement, Some(50));

    let sub = h.repository.get_subscription_by_org_id(ORG).await.unwrap().unwrap();
    assert_eq!(sub.external_subscription_id, first_sub.external_subscription_id);
    assert_eq!(sub.status, first_sub.status);
    assert_eq!(sub.current_period_start, first_sub.current_period_start);
}

#[tokio::test]
async fn test_consume_refused_after_cancellation() {
    let h = Harness::new().await;
    h.engine
        .process_webhook_event(
            "subscription.created",
            &subscription_event(json!(50), "2026-03-01T00:00:00Z"),
        )
        .await
        .unwrap();
    h.engine
        .process_webhook_event("subscription.canceled", &json!({"data": {"external_customer_id": CUSTOMER}}))
        .await
        .unwrap();

    let err = h.engine.consume_invoice_quota(ORG).await.unwrap_err();
    match err {
        BillingError::QuotaExceeded { reason, .. } => assert_eq!(reason, "subscription is canceled"),
        other => panic!("unexpected error: {other}"),
    }

    let quota = h.repository.get_quota_by_org_id(ORG).await.unwrap().unwrap();
    assert_eq!(quota.invoice_count, 50);
    h.engine.meter_reporter().shutdown().await;
    assert!(h.provider.ingested.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_meter_grant_before_subscription_does_not_stack() {
    let h = Harness::new().await;
    h.engine
        .process_webhook_event(
            "meter.grant.created",
            &json!({"meter_slug": "invoice_processing", "external_customer_id": CUSTOMER, "balance": 33}),
        )
        .await
        .unwrap();
    h.engine
        .process_webhook_event(
            "subscription.created",
            &json!({"data": {"id": "sub_1", "status": "active",
                "customer": {"external_id": CUSTOMER},
                "product": {"metadata": {"invoice_count": 50}}}}),
        )
        .await
        .unwrap();

    let quota = h.repository.get_quota_by_org_id(ORG).await.unwrap().unwrap();
    assert_eq!(quota.invoice_count, 50);
    assert_eq!(quota.invoice_entitlement, Some(50));
}

#[tokio::test]
async fn test_renewal_resets_remaining_quota() {
    let h = Harness::new().await;

    h.engine
        .process_webhook_event("subscription.updated", &subscription_event(json!(2), "2026-03-01T00:00:00Z"))
        .await
        .unwrap();
    h.engine.consume_invoice_quota(ORG).await.unwrap();
    h.engine.consume_invoice_quota(ORG).await.unwrap();
    assert!(h.engine.consume_invoice_quota(ORG).await.unwrap_err().is_quota_exceeded());

    h.engine
        .process_webhook_event("subscription.updated", &subscription_event(json!(2), "2026-04-01T00:00:00Z"))
        .await
        .unwrap();

    let quota = h.repository.get_quota_by_org_id(ORG).await.unwrap().unwrap();
    assert_eq!(quota.invoice_count, 2);
}

#[tokio::test]
async fn test_every_wrapping_produces_the_same_state() {
    let body = json!({
        "id": "sub_1",
        "status": "active",
        "external_customer_id": CUSTOMER,
        "product": {"metadata": {"invoice_count": 25}}
    });
    let shapes = [
        body.clone(),
        json!({"object": body.clone()}),
        json!({"data": {"object": body.clone()}}),
        json!({"data": [{"object": body.clone()}]}),
        json!({"data": body.clone()}),
    ];

    for shape in shapes {
        let h = Harness::new().await;
        h.engine.process_webhook_event("subscription.created", &shape).await.unwrap();
        let quota = h.repository.get_quota_by_org_id(ORG).await.unwrap().unwrap();
        assert_eq!(quota.invoice_count, 25, "shape: {shape}");
    }
}

#[tokio::test]
async fn test_no_subscription_status_needs_no_provider_call() {
    let h = Harness::new().await;

    let status = h.engine.get_billing_status(OrgId(99)).await.unwrap();
    assert!(!status.has_active_subscription);
    assert!(!status.can_process_invoices);
    assert_eq!(status.reason, "no active subscription found");

    let quota = h.engine.get_quota_status(OrgId(99)).await.unwrap();
    assert!(!quota.can_process_invoice);

    assert_eq!(h.provider.subscription_calls(), 0);
}

#[tokio::test]
async fn test_meter_grant_for_other_meter_is_ignored() {
    let h = Harness::new().await;
    h.engine
        .process_webhook_event("subscription.created", &subscription_event(json!(50), "2026-03-01T00:00:00Z"))
        .await
        .unwrap();

    h.engine
        .process_webhook_event(
            "meter.grant.updated",
            &json!({"data": {"meter_slug": "storage_gb", "external_customer_id": CUSTOMER, "balance": 3}}),
        )
        .await
        .unwrap();
    assert_eq!(h.repository.get_quota_by_org_id(ORG).await.unwrap().unwrap().invoice_count, 50);

    h.engine
        .process_webhook_event(
            "meter.grant.updated",
            &json!({"data": {"meter_slug": "invoice_processing", "external_customer_id": CUSTOMER, "balance": 3}}),
        )
        .await
        .unwrap();
    assert_eq!(h.repository.get_quota_by_org_id(ORG).await.unwrap().unwrap().invoice_count, 3);
}

#[tokio::test]
async fn test_unknown_event_and_unmapped_customer() {
    let h = Harness::new().await;

    h.engine
        .process_webhook_event("order.created", &json!({"anything": 1}))
        .await
        .unwrap();

    let err = h
        .engine
        .process_webhook_event(
            "subscription.created",
            &json!({"id": "sub_x", "external_customer_id": "cus_stranger"}),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::OrganizationNotMapped(_)));

    let err = h
        .engine
        .process_webhook_event("meter.grant.created", &json!({"external_customer_id": CUSTOMER}))
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::MissingField("meter_slug")));
}
