//! Webhook payload normalizer
//!
//! Providers deliver the same logical event in several shapes: the object may
//! sit at the root, under `object`, under `data.object`, inside `data[]`, or
//! be the `data` envelope itself; field names drift between event types. The
//! normalizer hides all of that behind three canonical shapes.
//!
//! ## Failure policy
//!
//! Only fields that attribute an event to a tenant or carry its only payload
//! are required: the external customer id, and for meter grants the meter slug
//! and available balance. Everything else degrades to zero/empty.

pub mod coerce;
pub mod document;

use serde_json::Value;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::models::{Metadata, ProviderSubscription, SubscriptionStatus};
pub use document::Document;

/// Where the external customer id may live, in lookup order
const CUSTOMER_ID_PATHS: &[&str] = &[
    "external_customer_id",
    "customer_external_id",
    "customer.external_id",
    "customer.id",
    "metadata.organization_id",
    "metadata.external_customer_id",
];

const SUBSCRIPTION_ID_PATHS: &[&str] = &["id", "subscription_id"];
const PERIOD_START_PATHS: &[&str] = &["current_period_start", "current_period_start_at"];
const PERIOD_END_PATHS: &[&str] = &["current_period_end", "current_period_end_at"];
const CANCELED_AT_PATHS: &[&str] = &["canceled_at", "cancelled_at"];

/// Product locations on a subscription; `items[]` is scanned separately
const PRODUCT_PATHS: &[&str] = &["product", "price.product", "plan.product"];
const ITEM_PRODUCT_PATHS: &[&str] = &["product", "price.product"];

const METER_SLUG_PATHS: &[&str] = &["meter_slug", "meter.slug", "meter.name", "slug"];
const BALANCE_PATHS: &[&str] = &[
    "available_balance",
    "balance.available",
    "balance",
    "available_credits",
    "credits.available",
];

const SEAT_KEYS: &[&str] = &["max_seats", "seats"];
const METER_CREDIT_BENEFIT: &str = "meter_credit";

/// Canonical subscription lifecycle event
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubscriptionEventData {
    pub subscription_id: String,
    pub external_customer_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub product_id: String,
    pub product_name: String,
    pub metadata: Metadata,
    pub product_metadata: Metadata,
    pub customer_metadata: Metadata,
    /// Entitlement from product metadata, a meter-credit benefit, or customer metadata
    pub invoice_quota: Option<i32>,
    pub max_seats: Option<i32>,
}

/// Canonical meter credit balance event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterGrantEventData {
    pub meter_slug: String,
    pub external_customer_id: String,
    pub available_credits: i32,
}

/// Canonical customer update event
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CustomerEventData {
    pub external_customer_id: String,
    pub metadata: Metadata,
    pub invoice_quota: Option<i32>,
}

/// Locate the canonical object inside a webhook body
///
/// Tries, in order: the root (unless it is an envelope), `object`,
/// `data.object`, the first `data[]` element with a non-empty `object`, and
/// the `data` envelope itself. The first non-empty object wins.
pub fn unwrap_payload(root: &Value) -> BillingResult<Document<'_>> {
    let doc = Document::new(root);

    if let Value::Object(map) = root {
        let is_envelope = map.contains_key("data")
            || map.get("object").and_then(document::non_empty_object).is_some();
        if !is_envelope && !map.is_empty() {
            return Ok(doc);
        }
    }

    if let Some(found) = doc.child(&["object", "data.object"]) {
        return Ok(found);
    }

    if let Some(found) = doc
        .array("data")
        .iter()
        .find_map(|entry| Document::new(entry).child(&["object"]))
    {
        return Ok(found);
    }

    doc.child(&["data"]).ok_or(BillingError::MissingField("object"))
}

/// Normalize a `subscription.*` payload
pub fn normalize_subscription(
    payload: &Value,
    quota_key: &str,
) -> BillingResult<SubscriptionEventData> {
    let doc = unwrap_payload(payload)?;
    subscription_from_document(doc, quota_key)
}

/// Normalize a `meter.grant.*` / `entitlement.grant.updated` payload
pub fn normalize_meter_grant(payload: &Value) -> BillingResult<MeterGrantEventData> {
    let doc = unwrap_payload(payload)?;

    let external_customer_id = doc
        .first_str(CUSTOMER_ID_PATHS)
        .ok_or(BillingError::MissingField("external_customer_id"))?;

    let meter_slug = doc
        .first_str(METER_SLUG_PATHS)
        .ok_or(BillingError::MissingField("meter_slug"))?;

    let balance = doc
        .first_of(BALANCE_PATHS)
        .filter(|v| !v.is_object())
        .ok_or(BillingError::MissingField("available_balance"))?;

    let available_credits = coerce::to_i32(balance)
        .map_err(|e| BillingError::InvalidField {
            field: "available_balance",
            reason: e.to_string(),
        })?
        .ok_or(BillingError::MissingField("available_balance"))?;

    Ok(MeterGrantEventData {
        meter_slug,
        external_customer_id,
        available_credits,
    })
}

/// Normalize a `customer.updated` payload
pub fn normalize_customer(payload: &Value, quota_key: &str) -> BillingResult<CustomerEventData> {
    let doc = unwrap_payload(payload)?;

    let mut paths = Vec::with_capacity(CUSTOMER_ID_PATHS.len() + 1);
    paths.push("external_id");
    paths.extend_from_slice(CUSTOMER_ID_PATHS);

    let external_customer_id = doc
        .first_str(&paths)
        .ok_or(BillingError::MissingField("external_customer_id"))?;

    let metadata = doc.first_object(&["metadata"]).cloned().unwrap_or_default();
    let invoice_quota = metadata_quota(&metadata, quota_key, "customer metadata");

    Ok(CustomerEventData {
        external_customer_id,
        metadata,
        invoice_quota,
    })
}

/// Build a provider subscription snapshot from an API response body
///
/// The verification path reads the entitlement from the subscription's own
/// metadata first (as an integer or numeric string), then falls back to the
/// product/benefit/customer chain used for webhooks.
pub fn provider_subscription(
    payload: &Value,
    quota_key: &str,
) -> BillingResult<ProviderSubscription> {
    let doc = unwrap_payload(payload)?;
    let data = subscription_from_document(doc, quota_key)?;
    let invoice_quota =
        metadata_quota(&data.metadata, quota_key, "subscription metadata").or(data.invoice_quota);

    Ok(ProviderSubscription {
        id: data.subscription_id,
        external_customer_id: data.external_customer_id,
        status: data.status,
        product_id: data.product_id,
        product_name: data.product_name,
        current_period_start: data.current_period_start,
        current_period_end: data.current_period_end,
        cancel_at_period_end: data.cancel_at_period_end,
        canceled_at: data.canceled_at,
        metadata: data.metadata,
        invoice_quota,
        max_seats: data.max_seats,
    })
}

fn subscription_from_document(
    doc: Document<'_>,
    quota_key: &str,
) -> BillingResult<SubscriptionEventData> {
    let external_customer_id = doc
        .first_str(CUSTOMER_ID_PATHS)
        .ok_or(BillingError::MissingField("external_customer_id"))?;

    let product = find_product(&doc);
    let product_metadata = product
        .and_then(|p| p.first_object(&["metadata"]))
        .cloned()
        .unwrap_or_default();
    let customer_metadata = doc
        .first_object(&["customer.metadata"])
        .cloned()
        .unwrap_or_default();

    let invoice_quota = metadata_quota(&product_metadata, quota_key, "product metadata")
        .or_else(|| product.and_then(meter_credit_units))
        .or_else(|| metadata_quota(&customer_metadata, quota_key, "customer metadata"));

    let max_seats = SEAT_KEYS
        .iter()
        .find_map(|key| metadata_quota(&product_metadata, key, "product metadata"));

    Ok(SubscriptionEventData {
        subscription_id: doc.first_str(SUBSCRIPTION_ID_PATHS).unwrap_or_default(),
        external_customer_id,
        status: doc
            .first_str(&["status"])
            .map(|s| SubscriptionStatus::parse(&s))
            .unwrap_or_default(),
        current_period_start: timestamp(&doc, PERIOD_START_PATHS),
        current_period_end: timestamp(&doc, PERIOD_END_PATHS),
        cancel_at_period_end: doc
            .first_of(&["cancel_at_period_end"])
            .and_then(coerce::to_bool)
            .unwrap_or(false),
        canceled_at: timestamp(&doc, CANCELED_AT_PATHS),
        product_id: product
            .and_then(|p| p.first_str(&["id"]))
            .or_else(|| doc.first_str(&["product_id"]))
            .unwrap_or_default(),
        product_name: product
            .and_then(|p| p.first_str(&["name"]))
            .unwrap_or_default(),
        metadata: doc.first_object(&["metadata"]).cloned().unwrap_or_default(),
        product_metadata,
        customer_metadata,
        invoice_quota,
        max_seats,
    })
}

fn find_product<'a>(doc: &Document<'a>) -> Option<Document<'a>> {
    doc.child(PRODUCT_PATHS).or_else(|| {
        doc.array("items")
            .iter()
            .find_map(|item| Document::new(item).child(ITEM_PRODUCT_PATHS))
    })
}

/// Units granted by the first `meter_credit` benefit on a product
fn meter_credit_units(product: Document<'_>) -> Option<i32> {
    product
        .array("benefits")
        .iter()
        .map(Document::new)
        .filter(|benefit| {
            benefit.first_str(&["type"]).as_deref() == Some(METER_CREDIT_BENEFIT)
        })
        .find_map(|benefit| {
            let units = benefit.first_of(&["properties.units", "metadata.units"])?;
            coerce_optional(units, "benefit units")
        })
}

/// Optional integer from a metadata map; bad values are logged and ignored
fn metadata_quota(metadata: &Metadata, key: &str, source: &'static str) -> Option<i32> {
    metadata.get(key).and_then(|value| coerce_optional(value, source))
}

fn coerce_optional(value: &Value, source: &'static str) -> Option<i32> {
    match coerce::to_i32(value) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(source = source, error = %e, "Ignoring malformed quota value");
            None
        }
    }
}

fn timestamp(doc: &Document<'_>, paths: &[&str]) -> Option<OffsetDateTime> {
    let value = doc.first_of(paths)?;
    match coerce::to_timestamp(value) {
        Ok(ts) => ts,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring malformed timestamp");
            None
        }
    }
}
