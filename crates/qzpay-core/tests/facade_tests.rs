//! Façade-level flows: customer CRUD and events, promo redemption caps,
//! entitlement monotonicity, limits, payments and refunds, invoices,
//! webhook ingress, and the event subscription contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use uuid::Uuid;

use qzpay_core::clock::FixedClock;
use qzpay_core::discounts::DiscountContext;
use qzpay_core::models::promo::CreatePromoCodeRequest;
use qzpay_core::models::{
    CreateCustomerRequest, CreatePaymentRequest, CustomerPreferences, DiscountKind,
    GrantSource, PaymentStatus, StackingMode, UpdateCustomerRequest,
};
use qzpay_core::provider::{MockProvider, ProviderEvent};
use qzpay_core::storage::MemoryStorage;
use qzpay_core::webhooks::{compute_signature, WebhookHandler};
use qzpay_core::{
    BillingEventType, Clock, Config, Error, HealthStatus, Pagination, QzPay, Result, Storage,
};

const WEBHOOK_SECRET: &str = "whsec_facade_tests";

struct TestHarness {
    pay: QzPay,
    provider: Arc<MockProvider>,
    clock: Arc<FixedClock>,
}

fn harness() -> TestHarness {
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap(),
    ));
    let storage = Arc::new(MemoryStorage::new(clock.clone()));
    let provider = Arc::new(MockProvider::with_webhook_secret(
        clock.clone(),
        Some(WEBHOOK_SECRET.to_string()),
        300,
    ));

    let mut config = Config::default();
    config.webhooks.secret = Some(WEBHOOK_SECRET.to_string());

    let pay = QzPay::with_clock(storage, provider.clone(), config, clock.clone());
    TestHarness { pay, provider, clock }
}

fn customer_request(email: &str) -> CreateCustomerRequest {
    CreateCustomerRequest {
        external_id: format!("ext-{}", email),
        email: email.to_string(),
        name: None,
        phone: None,
        preferences: CustomerPreferences::default(),
        billing_address: None,
        shipping_address: None,
        tax_id: None,
        tax_id_type: None,
        metadata: serde_json::Value::Null,
    }
}

#[tokio::test]
async fn customer_crud_and_events() {
    let harness = harness();
    let created_count = Arc::new(AtomicUsize::new(0));
    let count_clone = created_count.clone();
    harness.pay.on(BillingEventType::CustomerCreated, move |_| {
        count_clone.fetch_add(1, Ordering::SeqCst);
    });

    let customer = harness
        .pay
        .create_customer(customer_request("alice@example.com"))
        .await
        .unwrap();
    assert_eq!(created_count.load(Ordering::SeqCst), 1);
    // The mock provider registered the customer
    assert!(!customer.provider_customer_ids.is_empty());

    // Duplicate email conflicts
    let duplicate = harness
        .pay
        .create_customer(customer_request("alice@example.com"))
        .await;
    assert!(matches!(duplicate, Err(Error::Conflict(_))));

    // Lookup by external id and update
    let fetched = harness
        .pay
        .get_customer_by_external_id("ext-alice@example.com")
        .await
        .unwrap();
    assert_eq!(fetched.id, customer.id);

    let updated = harness
        .pay
        .update_customer(
            customer.id,
            UpdateCustomerRequest {
                name: Some("Alice".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.name.as_deref(), Some("Alice"));

    // Soft delete hides the customer
    harness.pay.delete_customer(customer.id).await.unwrap();
    assert!(harness.pay.get_customer(customer.id).await.is_err());
}

#[tokio::test]
async fn invalid_email_rejected() {
    let harness = harness();
    let result = harness
        .pay
        .create_customer(customer_request("not-an-email"))
        .await;
    assert!(matches!(result, Err(Error::Validation(_))));
}

#[tokio::test]
async fn promo_redemption_respects_caps() {
    let harness = harness();

    harness
        .pay
        .create_promo_code(CreatePromoCodeRequest {
            code: "launch20".to_string(),
            description: None,
            discount_type: DiscountKind::Percentage,
            discount_value: 20,
            currency: None,
            stacking_mode: StackingMode::None,
            conditions: vec![],
            max_redemptions: Some(2),
            max_redemptions_per_customer: Some(1),
            applicable_plan_ids: vec![],
            applicable_product_ids: vec![],
            valid_from: None,
            valid_until: None,
        })
        .await
        .unwrap();

    let ctx = DiscountContext::new("USD", 10000, harness.clock.now());
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let carol = Uuid::new_v4();

    // Codes are stored uppercase and matched case-insensitively
    let result = harness
        .pay
        .redeem_promo_code("LAUNCH20", alice, &ctx)
        .await
        .unwrap();
    assert_eq!(result.discount_amount, 2000);
    assert_eq!(result.final_amount, 8000);

    // Same customer again: per-customer cap
    assert!(matches!(
        harness.pay.redeem_promo_code("LAUNCH20", alice, &ctx).await,
        Err(Error::Forbidden(_))
    ));

    harness.pay.redeem_promo_code("LAUNCH20", bob, &ctx).await.unwrap();

    // Global cap reached
    assert!(matches!(
        harness.pay.redeem_promo_code("LAUNCH20", carol, &ctx).await,
        Err(Error::Conflict(_))
    ));

    let promo = harness.pay.get_promo_code("LAUNCH20").await.unwrap();
    assert_eq!(promo.current_redemptions, 2);
    assert_eq!(promo.remaining_redemptions(), Some(0));
}

#[tokio::test]
async fn entitlement_regrant_never_shortens() {
    let harness = harness();
    let customer = harness
        .pay
        .create_customer(customer_request("grants@example.com"))
        .await
        .unwrap();

    harness
        .pay
        .define_entitlement("premium", "Premium access", None)
        .await
        .unwrap();

    let now = harness.clock.now();
    let far = now + Duration::days(60);
    let near = now + Duration::days(30);

    let grant = harness
        .pay
        .grant_entitlement(customer.id, "premium", Some(far), GrantSource::Manual, None)
        .await
        .unwrap();
    assert_eq!(grant.expires_at, Some(far));

    // Re-granting with an earlier expiry keeps the later one
    let grant = harness
        .pay
        .grant_entitlement(customer.id, "premium", Some(near), GrantSource::Promotion, None)
        .await
        .unwrap();
    assert_eq!(grant.expires_at, Some(far));

    // No expiry wins over any finite expiry
    let grant = harness
        .pay
        .grant_entitlement(customer.id, "premium", None, GrantSource::Manual, None)
        .await
        .unwrap();
    assert_eq!(grant.expires_at, None);

    assert!(harness.pay.check_entitlement(customer.id, "premium").await.unwrap());

    harness.pay.revoke_entitlement(customer.id, "premium").await.unwrap();
    assert!(!harness.pay.check_entitlement(customer.id, "premium").await.unwrap());
}

#[tokio::test]
async fn limits_enforce_quota() {
    let harness = harness();
    let customer = harness
        .pay
        .create_customer(customer_request("limits@example.com"))
        .await
        .unwrap();

    harness.pay.define_limit("api_calls", "API calls", 100).await.unwrap();
    harness
        .pay
        .set_customer_limit(customer.id, "api_calls", 3, None)
        .await
        .unwrap();

    assert!(harness.pay.check_limit(customer.id, "api_calls").await.unwrap());

    harness.pay.consume_limit(customer.id, "api_calls", 2).await.unwrap();
    let limit = harness.pay.consume_limit(customer.id, "api_calls", 1).await.unwrap();
    assert_eq!(limit.current_value, 3);
    assert!(!limit.is_allowed());

    // Exhausted
    assert!(matches!(
        harness.pay.consume_limit(customer.id, "api_calls", 1).await,
        Err(Error::Forbidden(_))
    ));

    harness.pay.reset_limit(customer.id, "api_calls").await.unwrap();
    assert!(harness.pay.check_limit(customer.id, "api_calls").await.unwrap());
}

#[tokio::test]
async fn declined_payment_is_recorded_not_raised() {
    let harness = harness();
    let customer = harness
        .pay
        .create_customer(customer_request("decline@example.com"))
        .await
        .unwrap();

    let failed_events = Arc::new(AtomicUsize::new(0));
    let count_clone = failed_events.clone();
    harness.pay.on(BillingEventType::PaymentFailed, move |_| {
        count_clone.fetch_add(1, Ordering::SeqCst);
    });

    harness.provider.set_test_card("4000000000000002");
    let payment = harness
        .pay
        .create_payment(CreatePaymentRequest {
            customer_id: customer.id,
            subscription_id: None,
            amount: 5000,
            currency: "USD".to_string(),
            payment_method_id: None,
            idempotency_key: None,
            metadata: serde_json::Value::Null,
        })
        .await
        .unwrap();

    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(payment.failure_code.as_deref(), Some("card_declined"));
    assert_eq!(failed_events.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn idempotent_payment_creation() {
    let harness = harness();
    let customer = harness
        .pay
        .create_customer(customer_request("idem@example.com"))
        .await
        .unwrap();

    let request = CreatePaymentRequest {
        customer_id: customer.id,
        subscription_id: None,
        amount: 1200,
        currency: "USD".to_string(),
        payment_method_id: None,
        idempotency_key: Some("op-42".to_string()),
        metadata: serde_json::Value::Null,
    };

    let first = harness.pay.create_payment(request.clone()).await.unwrap();
    let second = harness.pay.create_payment(request).await.unwrap();
    assert_eq!(first.id, second.id);
}

#[tokio::test]
async fn refund_updates_payment_and_emits() {
    let harness = harness();
    let customer = harness
        .pay
        .create_customer(customer_request("refund@example.com"))
        .await
        .unwrap();

    let refunded_events = Arc::new(AtomicUsize::new(0));
    let count_clone = refunded_events.clone();
    harness.pay.on(BillingEventType::PaymentRefunded, move |_| {
        count_clone.fetch_add(1, Ordering::SeqCst);
    });

    let payment = harness
        .pay
        .create_payment(CreatePaymentRequest {
            customer_id: customer.id,
            subscription_id: None,
            amount: 8000,
            currency: "USD".to_string(),
            payment_method_id: None,
            idempotency_key: None,
            metadata: serde_json::Value::Null,
        })
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Succeeded);

    // Partial refund keeps the payment succeeded
    let refund = harness
        .pay
        .refund_payment(payment.id, Some(3000), Some("requested".to_string()))
        .await
        .unwrap();
    assert_eq!(refund.amount, 3000);
    let after = harness.pay.get_payment(payment.id).await.unwrap();
    assert_eq!(after.status, PaymentStatus::Succeeded);
    assert_eq!(after.refunded_amount, 3000);

    // Refunding the rest flips the status
    harness.pay.refund_payment(payment.id, None, None).await.unwrap();
    let after = harness.pay.get_payment(payment.id).await.unwrap();
    assert_eq!(after.status, PaymentStatus::Refunded);
    assert!(after.is_fully_refunded());

    assert_eq!(refunded_events.load(Ordering::SeqCst), 2);

    // Over-refunding is rejected
    assert!(harness.pay.refund_payment(payment.id, Some(1), None).await.is_err());
}

#[tokio::test]
async fn invoice_payment_emits_invoice_paid() {
    let harness = harness();
    let customer = harness
        .pay
        .create_customer(customer_request("invoice@example.com"))
        .await
        .unwrap();

    let paid_events = Arc::new(AtomicUsize::new(0));
    let count_clone = paid_events.clone();
    harness.pay.on(BillingEventType::InvoicePaid, move |_| {
        count_clone.fetch_add(1, Ordering::SeqCst);
    });

    let invoice = harness
        .pay
        .create_invoice(
            customer.id,
            None,
            None,
            vec![("Consulting".to_string(), 2, 5000)],
            1000,
            500,
        )
        .await
        .unwrap();
    assert_eq!(invoice.subtotal, 10000);
    assert_eq!(invoice.total, 9500);
    assert!(invoice.number.starts_with("INV-"));

    harness.pay.pay_invoice(invoice.id, 4000).await.unwrap();
    assert_eq!(paid_events.load(Ordering::SeqCst), 0);

    let paid = harness.pay.pay_invoice(invoice.id, 5500).await.unwrap();
    assert!(paid.paid_at.is_some());
    assert_eq!(paid_events.load(Ordering::SeqCst), 1);
}

struct RecordingHandler {
    calls: AtomicUsize,
    fail: bool,
}

#[async_trait]
impl WebhookHandler for RecordingHandler {
    async fn handle(&self, _event: &ProviderEvent) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(Error::internal("downstream unavailable"))
        } else {
            Ok(())
        }
    }
}

fn signed_webhook(event_id: &str, event_type: &str, ts: i64) -> (Vec<u8>, String) {
    let body = serde_json::json!({
        "id": event_id,
        "type": event_type,
        "data": { "id": event_id },
        "created": ts,
    });
    let signature = compute_signature(WEBHOOK_SECRET, event_id, ts);
    (
        serde_json::to_vec(&body).unwrap(),
        format!("ts={},v1={}", ts, signature),
    )
}

#[tokio::test]
async fn webhook_flow_verifies_dispatches_and_dedupes() {
    let harness = harness();
    let handler = Arc::new(RecordingHandler {
        calls: AtomicUsize::new(0),
        fail: false,
    });
    harness
        .pay
        .register_webhook_handler("payment.updated", handler.clone())
        .await;

    let received = Arc::new(AtomicUsize::new(0));
    let count_clone = received.clone();
    harness.pay.on(BillingEventType::WebhookReceived, move |_| {
        count_clone.fetch_add(1, Ordering::SeqCst);
    });

    let ts = harness.clock.now().timestamp();
    let (body, signature) = signed_webhook("evt_100", "payment.updated", ts);

    let outcome = harness.pay.handle_webhook(&body, &signature).await.unwrap();
    assert!(outcome.processed);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(received.load(Ordering::SeqCst), 1);

    // Same event id again: a no-op
    let outcome = harness.pay.handle_webhook(&body, &signature).await.unwrap();
    assert!(outcome.duplicate);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn webhook_replay_and_tamper_rejected() {
    let harness = harness();

    // Valid HMAC over a timestamp 600s old with tolerance 300
    let old_ts = harness.clock.now().timestamp() - 600;
    let (body, signature) = signed_webhook("evt_replay", "payment.updated", old_ts);
    let result = harness.pay.handle_webhook(&body, &signature).await;
    assert!(matches!(result, Err(Error::WebhookReplayRejected(_))));

    // Fresh timestamp but body tampered after signing
    let ts = harness.clock.now().timestamp();
    let (_, signature) = signed_webhook("evt_tamper", "payment.updated", ts);
    let tampered = serde_json::json!({
        "id": "evt_tamper",
        "type": "payment.updated",
        "data": { "id": "evt_tampex" },
        "created": ts,
    });
    let result = harness
        .pay
        .handle_webhook(&serde_json::to_vec(&tampered).unwrap(), &signature)
        .await;
    assert!(matches!(result, Err(Error::InvalidSignature(_))));
}

#[tokio::test]
async fn failing_webhook_handler_dead_letters() {
    let harness = harness();
    harness
        .pay
        .register_webhook_handler(
            "payment.updated",
            Arc::new(RecordingHandler {
                calls: AtomicUsize::new(0),
                fail: true,
            }),
        )
        .await;

    let ts = harness.clock.now().timestamp();
    let (body, signature) = signed_webhook("evt_dead", "payment.updated", ts);

    let outcome = harness.pay.handle_webhook(&body, &signature).await.unwrap();
    assert!(!outcome.processed);
    assert!(outcome.error.is_some());

    let dead = harness.pay.dead_lettered_webhooks().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].provider_event_id, "evt_dead");
}

#[tokio::test]
async fn unknown_webhook_type_acknowledged_without_handler() {
    let harness = harness();
    let ts = harness.clock.now().timestamp();
    let (body, signature) = signed_webhook("evt_unknown", "something.new", ts);

    // No error: the HTTP layer still returns 200 for unknown types
    let outcome = harness.pay.handle_webhook(&body, &signature).await.unwrap();
    assert!(!outcome.processed);
    assert_eq!(outcome.error.as_deref(), Some("No handler registered"));
}

#[tokio::test]
async fn pagination_covers_all_customers_exactly_once() {
    let harness = harness();
    for i in 0..7 {
        harness.clock.advance(Duration::seconds(1));
        harness
            .pay
            .create_customer(customer_request(&format!("page{}@example.com", i)))
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    let mut offset = 0;
    loop {
        let page = harness
            .pay
            .list_customers(Pagination::new(3, offset))
            .await
            .unwrap();
        assert_eq!(page.total, 7);
        seen.extend(page.data.iter().map(|c| c.id));
        if !page.has_more {
            break;
        }
        offset += 3;
    }
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 7);
}

#[tokio::test]
async fn health_reports_healthy_mock_stack() {
    let harness = harness();
    let health = harness.pay.health().await;
    assert_eq!(health.status, HealthStatus::Healthy);
}

#[tokio::test]
async fn close_releases_event_subscriptions() {
    let harness = harness();
    let calls = Arc::new(AtomicUsize::new(0));
    let count_clone = calls.clone();
    harness.pay.on(BillingEventType::CustomerCreated, move |_| {
        count_clone.fetch_add(1, Ordering::SeqCst);
    });

    harness.pay.close().await;

    harness
        .pay
        .create_customer(customer_request("after-close@example.com"))
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn once_subscription_contract() {
    let harness = harness();
    let calls = Arc::new(AtomicUsize::new(0));
    let count_clone = calls.clone();
    harness.pay.once(BillingEventType::CustomerCreated, move |_| {
        count_clone.fetch_add(1, Ordering::SeqCst);
    });

    harness.pay.create_customer(customer_request("one@example.com")).await.unwrap();
    harness.pay.create_customer(customer_request("two@example.com")).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn mrr_report_counts_active_subscriptions() {
    let harness = harness();
    let customer = harness
        .pay
        .create_customer(customer_request("mrr@example.com"))
        .await
        .unwrap();

    let plan = harness
        .pay
        .create_plan(qzpay_core::models::CreatePlanRequest {
            name: "metrics-plan".to_string(),
            description: None,
            features: vec![],
            entitlements: vec![],
            limit_defaults: HashMap::new(),
            metadata: serde_json::Value::Null,
        })
        .await
        .unwrap();
    harness
        .pay
        .create_price(
            plan.id,
            None,
            1200,
            qzpay_core::models::BillingInterval::Month,
            1,
            None,
        )
        .await
        .unwrap();

    harness
        .pay
        .create_subscription(qzpay_core::models::CreateSubscriptionRequest {
            customer_id: customer.id,
            plan_id: plan.id,
            price_id: None,
            quantity: 3,
            trial_days: None,
            metadata: serde_json::Value::Null,
        })
        .await
        .unwrap();

    let report = harness.pay.mrr_report().await.unwrap();
    assert_eq!(report.get("USD"), Some(&3600));
}

#[tokio::test]
async fn audit_log_records_mutations() {
    let harness = harness();
    let customer = harness
        .pay
        .create_customer(customer_request("audit@example.com"))
        .await
        .unwrap();

    let page = harness
        .pay
        .storage()
        .audit_logs()
        .list_for_entity("customer", &customer.id.to_string(), Pagination::default())
        .await
        .unwrap();
    assert_eq!(page.data.len(), 1);
    assert_eq!(page.data[0].action, "created");
}
