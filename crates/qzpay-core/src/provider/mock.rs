//! Mock payment provider
//!
//! Implements every capability against in-memory maps. Payment outcomes are
//! derived from the "current test card number", mirroring how the real
//! gateways exercise their sandbox card tables.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::{
    clock::Clock,
    models::ProviderKind,
    webhooks::HmacSignatureVerifier,
    Error, Result,
};

use super::{
    PaymentProvider, ProviderCheckout, ProviderCheckoutRequest, ProviderCustomer,
    ProviderCustomerRequest, ProviderEvent, ProviderPayment, ProviderPaymentRequest,
    ProviderPaymentStatus, ProviderPrice, ProviderPriceRequest, ProviderRefund,
    ProviderSubscription, ProviderSubscriptionRequest, WebhookVerifier,
};

/// What a test card number resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestCardOutcome {
    Succeeded,
    Declined(&'static str),
    RequiresAction,
    AttachFails,
}

/// The sandbox card table. Unknown numbers succeed.
pub fn outcome_for_card(number: &str) -> TestCardOutcome {
    match number {
        "4242424242424242" => TestCardOutcome::Succeeded,
        "4000000000000002" => TestCardOutcome::Declined("card_declined"),
        "4000000000009995" => TestCardOutcome::Declined("insufficient_funds"),
        "4000000000000069" => TestCardOutcome::Declined("expired_card"),
        "4000000000000127" => TestCardOutcome::Declined("incorrect_cvc"),
        "4000000000000119" => TestCardOutcome::Declined("processing_error"),
        "4000000000003220" => TestCardOutcome::RequiresAction,
        "4000000000000341" => TestCardOutcome::AttachFails,
        _ => TestCardOutcome::Succeeded,
    }
}

/// In-memory mock of the payment provider port
pub struct MockProvider {
    customers: DashMap<String, ProviderCustomer>,
    payments: DashMap<String, ProviderPayment>,
    subscriptions: DashMap<String, ProviderSubscription>,
    checkouts: DashMap<String, ProviderCheckout>,
    prices: DashMap<String, ProviderPrice>,
    // idempotency key -> payment id already created for it
    idempotency: DashMap<String, String>,
    current_card: RwLock<String>,
    seq: AtomicU64,
    verifier: HmacSignatureVerifier,
}

impl MockProvider {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_webhook_secret(clock, None, 300)
    }

    pub fn with_webhook_secret(
        clock: Arc<dyn Clock>,
        secret: Option<String>,
        tolerance_seconds: i64,
    ) -> Self {
        Self {
            customers: DashMap::new(),
            payments: DashMap::new(),
            subscriptions: DashMap::new(),
            checkouts: DashMap::new(),
            prices: DashMap::new(),
            idempotency: DashMap::new(),
            current_card: RwLock::new("4242424242424242".to_string()),
            seq: AtomicU64::new(1),
            verifier: HmacSignatureVerifier::new(secret, tolerance_seconds, clock),
        }
    }

    /// Switch the card the next payments will be attempted with
    pub fn set_test_card(&self, number: impl Into<String>) {
        *self.current_card.write().unwrap() = number.into();
    }

    pub fn current_card(&self) -> String {
        self.current_card.read().unwrap().clone()
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}_mock_{}", prefix, self.seq.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl PaymentProvider for MockProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Mock
    }

    async fn create_customer(
        &self,
        request: ProviderCustomerRequest,
    ) -> Result<ProviderCustomer> {
        let customer = ProviderCustomer {
            id: self.next_id("cus"),
            email: Some(request.email),
        };
        self.customers.insert(customer.id.clone(), customer.clone());
        Ok(customer)
    }

    async fn get_customer(&self, customer_id: &str) -> Result<ProviderCustomer> {
        self.customers
            .get(customer_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::not_found(format!("No such customer: {}", customer_id)))
    }

    async fn create_payment(&self, request: ProviderPaymentRequest) -> Result<ProviderPayment> {
        if request.amount <= 0 {
            return Err(Error::validation("amount must be positive"));
        }

        // Repeating an idempotent create returns the original payment
        if let Some(key) = &request.idempotency_key {
            if let Some(existing_id) = self.idempotency.get(key) {
                if let Some(payment) = self.payments.get(existing_id.value()) {
                    return Ok(payment.clone());
                }
            }
        }

        let card = self.current_card();
        let payment = match outcome_for_card(&card) {
            TestCardOutcome::Succeeded => ProviderPayment {
                id: self.next_id("pi"),
                status: ProviderPaymentStatus::Succeeded,
                amount: request.amount,
                currency: request.currency.clone(),
                failure_code: None,
                failure_message: None,
            },
            TestCardOutcome::Declined(code) => ProviderPayment {
                id: self.next_id("pi"),
                status: ProviderPaymentStatus::Failed,
                amount: request.amount,
                currency: request.currency.clone(),
                failure_code: Some(code.to_string()),
                failure_message: Some(format!("Your card was declined: {}", code)),
            },
            TestCardOutcome::RequiresAction => ProviderPayment {
                id: self.next_id("pi"),
                status: ProviderPaymentStatus::RequiresAction,
                amount: request.amount,
                currency: request.currency.clone(),
                failure_code: None,
                failure_message: None,
            },
            TestCardOutcome::AttachFails => {
                return Err(Error::validation(
                    "The payment method could not be attached to this customer",
                ));
            }
        };

        self.payments.insert(payment.id.clone(), payment.clone());
        if let Some(key) = request.idempotency_key {
            self.idempotency.insert(key, payment.id.clone());
        }
        Ok(payment)
    }

    async fn capture_payment(
        &self,
        payment_id: &str,
        amount: Option<i64>,
    ) -> Result<ProviderPayment> {
        let mut payment = self
            .payments
            .get_mut(payment_id)
            .ok_or_else(|| Error::not_found(format!("No such payment: {}", payment_id)))?;

        if let Some(amount) = amount {
            payment.amount = amount;
        }
        payment.status = ProviderPaymentStatus::Succeeded;
        Ok(payment.clone())
    }

    async fn refund_payment(
        &self,
        payment_id: &str,
        amount: Option<i64>,
        _reason: Option<&str>,
    ) -> Result<ProviderRefund> {
        let payment = self
            .payments
            .get(payment_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::not_found(format!("No such payment: {}", payment_id)))?;

        if payment.status != ProviderPaymentStatus::Succeeded
            && payment.status != ProviderPaymentStatus::Refunded
        {
            return Err(Error::validation(format!(
                "Payment {} cannot be refunded in status {:?}",
                payment_id, payment.status
            )));
        }

        let refund_amount = amount.unwrap_or(payment.amount);
        if refund_amount > payment.amount {
            return Err(Error::validation("refund exceeds payment amount"));
        }

        if refund_amount == payment.amount {
            if let Some(mut entry) = self.payments.get_mut(payment_id) {
                entry.status = ProviderPaymentStatus::Refunded;
            }
        }

        Ok(ProviderRefund {
            id: self.next_id("re"),
            payment_id: payment_id.to_string(),
            amount: refund_amount,
            status: ProviderPaymentStatus::Succeeded,
        })
    }

    async fn cancel_payment(&self, payment_id: &str) -> Result<ProviderPayment> {
        let mut payment = self
            .payments
            .get_mut(payment_id)
            .ok_or_else(|| Error::not_found(format!("No such payment: {}", payment_id)))?;

        if payment.status == ProviderPaymentStatus::Succeeded {
            return Err(Error::validation("cannot cancel a succeeded payment"));
        }
        payment.status = ProviderPaymentStatus::Canceled;
        Ok(payment.clone())
    }

    async fn get_payment(&self, payment_id: &str) -> Result<ProviderPayment> {
        self.payments
            .get(payment_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::not_found(format!("No such payment: {}", payment_id)))
    }

    async fn create_subscription(
        &self,
        request: ProviderSubscriptionRequest,
    ) -> Result<ProviderSubscription> {
        if !self.customers.contains_key(&request.customer_id) {
            return Err(Error::not_found(format!(
                "No such customer: {}",
                request.customer_id
            )));
        }
        let subscription = ProviderSubscription {
            id: self.next_id("sub"),
            status: if request.trial_days.unwrap_or(0) > 0 {
                "trialing".to_string()
            } else {
                "active".to_string()
            },
            current_period_end: None,
        };
        self.subscriptions
            .insert(subscription.id.clone(), subscription.clone());
        Ok(subscription)
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> Result<ProviderSubscription> {
        let mut subscription = self
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| {
                Error::not_found(format!("No such subscription: {}", subscription_id))
            })?;
        subscription.status = "canceled".to_string();
        Ok(subscription.clone())
    }

    async fn create_checkout_session(
        &self,
        request: ProviderCheckoutRequest,
    ) -> Result<ProviderCheckout> {
        if request.quantity < 1 {
            return Err(Error::validation("quantity must be at least 1"));
        }
        let id = self.next_id("cs");
        let checkout = ProviderCheckout {
            url: Some(format!("https://mock.qzpay.test/checkout/{}", id)),
            id,
            status: "open".to_string(),
        };
        self.checkouts.insert(checkout.id.clone(), checkout.clone());
        Ok(checkout)
    }

    async fn create_price(&self, request: ProviderPriceRequest) -> Result<ProviderPrice> {
        let price = ProviderPrice {
            id: self.next_id("price"),
            currency: request.currency,
            unit_amount: request.unit_amount,
        };
        self.prices.insert(price.id.clone(), price.clone());
        Ok(price)
    }

    fn webhooks(&self) -> &dyn WebhookVerifier {
        &self.verifier
    }
}

// Re-exported for hosts that want to build synthetic events in tests
pub fn synthetic_event(id: &str, event_type: &str, data: serde_json::Value) -> ProviderEvent {
    ProviderEvent {
        id: id.to_string(),
        event_type: event_type.to_string(),
        data,
        created: chrono::Utc::now(),
    }
}
