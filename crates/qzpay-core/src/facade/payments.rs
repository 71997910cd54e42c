//! Payment operations and the engine's provider-backed charge processor
//!
//! A declined one-off payment is recorded as a failed `Payment` with the
//! provider's code and surfaced through the event stream, never as a
//! propagated error. All provider calls carry idempotency keys; repeating a
//! keyed create returns the original record.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;
use validator::Validate;

use crate::{
    clock::Clock,
    common::{Page, Pagination},
    events::{BillingEvent, BillingEventType, EventEmitter},
    lifecycle::{ChargeOutcome, ChargeRequest, PaymentMethodResolver, PaymentProcessor},
    models::{
        CreatePaymentRequest, Payment, PaymentMethod, PaymentStatus, Refund, RefundStatus,
    },
    provider::{PaymentProvider, ProviderPaymentRequest, ProviderPaymentStatus},
    storage::Storage,
    Error, Result,
};

use super::QzPay;

fn map_provider_status(status: ProviderPaymentStatus) -> PaymentStatus {
    match status {
        ProviderPaymentStatus::Pending => PaymentStatus::Processing,
        ProviderPaymentStatus::Succeeded => PaymentStatus::Succeeded,
        ProviderPaymentStatus::Failed => PaymentStatus::Failed,
        ProviderPaymentStatus::RequiresAction => PaymentStatus::RequiresAction,
        ProviderPaymentStatus::Canceled => PaymentStatus::Canceled,
        ProviderPaymentStatus::Refunded => PaymentStatus::Refunded,
    }
}

impl QzPay {
    /// Charge a customer. Declines produce a recorded failed payment and a
    /// `payment.failed` event.
    pub async fn create_payment(&self, request: CreatePaymentRequest) -> Result<Payment> {
        request
            .validate()
            .map_err(|e| Error::validation(e.to_string()))?;

        // Replays of a keyed operation return the original payment
        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = self.storage().payments().find_by_idempotency_key(key).await? {
                return Ok(existing);
            }
        }

        let customer = self.get_customer(request.customer_id).await?;
        let provider_kind = self.provider().kind();
        let provider_customer_id = customer.provider_customer_ids.get(&provider_kind).cloned();

        let payment_method = match request.payment_method_id {
            Some(id) => Some(
                self.storage()
                    .payment_methods()
                    .find_by_id(id)
                    .await?
                    .ok_or_else(|| Error::not_found(format!("Payment method {} not found", id)))?,
            ),
            None => {
                self.storage()
                    .payment_methods()
                    .default_for_customer(customer.id)
                    .await?
            }
        };

        let provider_result = self
            .provider()
            .create_payment(ProviderPaymentRequest {
                amount: request.amount,
                currency: request.currency.clone(),
                customer_id: provider_customer_id,
                payment_method_id: payment_method
                    .as_ref()
                    .and_then(|m| m.provider_method_ids.get(&provider_kind).cloned()),
                description: None,
                idempotency_key: request.idempotency_key.clone(),
                metadata: serde_json::json!({
                    "customer_id": customer.id,
                    "subscription_id": request.subscription_id,
                }),
            })
            .await?;

        let now = self.now();
        let status = map_provider_status(provider_result.status);
        let payment = Payment {
            id: Uuid::new_v4(),
            customer_id: customer.id,
            subscription_id: request.subscription_id,
            amount: request.amount,
            currency: request.currency,
            base_amount: None,
            base_currency: None,
            exchange_rate: None,
            status,
            provider: provider_kind,
            provider_payment_id: Some(provider_result.id),
            payment_method_id: payment_method.map(|m| m.id),
            refunded_amount: 0,
            failure_code: provider_result.failure_code,
            failure_message: provider_result.failure_message,
            idempotency_key: request.idempotency_key,
            metadata: request.metadata,
            livemode: self.livemode(),
            created_at: now,
            updated_at: now,
        };

        let payment = self.storage().payments().create(payment).await?;

        let event_type = match payment.status {
            PaymentStatus::Succeeded => Some(BillingEventType::PaymentSucceeded),
            PaymentStatus::Failed => Some(BillingEventType::PaymentFailed),
            _ => None,
        };
        if let Some(event_type) = event_type {
            self.emit(
                BillingEvent::new(event_type, now)
                    .with_customer(payment.customer_id)
                    .with_data(serde_json::json!({
                        "payment_id": payment.id,
                        "amount": payment.amount,
                        "currency": payment.currency,
                        "failure_code": payment.failure_code,
                    })),
            );
        }

        Ok(payment)
    }

    /// Refund a succeeded payment, fully or partially
    pub async fn refund_payment(
        &self,
        payment_id: Uuid,
        amount: Option<i64>,
        reason: Option<String>,
    ) -> Result<Refund> {
        let mut payment = self
            .storage()
            .payments()
            .find_by_id(payment_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("Payment {} not found", payment_id)))?;

        if payment.status != PaymentStatus::Succeeded {
            return Err(Error::validation(format!(
                "Payment {} cannot be refunded in its current status",
                payment_id
            )));
        }

        let refund_amount = amount.unwrap_or(payment.amount - payment.refunded_amount);
        if refund_amount <= 0 {
            return Err(Error::validation("refund amount must be positive"));
        }
        if payment.refunded_amount + refund_amount > payment.amount {
            return Err(Error::validation("refund exceeds the remaining amount"));
        }

        let provider_payment_id = payment
            .provider_payment_id
            .clone()
            .ok_or_else(|| Error::validation("Payment has no provider payment id"))?;

        let provider_refund = self
            .provider()
            .refund_payment(&provider_payment_id, Some(refund_amount), reason.as_deref())
            .await?;

        let now = self.now();
        payment.refunded_amount += refund_amount;
        if payment.is_fully_refunded() {
            payment.status = PaymentStatus::Refunded;
        }
        let payment = self.storage().payments().save(payment).await?;

        let refund = Refund {
            id: Uuid::new_v4(),
            payment_id,
            amount: refund_amount,
            currency: payment.currency.clone(),
            status: RefundStatus::Succeeded,
            reason,
            provider_refund_id: Some(provider_refund.id),
            created_at: now,
        };
        let refund = self.storage().refunds().create(refund).await?;

        self.audit("payment", payment_id, "refunded", None, serde_json::to_value(&refund).ok())
            .await;
        self.emit(
            BillingEvent::new(BillingEventType::PaymentRefunded, now)
                .with_customer(payment.customer_id)
                .with_data(serde_json::json!({
                    "payment_id": payment_id,
                    "refund_id": refund.id,
                    "amount": refund_amount,
                })),
        );

        Ok(refund)
    }

    pub async fn get_payment(&self, id: Uuid) -> Result<Payment> {
        self.storage()
            .payments()
            .find_by_id(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("Payment {} not found", id)))
    }

    pub async fn list_customer_payments(
        &self,
        customer_id: Uuid,
        pagination: Pagination,
    ) -> Result<Page<Payment>> {
        self.storage()
            .payments()
            .list_by_customer(customer_id, pagination)
            .await
    }

    // --- Payment methods ---

    pub async fn add_payment_method(&self, method: PaymentMethod) -> Result<PaymentMethod> {
        // Customer must exist and not be deleted
        self.get_customer(method.customer_id).await?;
        self.storage().payment_methods().create(method).await
    }

    /// Make a payment method the customer's default, atomically flipping
    /// every other method off
    pub async fn set_default_payment_method(
        &self,
        customer_id: Uuid,
        payment_method_id: Uuid,
    ) -> Result<PaymentMethod> {
        self.storage()
            .payment_methods()
            .set_default(customer_id, payment_method_id)
            .await
    }

    pub async fn list_payment_methods(&self, customer_id: Uuid) -> Result<Vec<PaymentMethod>> {
        self.storage()
            .payment_methods()
            .list_by_customer(customer_id)
            .await
    }

    pub async fn detach_payment_method(&self, id: Uuid) -> Result<()> {
        let removed = self.storage().payment_methods().delete(id).await?;
        if !removed {
            return Err(Error::not_found(format!("Payment method {} not found", id)));
        }
        Ok(())
    }
}

/// The lifecycle engine's payment callback backed by the provider port.
/// Charges carry the subscription id and charge type in provider metadata
/// and are recorded as `Payment` rows before the outcome returns.
pub struct ProviderChargeProcessor {
    storage: Arc<dyn Storage>,
    provider: Arc<dyn PaymentProvider>,
    events: Arc<EventEmitter>,
    clock: Arc<dyn Clock>,
    livemode: bool,
}

impl ProviderChargeProcessor {
    pub fn new(
        storage: Arc<dyn Storage>,
        provider: Arc<dyn PaymentProvider>,
        events: Arc<EventEmitter>,
        clock: Arc<dyn Clock>,
        livemode: bool,
    ) -> Self {
        Self {
            storage,
            provider,
            events,
            clock,
            livemode,
        }
    }
}

#[async_trait]
impl PaymentProcessor for ProviderChargeProcessor {
    async fn process(&self, request: ChargeRequest) -> Result<ChargeOutcome> {
        // A keyed charge repeated after a crash returns the recorded outcome
        if let Some(existing) = self
            .storage
            .payments()
            .find_by_idempotency_key(&request.idempotency_key)
            .await?
        {
            return Ok(ChargeOutcome {
                success: existing.status == PaymentStatus::Succeeded,
                payment_id: Some(existing.id),
                error: existing.failure_message,
            });
        }

        let provider_kind = self.provider.kind();
        let customer = self.storage.customers().find_by_id(request.customer_id).await?;
        let provider_customer_id = customer
            .as_ref()
            .and_then(|c| c.provider_customer_ids.get(&provider_kind).cloned());
        let provider_method_id = self
            .storage
            .payment_methods()
            .find_by_id(request.payment_method_id)
            .await?
            .and_then(|m| m.provider_method_ids.get(&provider_kind).cloned());

        let provider_result = self
            .provider
            .create_payment(ProviderPaymentRequest {
                amount: request.amount,
                currency: request.currency.clone(),
                customer_id: provider_customer_id,
                payment_method_id: provider_method_id,
                description: Some(format!(
                    "{} for subscription {}",
                    request.charge_type.as_str(),
                    request.subscription_id
                )),
                idempotency_key: Some(request.idempotency_key.clone()),
                metadata: serde_json::json!({
                    "subscription_id": request.subscription_id,
                    "type": request.charge_type.as_str(),
                }),
            })
            .await?;

        let now = self.clock.now();
        let status = map_provider_status(provider_result.status);
        let payment = Payment {
            id: Uuid::new_v4(),
            customer_id: request.customer_id,
            subscription_id: Some(request.subscription_id),
            amount: request.amount,
            currency: request.currency,
            base_amount: None,
            base_currency: None,
            exchange_rate: None,
            status,
            provider: provider_kind,
            provider_payment_id: Some(provider_result.id),
            payment_method_id: Some(request.payment_method_id),
            refunded_amount: 0,
            failure_code: provider_result.failure_code.clone(),
            failure_message: provider_result.failure_message.clone(),
            idempotency_key: Some(request.idempotency_key),
            metadata: serde_json::json!({ "type": request.charge_type.as_str() }),
            livemode: self.livemode,
            created_at: now,
            updated_at: now,
        };
        let payment = self.storage.payments().create(payment).await?;

        let succeeded = status == PaymentStatus::Succeeded;
        let event_type = if succeeded {
            BillingEventType::PaymentSucceeded
        } else {
            BillingEventType::PaymentFailed
        };
        self.events.emit(
            &BillingEvent::new(event_type, now)
                .with_customer(request.customer_id)
                .with_subscription(request.subscription_id)
                .with_data(serde_json::json!({
                    "payment_id": payment.id,
                    "amount": payment.amount,
                    "failure_code": payment.failure_code,
                })),
        );

        Ok(ChargeOutcome {
            success: succeeded,
            payment_id: Some(payment.id),
            error: provider_result
                .failure_message
                .or(provider_result.failure_code),
        })
    }
}

/// Default payment method lookup against the storage port
pub struct StoragePaymentMethodResolver {
    storage: Arc<dyn Storage>,
}

impl StoragePaymentMethodResolver {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl PaymentMethodResolver for StoragePaymentMethodResolver {
    async fn default_for(&self, customer_id: Uuid) -> Result<Option<PaymentMethod>> {
        self.storage
            .payment_methods()
            .default_for_customer(customer_id)
            .await
    }
}
