//! Payment provider port
//!
//! A unified interface for all payment operations regardless of the
//! provider. The engine interacts with this port only; provider SDK details
//! never leak past the adapter. Each capability returns a small
//! provider-agnostic record carrying the minimum the core needs to advance
//! state.

pub mod mercadopago;
pub mod mock;
pub mod stripe;

pub use mercadopago::MercadoPagoProvider;
pub use mock::{MockProvider, TestCardOutcome};
pub use stripe::StripeProvider;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{models::ProviderKind, Result};

/// Provider-side payment status, collapsed to what the core acts on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderPaymentStatus {
    Pending,
    Succeeded,
    Failed,
    RequiresAction,
    Canceled,
    Refunded,
}

/// Request to create a customer at the provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCustomerRequest {
    pub email: String,
    pub name: Option<String>,
    pub metadata: serde_json::Value,
}

/// Provider-side customer record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCustomer {
    pub id: String,
    pub email: Option<String>,
}

/// Request to charge a payment at the provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPaymentRequest {
    pub amount: i64,
    pub currency: String,
    pub customer_id: Option<String>,
    pub payment_method_id: Option<String>,
    pub description: Option<String>,
    /// Caller-supplied token making a repeated create a no-op on retry
    pub idempotency_key: Option<String>,
    pub metadata: serde_json::Value,
}

/// Provider-side payment record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPayment {
    pub id: String,
    pub status: ProviderPaymentStatus,
    pub amount: i64,
    pub currency: String,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
}

/// Provider-side refund record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRefund {
    pub id: String,
    pub payment_id: String,
    pub amount: i64,
    pub status: ProviderPaymentStatus,
}

/// Request to create a subscription at the provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSubscriptionRequest {
    pub customer_id: String,
    pub price_id: String,
    pub quantity: i64,
    pub trial_days: Option<i32>,
    pub metadata: serde_json::Value,
}

/// Provider-side subscription record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSubscription {
    pub id: String,
    pub status: String,
    pub current_period_end: Option<DateTime<Utc>>,
}

/// Request to open a hosted checkout session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCheckoutRequest {
    pub customer_id: Option<String>,
    pub price_id: String,
    pub quantity: i64,
    pub success_url: String,
    pub cancel_url: String,
    pub metadata: serde_json::Value,
}

/// Provider-side checkout session record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCheckout {
    pub id: String,
    pub url: Option<String>,
    pub status: String,
}

/// Request to create a price at the provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPriceRequest {
    pub currency: String,
    pub unit_amount: i64,
    pub interval: String,
    pub interval_count: i32,
    pub product_name: String,
}

/// Provider-side price record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPrice {
    pub id: String,
    pub currency: String,
    pub unit_amount: i64,
}

/// A verified, parsed webhook event from the provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    pub event_type: String,
    pub data: serde_json::Value,
    pub created: DateTime<Utc>,
}

/// Webhook sub-port: raw body + signature header in, verified event out
pub trait WebhookVerifier: Send + Sync {
    /// Constant-time signature check. True when no secret is configured
    /// (development mode).
    fn verify_signature(&self, payload: &[u8], signature: &str) -> bool;

    /// Verify then parse. Fails with `InvalidSignature`,
    /// `WebhookReplayRejected` or `MalformedWebhook`.
    fn construct_event(&self, payload: &[u8], signature: &str) -> Result<ProviderEvent>;
}

/// Payment provider port
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    // Customers
    async fn create_customer(&self, request: ProviderCustomerRequest) -> Result<ProviderCustomer>;
    async fn get_customer(&self, customer_id: &str) -> Result<ProviderCustomer>;

    // Payments
    async fn create_payment(&self, request: ProviderPaymentRequest) -> Result<ProviderPayment>;
    async fn capture_payment(&self, payment_id: &str, amount: Option<i64>)
        -> Result<ProviderPayment>;
    async fn refund_payment(
        &self,
        payment_id: &str,
        amount: Option<i64>,
        reason: Option<&str>,
    ) -> Result<ProviderRefund>;
    async fn cancel_payment(&self, payment_id: &str) -> Result<ProviderPayment>;
    async fn get_payment(&self, payment_id: &str) -> Result<ProviderPayment>;

    // Subscriptions
    async fn create_subscription(
        &self,
        request: ProviderSubscriptionRequest,
    ) -> Result<ProviderSubscription>;
    async fn cancel_subscription(&self, subscription_id: &str) -> Result<ProviderSubscription>;

    // Checkout sessions
    async fn create_checkout_session(
        &self,
        request: ProviderCheckoutRequest,
    ) -> Result<ProviderCheckout>;

    // Prices
    async fn create_price(&self, request: ProviderPriceRequest) -> Result<ProviderPrice>;

    /// Webhook verifier for this provider's inbound notifications
    fn webhooks(&self) -> &dyn WebhookVerifier;
}
