//! Billing entity models
//!
//! Plain data records for every entity the engine persists. Lifecycle
//! bookkeeping lives in first-class typed fields with explicit nullable
//! semantics; the free-form `metadata` maps carry host data only.

pub mod audit;
pub mod customer;
pub mod entitlement;
pub mod invoice;
pub mod payment;
pub mod plan;
pub mod promo;
pub mod subscription;
pub mod usage;
pub mod vendor;
pub mod webhook;

pub use audit::{ActorType, AuditLog, IdempotencyRecord};
pub use customer::{
    Address, CreateCustomerRequest, Customer, CustomerPreferences, UpdateCustomerRequest,
};
pub use entitlement::{
    CustomerLimit, EntitlementDefinition, EntitlementGrant, GrantSource, LimitDefinition,
};
pub use invoice::{Invoice, InvoiceLine, InvoiceStatus};
pub use payment::{
    BankAccountSummary, CardSummary, CreatePaymentRequest, Payment, PaymentMethod,
    PaymentMethodKind, PaymentMethodStatus, PaymentStatus, Refund, RefundStatus,
};
pub use plan::{BillingInterval, CreatePlanRequest, Plan, PlanFeature, Price};
pub use promo::{
    AutomaticDiscount, DiscountCondition, DiscountKind, PromoCode, StackingMode,
};
pub use subscription::{
    CancelSubscriptionRequest, CreateSubscriptionRequest, Subscription, SubscriptionAddOn,
    SubscriptionStatus, UpdateSubscriptionRequest,
};
pub use usage::{UsageAction, UsageRecord};
pub use vendor::{AddOn, PayoutSchedule, PayoutStatus, Vendor, VendorPayout};
pub use webhook::{WebhookEventRecord, WebhookEventStatus};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Payment provider variants the engine can drive
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "provider_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Stripe,
    MercadoPago,
    Mock,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Stripe => write!(f, "stripe"),
            ProviderKind::MercadoPago => write!(f, "mercadopago"),
            ProviderKind::Mock => write!(f, "mock"),
        }
    }
}

impl ProviderKind {
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "stripe" => Some(ProviderKind::Stripe),
            "mercadopago" | "mercado_pago" | "mp" => Some(ProviderKind::MercadoPago),
            "mock" => Some(ProviderKind::Mock),
            _ => None,
        }
    }
}
