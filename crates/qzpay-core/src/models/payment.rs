//! Payment, refund and payment-method models
//!
//! Amounts are integer minor currency units. Card material lives at the
//! provider; only display summaries (last4, brand, expiry) are kept here.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;
use validator::Validate;

use super::ProviderKind;

/// Payment status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "payment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Processing,
    RequiresAction,
    RequiresCapture,
    Succeeded,
    Failed,
    Canceled,
    Disputed,
    Refunded,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Succeeded
                | PaymentStatus::Failed
                | PaymentStatus::Canceled
                | PaymentStatus::Refunded
        )
    }
}

/// Payment entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub subscription_id: Option<Uuid>,

    pub amount: i64,
    pub currency: String,

    // FX bookkeeping: the amount in the account's base currency, when the
    // host supplied an exchange rate
    pub base_amount: Option<i64>,
    pub base_currency: Option<String>,
    pub exchange_rate: Option<Decimal>,

    pub status: PaymentStatus,
    pub provider: ProviderKind,
    pub provider_payment_id: Option<String>,
    pub payment_method_id: Option<Uuid>,

    pub refunded_amount: i64,

    pub failure_code: Option<String>,
    pub failure_message: Option<String>,

    pub idempotency_key: Option<String>,

    pub metadata: serde_json::Value,
    pub livemode: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn is_fully_refunded(&self) -> bool {
        self.refunded_amount >= self.amount
    }
}

/// Refund status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "refund_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Succeeded,
    Failed,
    Canceled,
}

/// Refund entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Refund {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub status: RefundStatus,
    pub reason: Option<String>,
    pub provider_refund_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Payment method kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "payment_method_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodKind {
    Card,
    BankAccount,
    Wallet,
    Other,
}

/// Payment method status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "payment_method_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodStatus {
    Active,
    Expired,
    Detached,
}

/// Card display summary; never the PAN
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CardSummary {
    pub last4: String,
    pub brand: String,
    pub exp_month: u32,
    pub exp_year: u32,
}

impl CardSummary {
    /// Whether the card is expired as of the given moment
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        use chrono::Datelike;
        let (year, month) = (now.year() as u32, now.month());
        self.exp_year < year || (self.exp_year == year && self.exp_month < month)
    }
}

/// Bank account display summary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BankAccountSummary {
    pub last4: String,
    pub bank_name: Option<String>,
}

/// Saved payment method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub kind: PaymentMethodKind,
    pub status: PaymentMethodStatus,

    /// At most one default per customer; `set_default` flips the rest off
    pub is_default: bool,

    pub card: Option<CardSummary>,
    pub bank_account: Option<BankAccountSummary>,
    pub billing_details: Option<super::Address>,

    /// provider -> provider-side payment method id
    pub provider_method_ids: HashMap<ProviderKind, String>,

    pub metadata: serde_json::Value,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Create payment request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreatePaymentRequest {
    pub customer_id: Uuid,
    pub subscription_id: Option<Uuid>,

    #[validate(range(min = 1))]
    pub amount: i64,

    #[validate(length(min = 3, max = 3))]
    pub currency: String,

    pub payment_method_id: Option<Uuid>,
    pub idempotency_key: Option<String>,

    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_card_expiry() {
        let card = CardSummary {
            last4: "4242".to_string(),
            brand: "visa".to_string(),
            exp_month: 6,
            exp_year: 2025,
        };

        let before = Utc.with_ymd_and_hms(2025, 6, 15, 0, 0, 0).unwrap();
        assert!(!card.is_expired(before));

        let after = Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap();
        assert!(card.is_expired(after));
    }

    #[test]
    fn test_fully_refunded() {
        let mut payment = Payment {
            id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            subscription_id: None,
            amount: 1000,
            currency: "USD".to_string(),
            base_amount: None,
            base_currency: None,
            exchange_rate: None,
            status: PaymentStatus::Succeeded,
            provider: ProviderKind::Mock,
            provider_payment_id: None,
            payment_method_id: None,
            refunded_amount: 400,
            failure_code: None,
            failure_message: None,
            idempotency_key: None,
            metadata: serde_json::Value::Null,
            livemode: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert!(!payment.is_fully_refunded());
        payment.refunded_amount = 1000;
        assert!(payment.is_fully_refunded());
    }
}
