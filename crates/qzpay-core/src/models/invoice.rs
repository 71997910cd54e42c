//! Invoice model
//!
//! Totals obey `total = subtotal - discount + tax` and, while the invoice is
//! open, `amount_paid + amount_remaining = total`. An invoice is paid exactly
//! when nothing remains and `paid_at` is set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Invoice status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "invoice_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Void,
    Uncollectible,
}

/// Invoice line item. `amount = quantity * unit_amount`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub invoice_id: Uuid,
    pub description: String,
    pub quantity: i64,
    pub unit_amount: i64,
    pub amount: i64,
    pub price_id: Option<Uuid>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub proration: bool,
}

impl InvoiceLine {
    pub fn new(invoice_id: Uuid, description: impl Into<String>, quantity: i64, unit_amount: i64) -> Self {
        Self {
            invoice_id,
            description: description.into(),
            quantity,
            unit_amount,
            amount: quantity * unit_amount,
            price_id: None,
            period_start: None,
            period_end: None,
            proration: false,
        }
    }

    pub fn with_period(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.period_start = Some(start);
        self.period_end = Some(end);
        self
    }

    pub fn with_price(mut self, price_id: Uuid) -> Self {
        self.price_id = Some(price_id);
        self
    }
}

/// Invoice entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub subscription_id: Option<Uuid>,

    /// Unique human-facing number, e.g. "INV-000042"
    pub number: String,

    pub status: InvoiceStatus,
    pub currency: String,

    pub subtotal: i64,
    pub discount: i64,
    pub tax: i64,
    pub total: i64,
    pub amount_paid: i64,
    pub amount_remaining: i64,

    pub lines: Vec<InvoiceLine>,

    pub due_date: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub voided_at: Option<DateTime<Utc>>,

    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,

    pub livemode: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    /// Build an open invoice from lines; totals are derived, never supplied.
    pub fn open(
        id: Uuid,
        customer_id: Uuid,
        subscription_id: Option<Uuid>,
        number: String,
        currency: String,
        lines: Vec<InvoiceLine>,
        discount: i64,
        tax: i64,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if discount < 0 || tax < 0 {
            return Err(Error::validation("discount and tax must be non-negative"));
        }

        let subtotal: i64 = lines.iter().map(|l| l.amount).sum();
        if discount > subtotal {
            return Err(Error::validation("discount cannot exceed subtotal"));
        }

        let total = subtotal - discount + tax;

        Ok(Self {
            id,
            customer_id,
            subscription_id,
            number,
            status: InvoiceStatus::Open,
            currency,
            subtotal,
            discount,
            tax,
            total,
            amount_paid: 0,
            amount_remaining: total,
            lines,
            due_date: None,
            paid_at: None,
            voided_at: None,
            period_start: None,
            period_end: None,
            livemode: false,
            created_at: now,
            updated_at: now,
        })
    }

    /// Record a payment toward the invoice. Flips to `Paid` when nothing
    /// remains.
    pub fn apply_payment(&mut self, amount: i64, now: DateTime<Utc>) -> Result<()> {
        if !matches!(self.status, InvoiceStatus::Open) {
            return Err(Error::validation(format!(
                "Invoice {} is not open",
                self.number
            )));
        }
        if amount <= 0 {
            return Err(Error::validation("payment amount must be positive"));
        }
        if amount > self.amount_remaining {
            return Err(Error::validation("payment exceeds amount remaining"));
        }

        self.amount_paid += amount;
        self.amount_remaining -= amount;
        self.updated_at = now;

        if self.amount_remaining == 0 {
            self.status = InvoiceStatus::Paid;
            self.paid_at = Some(now);
        }

        Ok(())
    }

    /// Void an unpaid invoice
    pub fn void(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            InvoiceStatus::Draft | InvoiceStatus::Open | InvoiceStatus::Uncollectible => {
                self.status = InvoiceStatus::Void;
                self.voided_at = Some(now);
                self.updated_at = now;
                Ok(())
            }
            InvoiceStatus::Paid => Err(Error::validation("cannot void a paid invoice")),
            InvoiceStatus::Void => Ok(()),
        }
    }

    /// Check the arithmetic invariants hold
    pub fn invariants_hold(&self) -> bool {
        let totals = self.total == self.subtotal - self.discount + self.tax;
        let balance = match self.status {
            InvoiceStatus::Open => self.amount_paid + self.amount_remaining == self.total,
            InvoiceStatus::Paid => self.amount_remaining == 0 && self.paid_at.is_some(),
            _ => true,
        };
        totals && balance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_invoice() -> Invoice {
        let id = Uuid::new_v4();
        let lines = vec![InvoiceLine::new(id, "Subscription renewal - basic", 2, 1500)];
        Invoice::open(
            id,
            Uuid::new_v4(),
            None,
            "INV-000001".to_string(),
            "USD".to_string(),
            lines,
            500,
            200,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_totals_derived_from_lines() {
        let invoice = sample_invoice();
        assert_eq!(invoice.subtotal, 3000);
        assert_eq!(invoice.total, 2700);
        assert_eq!(invoice.amount_remaining, 2700);
        assert!(invoice.invariants_hold());
    }

    #[test]
    fn test_partial_then_full_payment() {
        let mut invoice = sample_invoice();
        invoice.apply_payment(700, Utc::now()).unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Open);
        assert_eq!(invoice.amount_remaining, 2000);
        assert!(invoice.invariants_hold());

        invoice.apply_payment(2000, Utc::now()).unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert!(invoice.paid_at.is_some());
        assert!(invoice.invariants_hold());
    }

    #[test]
    fn test_overpayment_rejected() {
        let mut invoice = sample_invoice();
        assert!(invoice.apply_payment(5000, Utc::now()).is_err());
    }

    #[test]
    fn test_cannot_void_paid() {
        let mut invoice = sample_invoice();
        invoice.apply_payment(2700, Utc::now()).unwrap();
        assert!(invoice.void(Utc::now()).is_err());
    }

    #[test]
    fn test_discount_over_subtotal_rejected() {
        let id = Uuid::new_v4();
        let lines = vec![InvoiceLine::new(id, "one-off", 1, 100)];
        let result = Invoice::open(
            id,
            Uuid::new_v4(),
            None,
            "INV-000002".to_string(),
            "USD".to_string(),
            lines,
            200,
            0,
            Utc::now(),
        );
        assert!(result.is_err());
    }
}
